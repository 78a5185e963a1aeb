//! Per-topic entity maps merged from REST snapshots and pushed updates.
//!
//! An entity is only ever replaced by a strictly newer version; stale and duplicate updates are
//! discarded without producing a change.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_types::Delta;
use fleet_types::EntityId;
use fleet_types::EntitySnapshot;
use fleet_types::Topic;
use fleet_types::Version;
use rapidhash::RapidHashMap;
use tracing::debug;

/// Reconciled state of one topic as handed to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct TopicSnapshot {
    pub topic: Topic,
    /// Bumped on every change; lets consumers ignore states older than one they already have
    pub revision: u64,
    /// Entities sorted by id
    pub entities: Arc<Vec<EntitySnapshot>>,
}

#[derive(Debug, Default)]
struct TopicState {
    entities: BTreeMap<EntityId, EntitySnapshot>,
    // Highest version seen for removed entities, so a late update cannot resurrect them
    tombstones: RapidHashMap<EntityId, Version>,
    revision: u64,
}

impl TopicState {
    fn floor(&self, id: &EntityId) -> Option<Version> {
        let stored = self.entities.get(id).map(|entity| entity.version);
        let removed = self.tombstones.get(id).copied();
        stored.max(removed)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub applied: u64,
    pub discarded: u64,
    pub removed: u64,
    pub snapshots: u64,
}

#[derive(Debug, Default)]
pub struct Reconciler {
    topics: RapidHashMap<Topic, TopicState>,
    stats: ReconcilerStats,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the topic's entity map with a fresh snapshot. Returns true if the visible state changed.
    ///
    /// Entities missing from the snapshot are dropped. An entity the map already holds at a newer
    /// version than the snapshot's is kept.
    pub fn apply_snapshot(&mut self, topic: &Topic, entities: Vec<EntitySnapshot>) -> bool {
        self.stats.snapshots += 1;
        let state = self.topics.entry(topic.clone()).or_default();

        let mut next: BTreeMap<EntityId, EntitySnapshot> = BTreeMap::new();
        for incoming in entities {
            if state.tombstones.get(&incoming.id).is_some_and(|removed| incoming.version <= *removed) {
                continue;
            }
            let keep = match next.get(&incoming.id) {
                Some(existing) => incoming.version > existing.version,
                None => true,
            };
            if keep {
                next.insert(incoming.id.clone(), incoming);
            }
        }

        for (id, entity) in next.iter_mut() {
            if let Some(stored) = state.entities.get(id)
                && stored.version > entity.version
            {
                *entity = stored.clone();
            }
        }
        for id in next.keys() {
            state.tombstones.remove(id);
        }

        if next == state.entities {
            debug!("Snapshot for {topic} matched stored state ({} entities)", next.len());
            return false;
        }

        debug!("Snapshot for {topic}: {} -> {} entities", state.entities.len(), next.len());
        state.entities = next;
        state.revision += 1;
        true
    }

    /// Merge one pushed entity. Returns true if it replaced an older version or added a new entity.
    pub fn apply_update(&mut self, topic: &Topic, entity: EntitySnapshot) -> bool {
        let state = self.topics.entry(topic.clone()).or_default();

        if let Some(floor) = state.floor(&entity.id)
            && entity.version <= floor
        {
            debug!("Discarding {topic}/{} v{} (have v{floor})", entity.id, entity.version);
            self.stats.discarded += 1;
            return false;
        }

        state.tombstones.remove(&entity.id);
        state.entities.insert(entity.id.clone(), entity);
        state.revision += 1;
        self.stats.applied += 1;
        true
    }

    /// Remove an entity. A removal older than the stored version is ignored.
    pub fn apply_removal(&mut self, topic: &Topic, id: &EntityId, version: Option<Version>) -> bool {
        let state = self.topics.entry(topic.clone()).or_default();

        let stored = state.entities.get(id).map(|entity| entity.version);
        if let (Some(stored), Some(version)) = (stored, version)
            && version < stored
        {
            debug!("Ignoring stale removal of {topic}/{id} v{version} (have v{stored})");
            self.stats.discarded += 1;
            return false;
        }

        let tombstone = state.floor(id).max(version);
        if let Some(tombstone) = tombstone {
            state.tombstones.insert(id.clone(), tombstone);
        }

        if state.entities.remove(id).is_none() {
            return false;
        }
        state.revision += 1;
        self.stats.removed += 1;
        true
    }

    pub fn apply(&mut self, topic: &Topic, delta: Delta) -> bool {
        match delta {
            Delta::Upsert(entity) => self.apply_update(topic, entity),
            Delta::Replace(entities) => self.apply_snapshot(topic, entities),
            Delta::Remove { id, version } => self.apply_removal(topic, &id, version),
        }
    }

    /// Entities of the topic, sorted by id
    pub fn get_state(&self, topic: &Topic) -> Vec<EntitySnapshot> {
        self.topics.get(topic).map(|state| state.entities.values().cloned().collect()).unwrap_or_default()
    }

    pub fn snapshot(&self, topic: &Topic) -> TopicSnapshot {
        let revision = self.topics.get(topic).map(|state| state.revision).unwrap_or(0);
        TopicSnapshot { topic: topic.clone(), revision, entities: Arc::new(self.get_state(topic)) }
    }

    pub fn get(&self, topic: &Topic, id: &EntityId) -> Option<&EntitySnapshot> {
        self.topics.get(topic).and_then(|state| state.entities.get(id))
    }

    pub fn len(&self, topic: &Topic) -> usize {
        self.topics.get(topic).map(|state| state.entities.len()).unwrap_or(0)
    }

    /// Forget everything about a topic, when its channel is destroyed
    pub fn clear(&mut self, topic: &Topic) {
        self.topics.remove(topic);
    }

    pub fn clear_all(&mut self) {
        self.topics.clear();
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn entity(id: &str, version: Version, status: &str) -> EntitySnapshot {
        EntitySnapshot::from_value(json!({"id": id, "version": version, "status": status})).unwrap()
    }

    fn topic() -> Topic {
        Topic::fleet_vehicles(42)
    }

    #[test]
    fn test_update_requires_strictly_newer_version() {
        let mut reconciler = Reconciler::new();
        assert!(reconciler.apply_update(&topic(), entity("v1", 2, "available")));
        assert!(!reconciler.apply_update(&topic(), entity("v1", 2, "full")));
        assert!(!reconciler.apply_update(&topic(), entity("v1", 1, "full")));
        assert_eq!(reconciler.get(&topic(), &EntityId::new("v1")).unwrap().payload["status"], "available");
        assert_eq!(reconciler.stats().discarded, 2);
    }

    #[test]
    fn test_out_of_order_arrival_keeps_highest() {
        let mut reconciler = Reconciler::new();
        for version in [3, 1, 2] {
            reconciler.apply_update(&topic(), entity("x", version, &format!("s{version}")));
        }
        let state = reconciler.get_state(&topic());
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].version, 3);
        assert_eq!(state[0].payload["status"], "s3");
    }

    #[test]
    fn test_snapshot_replaces_and_drops_missing() {
        let mut reconciler = Reconciler::new();
        reconciler.apply_snapshot(&topic(), vec![entity("a", 1, "x"), entity("b", 1, "x")]);
        assert!(reconciler.apply_snapshot(&topic(), vec![entity("b", 2, "y")]));

        let state = reconciler.get_state(&topic());
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].id.as_str(), "b");
        assert_eq!(state[0].version, 2);
    }

    #[test]
    fn test_snapshot_older_than_stored_entity_keeps_stored() {
        let mut reconciler = Reconciler::new();
        reconciler.apply_update(&topic(), entity("v1", 7, "full"));
        reconciler.apply_snapshot(&topic(), vec![entity("v1", 5, "available")]);
        assert_eq!(reconciler.get(&topic(), &EntityId::new("v1")).unwrap().version, 7);
    }

    #[test]
    fn test_identical_snapshot_is_not_a_change() {
        let mut reconciler = Reconciler::new();
        assert!(reconciler.apply_snapshot(&topic(), vec![entity("a", 1, "x")]));
        let revision = reconciler.snapshot(&topic()).revision;
        assert!(!reconciler.apply_snapshot(&topic(), vec![entity("a", 1, "x")]));
        assert_eq!(reconciler.snapshot(&topic()).revision, revision);
    }

    #[test]
    fn test_snapshot_duplicates_keep_highest() {
        let mut reconciler = Reconciler::new();
        reconciler.apply_snapshot(&topic(), vec![entity("a", 4, "new"), entity("a", 2, "old")]);
        assert_eq!(reconciler.get(&topic(), &EntityId::new("a")).unwrap().payload["status"], "new");
    }

    #[test]
    fn test_removal_tombstone_blocks_resurrection() {
        let mut reconciler = Reconciler::new();
        let routes = Topic::declared_routes();
        reconciler.apply_update(&routes, entity("r1", 3, "active"));

        assert!(reconciler.apply_removal(&routes, &EntityId::new("r1"), None));
        assert!(!reconciler.apply_update(&routes, entity("r1", 2, "active")));
        assert!(!reconciler.apply_snapshot(&routes, vec![entity("r1", 3, "active")]));
        assert_eq!(reconciler.len(&routes), 0);

        assert!(reconciler.apply_update(&routes, entity("r1", 4, "recreated")));
        assert_eq!(reconciler.len(&routes), 1);
    }

    #[test]
    fn test_stale_removal_is_ignored() {
        let mut reconciler = Reconciler::new();
        let routes = Topic::declared_routes();
        reconciler.apply_update(&routes, entity("r1", 5, "active"));
        assert!(!reconciler.apply_removal(&routes, &EntityId::new("r1"), Some(4)));
        assert_eq!(reconciler.len(&routes), 1);
    }

    #[test]
    fn test_state_sorted_by_id_and_topics_isolated() {
        let mut reconciler = Reconciler::new();
        reconciler.apply_update(&topic(), entity("c", 1, "x"));
        reconciler.apply_update(&topic(), entity("a", 1, "x"));
        reconciler.apply_update(&Topic::fleet_vehicles(7), entity("b", 1, "x"));

        let ids: Vec<String> = reconciler.get_state(&topic()).iter().map(|entity| entity.id.to_string()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        reconciler.clear(&topic());
        assert!(reconciler.get_state(&topic()).is_empty());
        assert_eq!(reconciler.len(&Topic::fleet_vehicles(7)), 1);
    }

    proptest! {
        #[test]
        fn prop_merge_is_idempotent(versions in proptest::collection::vec(1u64..50, 1..20)) {
            let mut once = Reconciler::new();
            let mut twice = Reconciler::new();
            for version in &versions {
                let update = entity("e", *version, &version.to_string());
                once.apply_update(&topic(), update.clone());
                twice.apply_update(&topic(), update.clone());
                twice.apply_update(&topic(), update);
            }
            prop_assert_eq!(once.get_state(&topic()), twice.get_state(&topic()));
        }

        #[test]
        fn prop_final_state_is_max_version(versions in proptest::collection::vec(1u64..1_000, 1..30)) {
            let mut reconciler = Reconciler::new();
            for version in &versions {
                reconciler.apply_update(&topic(), entity("e", *version, &version.to_string()));
            }
            let max = versions.iter().copied().max().unwrap();
            let expected = max.to_string();
            let state = reconciler.get_state(&topic());
            prop_assert_eq!(state[0].version, max);
            prop_assert_eq!(state[0].payload["status"].as_str(), Some(expected.as_str()));
        }
    }
}
