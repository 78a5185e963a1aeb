//! Turns raw frames into reconciled state.
//!
//! Frames are parsed here and nowhere else. Anything that cannot be understood is logged and
//! dropped; the transport's delivery loop never sees an error.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use fleet_types::Delta;
use fleet_types::EntitySnapshot;
use fleet_types::ServerMessage;
use fleet_types::Topic;
use fleet_types::models::Notification;
use fleet_ws::Frame;
use parking_lot::Mutex;
use parking_lot::RwLock;
use rapidhash::RapidHashMap;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::errors::SyncError;
use crate::notifications::NotificationFilter;
use crate::notifications::NotificationSink;
use crate::reconciler::Reconciler;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not JSON, not an object, or the wrong shape for its type
    Malformed,
    UnknownType,
    /// No topic could be resolved for the frame
    NoTopic,
    NoSubscribers,
    /// A notification the current user should not see
    Filtered,
    /// Known shape but unusable payload, e.g. a location without a version
    InvalidPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Applied(Topic),
    /// Stale or duplicate; state did not change
    Unchanged(Topic),
    /// Held back while the endpoint is being repaired
    Buffered,
    Control,
    Dropped(DropReason),
}

#[derive(Debug, Default)]
pub struct RouterStats {
    applied: AtomicU64,
    unchanged: AtomicU64,
    dropped: AtomicU64,
    buffered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStatsSnapshot {
    pub applied: u64,
    pub unchanged: u64,
    pub dropped: u64,
    pub buffered: u64,
}

impl RouterStats {
    fn record(&self, outcome: &RouteOutcome) {
        let counter = match outcome {
            RouteOutcome::Applied(_) => &self.applied,
            RouteOutcome::Unchanged(_) => &self.unchanged,
            RouteOutcome::Buffered => &self.buffered,
            RouteOutcome::Dropped(_) => &self.dropped,
            RouteOutcome::Control => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
        }
    }
}

struct Repair {
    /// Id of the transport that started the repair
    owner: u64,
    frames: Vec<Frame>,
}

pub struct Router {
    registry: Arc<Registry>,
    reconciler: Arc<Mutex<Reconciler>>,
    filter: RwLock<NotificationFilter>,
    sinks: RwLock<Vec<Arc<dyn NotificationSink>>>,
    // Endpoints under repair, with the frames that arrived meanwhile
    repairing: Mutex<RapidHashMap<String, Repair>>,
    stats: RouterStats,
}

impl Router {
    pub fn new(registry: Arc<Registry>, reconciler: Arc<Mutex<Reconciler>>, filter: NotificationFilter) -> Self {
        Self {
            registry,
            reconciler,
            filter: RwLock::new(filter),
            sinks: RwLock::new(Vec::new()),
            repairing: Mutex::new(RapidHashMap::default()),
            stats: RouterStats::default(),
        }
    }

    pub fn set_filter(&self, filter: NotificationFilter) {
        *self.filter.write() = filter;
    }

    pub fn add_sink(&self, sink: Arc<dyn NotificationSink>) {
        self.sinks.write().push(sink);
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        self.stats.snapshot()
    }

    /// Route one inbound frame from the endpoint at `url`
    pub fn route(&self, url: &str, frame: &Frame) -> RouteOutcome {
        {
            let mut repairing = self.repairing.lock();
            if let Some(repair) = repairing.get_mut(url) {
                repair.frames.push(frame.clone());
                self.stats.record(&RouteOutcome::Buffered);
                return RouteOutcome::Buffered;
            }
        }

        let outcome = self.dispatch(url, frame);
        self.stats.record(&outcome);
        outcome
    }

    fn dispatch(&self, url: &str, frame: &Frame) -> RouteOutcome {
        let Some(text) = frame.as_text() else {
            warn!("Dropping non-UTF-8 binary frame ({} bytes) on {url}", frame.len());
            return RouteOutcome::Dropped(DropReason::Malformed);
        };

        let mut value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                warn!("Dropping unparseable frame on {url}: {err}");
                return RouteOutcome::Dropped(DropReason::Malformed);
            }
        };
        let Value::Object(object) = &mut value else {
            warn!("Dropping non-object frame on {url}");
            return RouteOutcome::Dropped(DropReason::Malformed);
        };

        let explicit_topic = object.get("topic").and_then(Value::as_str).map(Topic::from);
        match object.get("type") {
            Some(Value::String(kind)) if ServerMessage::is_known_type(kind) => {}
            Some(Value::String(kind)) => {
                debug!("Dropping frame of unknown type {kind:?} on {url}");
                return RouteOutcome::Dropped(DropReason::UnknownType);
            }
            Some(other) => {
                warn!("Dropping frame with non-string type {other} on {url}");
                return RouteOutcome::Dropped(DropReason::Malformed);
            }
            // Untyped `{topic, entity}` frames are plain updates
            None if object.contains_key("entity") => {
                object.insert("type".to_string(), Value::String("update".to_string()));
            }
            None => {
                debug!("Dropping untyped frame on {url}");
                return RouteOutcome::Dropped(DropReason::UnknownType);
            }
        }

        let message: ServerMessage = match serde_json::from_value(value) {
            Ok(message) => message,
            Err(err) => {
                warn!("Dropping malformed frame on {url}: {err}");
                return RouteOutcome::Dropped(DropReason::Malformed);
            }
        };
        if matches!(message, ServerMessage::Pong) {
            return RouteOutcome::Control;
        }

        let Some(topic) = explicit_topic.or_else(|| message.topic_hint()).or_else(|| self.sole_topic(url)) else {
            debug!("Dropping frame on {url}: no topic");
            return RouteOutcome::Dropped(DropReason::NoTopic);
        };
        if !self.registry.has_channel(&topic) {
            debug!("Dropping frame for {topic}: no subscribers");
            return RouteOutcome::Dropped(DropReason::NoSubscribers);
        }

        let notification = match &message {
            ServerMessage::Notification { data, .. } => match data.decode::<Notification>() {
                Ok(notification) if self.filter.read().should_show(&notification) => Some(notification),
                Ok(_) => return RouteOutcome::Dropped(DropReason::Filtered),
                Err(err) => {
                    warn!("Dropping notification on {url}: {err}");
                    return RouteOutcome::Dropped(DropReason::InvalidPayload);
                }
            },
            _ => None,
        };

        let delta = match message.into_delta() {
            Ok(Some(delta)) => delta,
            Ok(None) => return RouteOutcome::Control,
            Err(err) => {
                warn!("Dropping frame for {topic}: {err}");
                return RouteOutcome::Dropped(DropReason::InvalidPayload);
            }
        };

        if !self.apply(&topic, delta) {
            return RouteOutcome::Unchanged(topic);
        }

        if let Some(notification) = notification {
            let sinks = self.sinks.read().clone();
            for sink in &sinks {
                sink.notify(&notification);
            }
        }
        RouteOutcome::Applied(topic)
    }

    fn sole_topic(&self, url: &str) -> Option<Topic> {
        let mut topics = self.registry.topics_for(url);
        if topics.len() == 1 { topics.pop() } else { None }
    }

    /// Merge a delta into the topic and, if state changed, fan the reconciled state out
    pub fn apply(&self, topic: &Topic, delta: Delta) -> bool {
        let snapshot = {
            let mut reconciler = self.reconciler.lock();
            if !reconciler.apply(topic, delta) {
                return false;
            }
            reconciler.snapshot(topic)
        };
        self.registry.fan_out(&snapshot);
        true
    }

    /// Apply a REST snapshot to a live channel. Ignored if the channel was recreated or destroyed since `generation`.
    pub fn apply_snapshot(&self, topic: &Topic, generation: u64, entities: Vec<EntitySnapshot>) -> bool {
        if self.registry.channel_generation(topic) != Some(generation) {
            debug!("Discarding late snapshot for {topic}");
            return false;
        }
        self.apply(topic, Delta::Replace(entities))
    }

    /// Merge a REST snapshot into a channel that already holds pushed state. Each entity is
    /// upserted, so nothing newer is replaced and nothing missing from the snapshot is removed.
    pub fn merge_snapshot(&self, topic: &Topic, generation: u64, entities: Vec<EntitySnapshot>) -> usize {
        if self.registry.channel_generation(topic) != Some(generation) {
            debug!("Discarding late snapshot for {topic}");
            return 0;
        }
        entities.into_iter().map(|entity| self.apply(topic, Delta::Upsert(entity))).filter(|changed| *changed).count()
    }

    /// Start holding back frames from the endpoint until [`Router::finish_repair`].
    /// `owner` is the id of the transport being repaired; frames held for an older transport are discarded.
    pub fn begin_repair(&self, url: &str, owner: u64) {
        let mut repairing = self.repairing.lock();
        match repairing.get_mut(url) {
            Some(repair) if repair.owner == owner => {}
            _ => {
                repairing.insert(url.to_string(), Repair { owner, frames: Vec::new() });
            }
        }
    }

    pub fn is_repairing(&self, url: &str) -> bool {
        self.repairing.lock().contains_key(url)
    }

    /// Replay held-back frames in arrival order and resume live routing. Returns the number replayed.
    pub fn finish_repair(&self, url: &str) -> usize {
        let mut replayed = 0;
        loop {
            let frames = {
                let mut repairing = self.repairing.lock();
                match repairing.get_mut(url) {
                    Some(repair) if !repair.frames.is_empty() => std::mem::take(&mut repair.frames),
                    Some(_) => {
                        repairing.remove(url);
                        break;
                    }
                    None => break,
                }
            };
            for frame in &frames {
                let outcome = self.dispatch(url, frame);
                self.stats.record(&outcome);
            }
            replayed += frames.len();
        }
        if replayed > 0 {
            debug!("Replayed {replayed} frames on {url} after repair");
        }
        replayed
    }

    /// Drop the repair state of `url` if transport `owner` started it. Returns whether it did.
    pub fn abort_repair(&self, url: &str, owner: u64) -> bool {
        let mut repairing = self.repairing.lock();
        if repairing.get(url).is_some_and(|repair| repair.owner == owner) {
            repairing.remove(url);
            return true;
        }
        false
    }

    /// Refetch every repairable channel on the endpoint, then replay what arrived meanwhile.
    ///
    /// Failed fetches leave the channel's last state in place and are reported to its subscribers.
    pub async fn repair_endpoint(&self, url: &str) -> Vec<(Topic, Arc<SyncError>)> {
        let targets = self.registry.repair_targets(url);
        let fetches = targets.iter().map(|target| (target.fetcher)());
        let results = futures::future::join_all(fetches).await;

        let mut failures = Vec::new();
        for (target, result) in targets.into_iter().zip(results) {
            match result {
                Ok(entities) => {
                    self.apply_snapshot(&target.topic, target.generation, entities);
                }
                Err(err) => {
                    warn!("Snapshot repair of {} failed: {err}", target.topic);
                    let err = Arc::new(err);
                    self.registry.notify_error(&target.topic, &err);
                    failures.push((target.topic, err));
                }
            }
        }

        self.finish_repair(url);
        failures
    }
}
