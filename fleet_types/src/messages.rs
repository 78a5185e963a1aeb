use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde_json::Value;

use crate::entity::EntityId;
use crate::entity::EntitySnapshot;
use crate::entity::Version;
use crate::entity::version_of;
use crate::errors::Result;
use crate::errors::TypesError;
use crate::topic::Topic;

/// Inbound frames, tagged by their `type` field.
///
/// Frames without a `type` but with `topic` + `entity` are handled by the router as a plain update.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Update {
        #[serde(default)]
        topic: Option<Topic>,
        entity: EntitySnapshot,
    },
    Snapshot {
        #[serde(default)]
        topic: Option<Topic>,
        entities: Vec<EntitySnapshot>,
    },
    VehicleUpdate {
        #[serde(default, deserialize_with = "optional_id_string")]
        fleet_id: Option<String>,
        data: EntitySnapshot,
    },
    LocationUpdate {
        #[serde(deserialize_with = "id_string")]
        vehicle_id: String,
        data: Value,
    },
    EtaUpdate {
        #[serde(deserialize_with = "id_string")]
        vehicle_id: String,
        data: Value,
    },
    RouteUpdate {
        data: EntitySnapshot,
    },
    DeletedRoute {
        #[serde(deserialize_with = "id_string")]
        route_id: String,
        #[serde(default)]
        version: Option<Version>,
    },
    DeviceStatus {
        #[serde(default, deserialize_with = "optional_id_string")]
        company_id: Option<String>,
        data: EntitySnapshot,
    },
    Notification {
        #[serde(default, deserialize_with = "optional_id_string")]
        company_id: Option<String>,
        data: EntitySnapshot,
    },
    Pong,
}

/// Effect of one inbound message on a channel's entity map
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Upsert(EntitySnapshot),
    Replace(Vec<EntitySnapshot>),
    Remove { id: EntityId, version: Option<Version> },
}

impl ServerMessage {
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "update",
        "snapshot",
        "vehicle_update",
        "location_update",
        "eta_update",
        "route_update",
        "deleted_route",
        "device_status",
        "notification",
        "pong",
    ];

    pub fn is_known_type(kind: &str) -> bool {
        Self::KNOWN_TYPES.contains(&kind)
    }

    /// Topic named or implied by the message itself, if any
    pub fn topic_hint(&self) -> Option<Topic> {
        match self {
            ServerMessage::Update { topic, .. } | ServerMessage::Snapshot { topic, .. } => topic.clone(),
            ServerMessage::VehicleUpdate { fleet_id, .. } => fleet_id.as_ref().map(Topic::fleet_vehicles),
            ServerMessage::LocationUpdate { vehicle_id, .. } => Some(Topic::vehicle_location(vehicle_id)),
            ServerMessage::EtaUpdate { vehicle_id, .. } => Some(Topic::vehicle_eta(vehicle_id)),
            ServerMessage::RouteUpdate { .. } | ServerMessage::DeletedRoute { .. } => Some(Topic::declared_routes()),
            ServerMessage::DeviceStatus { company_id, .. } => company_id.as_ref().map(Topic::company_devices),
            ServerMessage::Notification { company_id, .. } => company_id.as_ref().map(Topic::notifications),
            ServerMessage::Pong => None,
        }
    }

    /// Convert into a reconciler delta; `None` for control messages
    pub fn into_delta(self) -> Result<Option<Delta>> {
        let delta = match self {
            ServerMessage::Update { entity, .. } => Delta::Upsert(entity),
            ServerMessage::Snapshot { entities, .. } => Delta::Replace(entities),
            ServerMessage::VehicleUpdate { data, .. }
            | ServerMessage::RouteUpdate { data }
            | ServerMessage::DeviceStatus { data, .. }
            | ServerMessage::Notification { data, .. } => Delta::Upsert(data),
            ServerMessage::LocationUpdate { vehicle_id, data } | ServerMessage::EtaUpdate { vehicle_id, data } => {
                let version = match &data {
                    Value::Object(object) => version_of(object)?.ok_or(TypesError::MissingField("version"))?,
                    _ => return Err(TypesError::NotAnObject),
                };
                Delta::Upsert(EntitySnapshot::from_parts(EntityId::new(vehicle_id), version, data)?)
            }
            ServerMessage::DeletedRoute { route_id, version } => Delta::Remove { id: EntityId::new(route_id), version },
            ServerMessage::Pong => return Ok(None),
        };

        Ok(Some(delta))
    }
}

/// Outbound control frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topic: Topic },
    Unsubscribe { topic: Topic },
    Ping,
}

impl ClientFrame {
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn id_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected string or number id, got {other}"))),
    }
}

fn optional_id_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!("expected string or number id, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_eta_update_becomes_versioned_upsert() {
        let message: ServerMessage =
            serde_json::from_value(json!({"type": "eta_update", "vehicle_id": 45, "data": {"eta_minutes": 3, "timestamp": 1000}})).unwrap();
        assert_eq!(message.topic_hint(), Some(Topic::vehicle_eta(45)));

        let Some(Delta::Upsert(snapshot)) = message.into_delta().unwrap() else {
            panic!("expected upsert");
        };
        assert_eq!(snapshot.id.as_str(), "45");
        assert_eq!(snapshot.version, 1000);
        assert_eq!(snapshot.payload["eta_minutes"], 3);
    }

    #[test]
    fn test_deleted_route_becomes_removal() {
        let message: ServerMessage = serde_json::from_value(json!({"type": "deleted_route", "route_id": "r-12"})).unwrap();
        assert_eq!(message.topic_hint(), Some(Topic::declared_routes()));
        assert_eq!(message.into_delta().unwrap(), Some(Delta::Remove { id: EntityId::new("r-12"), version: None }));
    }

    #[test]
    fn test_location_without_version_is_rejected() {
        let message: ServerMessage =
            serde_json::from_value(json!({"type": "location_update", "vehicle_id": "v1", "data": {"lat": 1.0}})).unwrap();
        assert!(matches!(message.into_delta(), Err(TypesError::MissingField("version"))));
    }

    #[test]
    fn test_pong_has_no_delta() {
        let message: ServerMessage = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert!(message.into_delta().unwrap().is_none());
    }

    #[test]
    fn test_client_frame_encoding() {
        let frame = ClientFrame::Subscribe { topic: Topic::fleet_vehicles(42) };
        assert_eq!(frame.to_text().unwrap(), r#"{"type":"subscribe","topic":"vehicles:fleet:42"}"#);
    }

    #[test]
    fn test_known_types() {
        assert!(ServerMessage::is_known_type("eta_update"));
        assert!(!ServerMessage::is_known_type("weather_alert"));
    }
}
