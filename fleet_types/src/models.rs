//! Fleet domain models carried by the live channels.
//!
//! Each model keeps unrecognised fields in `extra` so new backend fields never break decoding.

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::entity::Entity;
use crate::entity::EntityId;
use crate::entity::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    Available,
    Full,
    InService,
    OutOfService,
    Maintenance,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    #[serde(deserialize_with = "lenient_id")]
    pub id: EntityId,
    pub version: Version,
    #[serde(default)]
    pub fleet_id: Option<String>,
    #[serde(default)]
    pub plate: Option<String>,
    pub status: VehicleStatus,
    #[serde(default)]
    pub route_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleLocation {
    #[serde(deserialize_with = "lenient_id")]
    pub id: EntityId,
    pub version: Version,
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lng", alias = "lon")]
    pub longitude: f64,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed_kmh: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleEta {
    #[serde(deserialize_with = "lenient_id")]
    pub id: EntityId,
    pub version: Version,
    #[serde(default)]
    pub stop_id: Option<String>,
    pub eta_minutes: f64,
    #[serde(default)]
    pub distance_km: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredRoute {
    #[serde(deserialize_with = "lenient_id")]
    pub id: EntityId,
    pub version: Version,
    pub name: String,
    #[serde(default)]
    pub vehicle_id: Option<String>,
    #[serde(default)]
    pub stops: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceHealth {
    Online,
    Offline,
    Fault,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(deserialize_with = "lenient_id")]
    pub id: EntityId,
    pub version: Version,
    #[serde(default)]
    pub vehicle_id: Option<String>,
    pub status: DeviceHealth,
    #[serde(default)]
    pub battery_percent: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(deserialize_with = "lenient_id")]
    pub id: EntityId,
    pub version: Version,
    #[serde(default)]
    pub company_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub severity: Severity,
    /// Roles allowed to see the notification; empty means everyone
    #[serde(default)]
    pub target_roles: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

macro_rules! impl_entity {
    ($($model:ty),+ $(,)?) => {
        $(
            impl Entity for $model {
                fn entity_id(&self) -> EntityId {
                    self.id.clone()
                }

                fn version(&self) -> Version {
                    self.version
                }
            }
        )+
    };
}

impl_entity!(Vehicle, VehicleLocation, VehicleEta, DeclaredRoute, Device, Notification);

fn lenient_id<'de, D>(deserializer: D) -> Result<EntityId, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(EntityId::new(s)),
        Value::Number(n) => Ok(EntityId::new(n.to_string())),
        other => Err(serde::de::Error::custom(format!("expected string or number id, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::entity::EntitySnapshot;

    #[test]
    fn test_vehicle_decodes_from_snapshot() {
        let snapshot = EntitySnapshot::from_value(json!({"id": "v1", "version": 2, "status": "full", "capacity": 40})).unwrap();
        let vehicle: Vehicle = snapshot.decode().unwrap();
        assert_eq!(vehicle.status, VehicleStatus::Full);
        assert_eq!(vehicle.extra["capacity"], 40);
        assert_eq!(vehicle.entity_id().as_str(), "v1");
    }

    #[test]
    fn test_unknown_status_is_tolerated() {
        let vehicle: Vehicle = serde_json::from_value(json!({"id": 3, "version": 1, "status": "teleporting"})).unwrap();
        assert_eq!(vehicle.status, VehicleStatus::Unknown);
        assert_eq!(vehicle.id.as_str(), "3");
    }

    #[test]
    fn test_location_aliases() {
        let location: VehicleLocation = serde_json::from_value(json!({"id": "v1", "version": 9, "lat": 52.5, "lng": 13.4})).unwrap();
        assert_eq!(location.latitude, 52.5);
        assert_eq!(location.longitude, 13.4);
    }

    #[test]
    fn test_entity_round_trip_through_snapshot() {
        let notification = Notification {
            id: EntityId::new("n1"),
            version: 4,
            company_id: Some("c1".to_string()),
            title: "Bus delayed".to_string(),
            message: String::new(),
            severity: Severity::Warning,
            target_roles: vec!["dispatcher".to_string()],
            extra: Map::new(),
        };
        let snapshot = EntitySnapshot::from_entity(&notification).unwrap();
        assert_eq!(snapshot.version, 4);
        assert_eq!(snapshot.decode::<Notification>().unwrap(), notification);
    }
}
