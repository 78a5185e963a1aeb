use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::Result;
use crate::errors::TypesError;

/// Name of a logical live stream, e.g. `vehicles:fleet:42` or `eta:vehicle:45`.
///
/// Cheap to clone; used as the key of channels, subscriptions and reconciler state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(Arc<str>);

impl Topic {
    pub fn new(name: impl AsRef<str>) -> Self {
        Topic(Arc::from(name.as_ref()))
    }

    pub fn fleet_vehicles(fleet_id: impl fmt::Display) -> Self {
        TopicKind::FleetVehicles { fleet_id: fleet_id.to_string() }.topic()
    }

    pub fn vehicle_location(vehicle_id: impl fmt::Display) -> Self {
        TopicKind::VehicleLocation { vehicle_id: vehicle_id.to_string() }.topic()
    }

    pub fn vehicle_eta(vehicle_id: impl fmt::Display) -> Self {
        TopicKind::VehicleEta { vehicle_id: vehicle_id.to_string() }.topic()
    }

    pub fn declared_routes() -> Self {
        TopicKind::DeclaredRoutes.topic()
    }

    pub fn company_devices(company_id: impl fmt::Display) -> Self {
        TopicKind::CompanyDevices { company_id: company_id.to_string() }.topic()
    }

    pub fn notifications(company_id: impl fmt::Display) -> Self {
        TopicKind::Notifications { company_id: company_id.to_string() }.topic()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve the topic family, failing for names this client does not know how to serve
    pub fn kind(&self) -> Result<TopicKind> {
        self.as_str().parse()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Topic::new(value)
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        Topic(Arc::from(value))
    }
}

/// Known topic families and the server resources that back them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicKind {
    FleetVehicles { fleet_id: String },
    VehicleLocation { vehicle_id: String },
    VehicleEta { vehicle_id: String },
    DeclaredRoutes,
    CompanyDevices { company_id: String },
    Notifications { company_id: String },
}

impl TopicKind {
    pub fn topic(&self) -> Topic {
        Topic::from(self.to_string())
    }

    /// WebSocket endpoint path, relative to the configured WebSocket base URL
    pub fn ws_path(&self) -> String {
        match self {
            TopicKind::FleetVehicles { fleet_id } => format!("/ws/vehicles/all/{fleet_id}"),
            TopicKind::VehicleLocation { vehicle_id } => format!("/ws/vehicle/{vehicle_id}/location"),
            TopicKind::VehicleEta { vehicle_id } => format!("/ws/vehicle/{vehicle_id}/eta"),
            TopicKind::DeclaredRoutes => "/declared_routes/ws/routes".to_string(),
            TopicKind::CompanyDevices { company_id } => format!("/ws/iot/devices/{company_id}"),
            TopicKind::Notifications { company_id } => format!("/ws/notifications/{company_id}"),
        }
    }

    /// REST snapshot path, relative to the configured API base URL
    pub fn snapshot_path(&self) -> String {
        match self {
            TopicKind::FleetVehicles { fleet_id } => format!("/vehicles/fleet/{fleet_id}"),
            TopicKind::VehicleLocation { vehicle_id } => format!("/vehicles/{vehicle_id}/location"),
            TopicKind::VehicleEta { vehicle_id } => format!("/vehicles/{vehicle_id}/eta"),
            TopicKind::DeclaredRoutes => "/declared_routes".to_string(),
            TopicKind::CompanyDevices { company_id } => format!("/iot/devices/{company_id}"),
            TopicKind::Notifications { company_id } => format!("/notifications/{company_id}"),
        }
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicKind::FleetVehicles { fleet_id } => write!(f, "vehicles:fleet:{fleet_id}"),
            TopicKind::VehicleLocation { vehicle_id } => write!(f, "vehicle-locations:{vehicle_id}"),
            TopicKind::VehicleEta { vehicle_id } => write!(f, "eta:vehicle:{vehicle_id}"),
            TopicKind::DeclaredRoutes => f.write_str("routes:declared"),
            TopicKind::CompanyDevices { company_id } => write!(f, "devices:company:{company_id}"),
            TopicKind::Notifications { company_id } => write!(f, "notifications:{company_id}"),
        }
    }
}

impl FromStr for TopicKind {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        let segments: Vec<&str> = s.split(':').collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(TypesError::InvalidTopic(s.to_string()));
        }

        let id = |value: &str| value.to_string();
        match segments.as_slice() {
            ["vehicles", "fleet", fleet_id] => Ok(TopicKind::FleetVehicles { fleet_id: id(fleet_id) }),
            ["vehicle-locations", vehicle_id] => Ok(TopicKind::VehicleLocation { vehicle_id: id(vehicle_id) }),
            ["eta", "vehicle", vehicle_id] => Ok(TopicKind::VehicleEta { vehicle_id: id(vehicle_id) }),
            ["routes", "declared"] => Ok(TopicKind::DeclaredRoutes),
            ["devices", "company", company_id] => Ok(TopicKind::CompanyDevices { company_id: id(company_id) }),
            ["notifications", company_id] => Ok(TopicKind::Notifications { company_id: id(company_id) }),
            [family, ..] => Err(TypesError::UnknownTopicFamily(family.to_string())),
            [] => Err(TypesError::InvalidTopic(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_kind_round_trip_display() {
        let topic = Topic::fleet_vehicles(42);
        assert_eq!(topic.as_str(), "vehicles:fleet:42");
        assert_eq!(topic.kind().unwrap(), TopicKind::FleetVehicles { fleet_id: "42".to_string() });
    }

    #[test]
    fn test_topic_serializes_as_plain_string() {
        let topic = Topic::vehicle_eta(45);
        assert_eq!(serde_json::to_string(&topic).unwrap(), r#""eta:vehicle:45""#);
        assert_eq!(serde_json::from_str::<Topic>(r#""eta:vehicle:45""#).unwrap(), topic);
    }

    #[test]
    fn test_endpoint_paths() {
        let kind = Topic::vehicle_location("v7").kind().unwrap();
        assert_eq!(kind.ws_path(), "/ws/vehicle/v7/location");
        assert_eq!(kind.snapshot_path(), "/vehicles/v7/location");

        assert_eq!(Topic::declared_routes().kind().unwrap().ws_path(), "/declared_routes/ws/routes");
    }

    #[test]
    fn test_unknown_family_rejected() {
        let err = Topic::new("weather:berlin").kind().unwrap_err();
        assert!(matches!(err, TypesError::UnknownTopicFamily(family) if family == "weather"));
    }

    #[test]
    fn test_empty_segment_rejected() {
        assert!(matches!(Topic::new("vehicles:fleet:").kind(), Err(TypesError::InvalidTopic(_))));
        assert!(matches!(Topic::new("").kind(), Err(TypesError::InvalidTopic(_))));
    }
}
