use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Map;
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::errors::Result;
use crate::errors::TypesError;

/// Monotonic entity version: a sequence number or a millisecond timestamp
pub type Version = u64;

/// Identifier of a domain object. Backends send both numeric and string ids, both end up here as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Arc<str>);

impl EntityId {
    pub fn new(id: impl AsRef<str>) -> Self {
        EntityId(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(EntityId::new(s)),
            Value::Number(n) => Some(EntityId::new(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId::new(value)
    }
}

/// Domain objects that can flow through the reconciler
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn entity_id(&self) -> EntityId;

    fn version(&self) -> Version;
}

/// Last-known-good state of one domain object.
///
/// `payload` is the full JSON object, including its `id` and `version` fields, so it can be
/// decoded back into the caller's model type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub version: Version,
    pub payload: Value,
}

impl EntitySnapshot {
    /// Build a snapshot from a JSON object carrying `id` and `version` (or a timestamp)
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(object) = value else {
            return Err(TypesError::NotAnObject);
        };
        let id = object.get("id").and_then(EntityId::from_json).ok_or(TypesError::MissingField("id"))?;
        let version = version_of(&object)?.ok_or(TypesError::MissingField("version"))?;

        Ok(Self { id, version, payload: Value::Object(object) })
    }

    /// Build a snapshot from an id and version carried outside the payload, e.g. in a message envelope
    pub fn from_parts(id: EntityId, version: Version, payload: Value) -> Result<Self> {
        let mut object = match payload {
            Value::Object(object) => object,
            Value::Null => Map::new(),
            _ => return Err(TypesError::NotAnObject),
        };
        object.insert("id".to_string(), Value::String(id.to_string()));
        object.insert("version".to_string(), Value::from(version));

        Ok(Self { id, version, payload: Value::Object(object) })
    }

    pub fn from_entity<T: Entity>(entity: &T) -> Result<Self> {
        Self::from_parts(entity.entity_id(), entity.version(), serde_json::to_value(entity)?)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.payload)?)
    }
}

impl TryFrom<Value> for EntitySnapshot {
    type Error = TypesError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

impl From<EntitySnapshot> for Value {
    fn from(snapshot: EntitySnapshot) -> Self {
        snapshot.payload
    }
}

/// Read the version of a JSON object: explicit `version`, else `timestamp` / `updated_at`
/// as epoch milliseconds or an RFC 3339 string.
pub fn version_of(object: &Map<String, Value>) -> Result<Option<Version>> {
    if let Some(value) = object.get("version") {
        return value.as_u64().map(Some).ok_or_else(|| TypesError::InvalidField { field: "version", reason: value.to_string() });
    }

    for field in ["timestamp", "updated_at"] {
        match object.get(field) {
            Some(Value::Number(n)) => {
                return n.as_u64().map(Some).ok_or_else(|| TypesError::InvalidField { field, reason: n.to_string() });
            }
            Some(Value::String(s)) => return parse_rfc3339_ms(s).map(Some).map_err(|reason| TypesError::InvalidField { field, reason }),
            _ => continue,
        }
    }

    Ok(None)
}

fn parse_rfc3339_ms(raw: &str) -> std::result::Result<Version, String> {
    let parsed = OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| err.to_string())?;
    let millis = parsed.unix_timestamp_nanos() / 1_000_000;
    u64::try_from(millis).map_err(|_| format!("timestamp before epoch: {raw}"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_snapshot_from_object() {
        let snapshot = EntitySnapshot::from_value(json!({"id": "v1", "version": 2, "status": "full"})).unwrap();
        assert_eq!(snapshot.id.as_str(), "v1");
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.payload["status"], "full");
    }

    #[test]
    fn test_entity_id_serializes_as_plain_string() {
        let id = EntityId::new("v9");
        assert_eq!(serde_json::to_value(&id).unwrap(), json!("v9"));
        assert_eq!(serde_json::from_value::<EntityId>(json!("v9")).unwrap(), id);
    }

    #[test]
    fn test_numeric_id_is_accepted() {
        let snapshot = EntitySnapshot::from_value(json!({"id": 17, "version": 1})).unwrap();
        assert_eq!(snapshot.id.as_str(), "17");
    }

    #[test]
    fn test_timestamp_fallback_for_version() {
        let snapshot = EntitySnapshot::from_value(json!({"id": "e", "timestamp": 1_700_000_000_000u64})).unwrap();
        assert_eq!(snapshot.version, 1_700_000_000_000);

        let snapshot = EntitySnapshot::from_value(json!({"id": "e", "updated_at": "1970-01-01T00:00:01Z"})).unwrap();
        assert_eq!(snapshot.version, 1_000);
    }

    #[test]
    fn test_missing_fields() {
        assert!(matches!(EntitySnapshot::from_value(json!({"version": 1})), Err(TypesError::MissingField("id"))));
        assert!(matches!(EntitySnapshot::from_value(json!({"id": "x"})), Err(TypesError::MissingField("version"))));
        assert!(matches!(EntitySnapshot::from_value(json!([1, 2])), Err(TypesError::NotAnObject)));
    }

    #[test]
    fn test_from_parts_overrides_payload_fields() {
        let snapshot = EntitySnapshot::from_parts(EntityId::new("bus-9"), 5, json!({"id": "stale", "eta_minutes": 4})).unwrap();
        assert_eq!(snapshot.payload["id"], "bus-9");
        assert_eq!(snapshot.payload["version"], 5);
        assert_eq!(snapshot.payload["eta_minutes"], 4);
    }

    #[test]
    fn test_serde_uses_payload_shape() {
        let snapshot: EntitySnapshot = serde_json::from_str(r#"{"id":"r1","version":3,"name":"Line 3"}"#).unwrap();
        let encoded = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(encoded, json!({"id": "r1", "version": 3, "name": "Line 3"}));
    }
}
