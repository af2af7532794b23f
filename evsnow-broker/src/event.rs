use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

/// One property value out of an event's user- or system-property bag.
///
/// Event Hubs carries properties as a dynamic attribute bag (AMQP's
/// `application-properties` / `message-annotations`); this is the explicit
/// sum type stands in for that bag, per spec.md's REDESIGN FLAGS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl PropertyValue {
    /// Render this value the way it will be stored in Snowflake: bytes are
    /// decoded as UTF-8 when valid, otherwise hex-encoded, matching spec.md
    /// §3/§6 ("bytes must be decoded to UTF-8 where valid and otherwise
    /// hex-encoded for storage").
    pub fn to_storage_json(&self) -> serde_json::Value {
        match self {
            PropertyValue::String(s) => serde_json::Value::String(s.clone()),
            PropertyValue::Int(n) => serde_json::Value::from(*n),
            PropertyValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            PropertyValue::Bool(b) => serde_json::Value::Bool(*b),
            PropertyValue::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) => serde_json::Value::String(s.to_owned()),
                Err(_) => serde_json::Value::String(hex_encode(bytes)),
            },
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// A string-keyed bag of [`PropertyValue`]s, used for both the user
/// property map and the system property map of an [`Event`].
pub type PropertyMap = HashMap<String, PropertyValue>;

impl PropertyValue {
    /// Render a whole [`PropertyMap`] as a JSON object using
    /// [`PropertyValue::to_storage_json`] for each value. Used to build the
    /// `properties` / `system_properties` columns of a target row.
    pub fn to_storage_map(map: &PropertyMap) -> serde_json::Value {
        serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), v.to_storage_json()))
                .collect(),
        )
    }
}

/// An immutable record delivered by the broker.
///
/// Sequence numbers are monotonically increasing within a partition; the
/// broker never reorders or skips them for a live consumer. `offset` is
/// opaque and only meaningful to the broker that produced it (kept around
/// for diagnostics and checkpoint metadata, never parsed by the core).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub payload: Vec<u8>,
    pub partition_id: String,
    pub sequence_number: u64,
    pub offset: String,
    pub enqueued_time: DateTime<Utc>,
    pub properties: PropertyMap,
    pub system_properties: PropertyMap,
}

impl Event {
    /// Best-effort JSON view of the payload: parsed if it looks like JSON,
    /// otherwise stored as a base64-ish opaque string. Used when building
    /// the `event_body` column (spec.md §4.2).
    pub fn payload_as_json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or_else(|_| {
            serde_json::Value::String(match std::str::from_utf8(&self.payload) {
                Ok(s) => s.to_owned(),
                Err(_) => hex_encode(&self.payload),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_property_prefers_utf8() {
        let value = PropertyValue::Bytes(b"hello".to_vec());
        assert_eq!(value.to_storage_json(), serde_json::json!("hello"));
    }

    #[test]
    fn bytes_property_falls_back_to_hex() {
        let value = PropertyValue::Bytes(vec![0xff, 0x00, 0x10]);
        assert_eq!(value.to_storage_json(), serde_json::json!("ff0010"));
    }

    #[test]
    fn payload_parses_json_when_possible() {
        let event = Event {
            payload: br#"{"a":1}"#.to_vec(),
            partition_id: "0".into(),
            sequence_number: 1,
            offset: "100".into(),
            enqueued_time: Utc::now(),
            properties: PropertyMap::new(),
            system_properties: PropertyMap::new(),
        };
        assert_eq!(event.payload_as_json(), serde_json::json!({"a": 1}));
    }

    #[test]
    fn payload_falls_back_to_string_when_not_json() {
        let event = Event {
            payload: b"not json".to_vec(),
            partition_id: "0".into(),
            sequence_number: 1,
            offset: "100".into(),
            enqueued_time: Utc::now(),
            properties: PropertyMap::new(),
            system_properties: PropertyMap::new(),
        };
        assert_eq!(event.payload_as_json(), serde_json::json!("not json"));
    }
}
