use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single sensor value. The field schema is open, so values are typed
/// loosely: numbers (position, motion, battery), strings (network type,
/// carrier) and flags (connected, charging).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

pub type Fields = BTreeMap<String, FieldValue>;

/// Telemetry payload as it arrives from the transport, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTelemetry {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub fields: Fields,
}

/// An accepted telemetry reading. Built only through validation and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    device_id: String,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    fields: Fields,
}

impl TelemetryRecord {
    pub(crate) fn new(device_id: String, timestamp: DateTime<Utc>, fields: Fields) -> Self {
        Self {
            device_id,
            timestamp,
            fields,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Natural key used by the store to ignore replayed rows.
    pub fn key(&self) -> (&str, DateTime<Utc>) {
        (&self.device_id, self.timestamp)
    }
}

/// Records accumulated between two flushes, handed to the store as one write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Batch {
    records: Vec<TelemetryRecord>,
}

impl Batch {
    pub fn new(records: Vec<TelemetryRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TelemetryRecord] {
        &self.records
    }
}

/// Latest known state of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub device_id: String,
    /// Source timestamp of the newest record reflected here.
    pub timestamp: DateTime<Utc>,
    /// Server time of the last accepted update.
    pub updated_at: DateTime<Utc>,
    pub fields: Fields,
}

/// JSON view of a device for `/api/devices` and stream bootstrap.
///
/// `latitude` and `longitude` are always present (null until the device
/// reports a position).
#[derive(Debug, Clone, Serialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Fields,
}

impl From<&DeviceState> for DeviceEntry {
    fn from(state: &DeviceState) -> Self {
        let mut fields = state.fields.clone();
        let latitude = fields.remove("latitude").and_then(|v| v.as_f64());
        let longitude = fields.remove("longitude").and_then(|v| v.as_f64());
        Self {
            device_id: state.device_id.clone(),
            latitude,
            longitude,
            timestamp: state.timestamp,
            last_update: state.updated_at,
            fields,
        }
    }
}

/// Change event pushed to stream subscribers: the device and the fields the
/// accepted record carried.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceChange {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Fields,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_payload_flattens_fields() {
        let raw: RawTelemetry = serde_json::from_str(
            r#"{"device_id":"X","timestamp":"2024-05-01T10:00:00Z","latitude":52.1,"network":"lte","charging":true}"#,
        )
        .unwrap();

        assert_eq!(raw.device_id.as_deref(), Some("X"));
        assert!(raw.timestamp.is_some());
        assert_eq!(raw.fields.get("latitude"), Some(&FieldValue::Number(52.1)));
        assert_eq!(
            raw.fields.get("network"),
            Some(&FieldValue::Text("lte".to_string()))
        );
        assert_eq!(raw.fields.get("charging"), Some(&FieldValue::Bool(true)));
        assert!(!raw.fields.contains_key("device_id"));
    }

    #[test]
    fn test_record_serializes_flat() {
        let mut fields = Fields::new();
        fields.insert("speed".to_string(), FieldValue::Number(3.5));
        let ts = "2024-05-01T10:00:00Z".parse().unwrap();
        let record = TelemetryRecord::new("dev-1".to_string(), ts, fields);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["device_id"], "dev-1");
        assert_eq!(json["speed"], 3.5);

        let back: TelemetryRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_device_entry_always_has_position_keys() {
        let state = DeviceState {
            device_id: "dev-2".to_string(),
            timestamp: Utc::now(),
            updated_at: Utc::now(),
            fields: Fields::new(),
        };

        let json = serde_json::to_value(DeviceEntry::from(&state)).unwrap();
        let obj = json.as_object().unwrap();
        assert!(obj.contains_key("latitude"));
        assert!(obj.contains_key("longitude"));
        assert!(json["latitude"].is_null());
    }
}
