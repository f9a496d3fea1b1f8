use crate::errors::{Error, Result};
use crate::model::{FieldValue, RawTelemetry, TelemetryRecord};
use chrono::SubsecRound;

const DEVICE_ID_MAX_LEN: usize = 128;

/// Inclusive bounds for well-known numeric fields.
const FIELD_RANGES: &[(&str, f64, f64)] = &[
    ("latitude", -90.0, 90.0),
    ("longitude", -180.0, 180.0),
    ("battery", 0.0, 100.0),
    ("battery_level", 0.0, 100.0),
    ("speed", 0.0, f64::MAX),
];

/// Keys the device views write next to the flattened fields.
const RESERVED_FIELDS: &[&str] = &["last_update"];

/// Parses a transport payload. `topic_device` is used when the payload
/// itself carries no device id.
pub fn parse_payload(payload: &[u8], topic_device: Option<&str>) -> Result<TelemetryRecord> {
    let mut raw = serde_json::from_slice::<RawTelemetry>(payload)
        .map_err(|e| Error::validation(format!("JSON parse error: {}", e)))?;

    if raw.device_id.is_none() {
        raw.device_id = topic_device.map(str::to_string);
    }

    validate(raw)
}

/// Validates a raw reading and turns it into an immutable record.
pub fn validate(raw: RawTelemetry) -> Result<TelemetryRecord> {
    let device_id = match raw.device_id {
        Some(id) => id.trim().to_string(),
        None => return Err(Error::validation("Device ID is missing")),
    };

    if device_id.is_empty() {
        return Err(Error::validation("Device ID cannot be empty"));
    }

    if device_id.len() > DEVICE_ID_MAX_LEN {
        return Err(Error::validation(format!(
            "Device ID longer than {} bytes",
            DEVICE_ID_MAX_LEN
        )));
    }

    // The store keeps microseconds; finer readings would share a row there.
    let timestamp = raw
        .timestamp
        .ok_or_else(|| Error::validation(format!("Timestamp is missing for {}", device_id)))?
        .trunc_subsecs(6);

    if let Some(name) = RESERVED_FIELDS.iter().find(|n| raw.fields.contains_key(**n)) {
        return Err(Error::validation(format!("Field {} is reserved", name)));
    }

    for (name, value) in &raw.fields {
        if let FieldValue::Number(n) = value {
            if !n.is_finite() {
                return Err(Error::validation(format!("Field {} is not finite", name)));
            }
        }
    }

    for (name, min, max) in FIELD_RANGES {
        if let Some(value) = raw.fields.get(*name) {
            let n = value.as_f64().ok_or_else(|| {
                Error::validation(format!("Field {} must be numeric", name))
            })?;
            if n < *min || n > *max {
                return Err(Error::validation(format!(
                    "{} {} out of range [{}, {}]",
                    name, n, min, max
                )));
            }
        }
    }

    Ok(TelemetryRecord::new(device_id, timestamp, raw.fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Fields;
    use chrono::{TimeZone, Utc};

    fn raw(device_id: Option<&str>, fields: &[(&str, FieldValue)]) -> RawTelemetry {
        RawTelemetry {
            device_id: device_id.map(str::to_string),
            timestamp: Some(Utc::now()),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<Fields>(),
        }
    }

    #[test]
    fn test_valid_telemetry() {
        let telemetry = raw(
            Some("dev-1"),
            &[
                ("latitude", FieldValue::Number(48.85)),
                ("longitude", FieldValue::Number(2.35)),
                ("battery", FieldValue::Number(80.0)),
                ("network", FieldValue::Text("lte".to_string())),
            ],
        );

        let record = validate(telemetry).unwrap();
        assert_eq!(record.device_id(), "dev-1");
        assert_eq!(record.fields().len(), 4);
    }

    #[test]
    fn test_reserved_field_rejected() {
        let telemetry = raw(
            Some("dev-1"),
            &[("last_update", FieldValue::Text("yesterday".to_string()))],
        );
        let err = validate(telemetry).unwrap_err();
        assert!(err.to_string().contains("last_update"));
    }

    #[test]
    fn test_timestamp_truncated_to_micros() {
        let base = Utc.timestamp_opt(1_700_000_000, 123_456_000).unwrap();
        let mut a = raw(Some("dev-1"), &[]);
        a.timestamp = Some(base + chrono::Duration::nanoseconds(100));
        let mut b = raw(Some("dev-1"), &[]);
        b.timestamp = Some(base + chrono::Duration::nanoseconds(600));

        let a = validate(a).unwrap();
        let b = validate(b).unwrap();
        assert_eq!(a.timestamp(), base);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_invalid_latitude() {
        let telemetry = raw(Some("dev-1"), &[("latitude", FieldValue::Number(91.0))]);
        assert!(validate(telemetry).is_err());
    }

    #[test]
    fn test_invalid_battery() {
        let telemetry = raw(Some("dev-1"), &[("battery", FieldValue::Number(150.0))]);
        assert!(validate(telemetry).is_err());
    }

    #[test]
    fn test_non_numeric_known_field() {
        let telemetry = raw(
            Some("dev-1"),
            &[("longitude", FieldValue::Text("east".to_string()))],
        );
        assert!(validate(telemetry).is_err());
    }

    #[test]
    fn test_empty_device_id() {
        assert!(validate(raw(Some(""), &[])).is_err());
        assert!(validate(raw(Some("   "), &[])).is_err());
        assert!(validate(raw(None, &[])).is_err());
    }

    #[test]
    fn test_missing_timestamp() {
        let mut telemetry = raw(Some("dev-1"), &[]);
        telemetry.timestamp = None;
        assert!(matches!(validate(telemetry), Err(Error::Validation(_))));
    }

    #[test]
    fn test_payload_uses_topic_device_as_fallback() {
        let payload = br#"{"timestamp":"2024-05-01T10:00:00Z","speed":12.0}"#;

        let record = parse_payload(payload, Some("truck-7")).unwrap();
        assert_eq!(record.device_id(), "truck-7");

        assert!(parse_payload(payload, None).is_err());
    }

    #[test]
    fn test_payload_rejects_nested_values() {
        let payload = br#"{"device_id":"d","timestamp":"2024-05-01T10:00:00Z","gps":{"lat":1}}"#;
        assert!(parse_payload(payload, None).is_err());
    }

    #[test]
    fn test_payload_invalid_json() {
        assert!(matches!(
            parse_payload(b"invalid json", None),
            Err(Error::Validation(_))
        ));
    }
}
