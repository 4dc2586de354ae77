//! Decoding and validation of inbound meter payloads.
//!
//! Devices publish `{"data": "<json>"}` where `data` is a JSON-encoded
//! meter reading. Some gateways send `data` as an object instead; both are
//! accepted. Anything malformed is rejected here, before the differencer.

use energy_client::domain::MeterReading;
use time::macros::datetime;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not a JSON envelope: {0}")]
    Envelope(serde_json::Error),
    #[error("envelope has no 'data' field")]
    MissingData,
    #[error("'data' does not decode to a meter reading: {0}")]
    Reading(serde_json::Error),
    #[error("invalid reading: {0}")]
    Invalid(String),
}

#[derive(serde::Deserialize)]
struct DeviceEnvelope {
    data: Option<serde_json::Value>,
}

pub fn decode_payload(payload: &[u8]) -> Result<MeterReading, DecodeError> {
    let envelope: DeviceEnvelope = serde_json::from_slice(payload).map_err(DecodeError::Envelope)?;

    let reading: MeterReading = match envelope.data {
        Some(serde_json::Value::String(inner)) => {
            serde_json::from_str(&inner).map_err(DecodeError::Reading)?
        }
        Some(serde_json::Value::Null) | None => return Err(DecodeError::MissingData),
        Some(value) => serde_json::from_value(value).map_err(DecodeError::Reading)?,
    };

    validate_reading(&reading)?;
    Ok(reading)
}

/// Pure validation of a `MeterReading`.
///
/// Rules:
/// - every counter must be finite and non-negative.
/// - reading_time must be within a broad sanity window [2000-01-01, 2100-01-01).
/// - meter_serial_number must not be blank.
pub fn validate_reading(r: &MeterReading) -> Result<(), DecodeError> {
    if r.counters.values().iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(DecodeError::Invalid(
            "counters must be finite and non-negative".to_string(),
        ));
    }

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);

    if r.reading_time < min_ts || r.reading_time >= max_ts {
        return Err(DecodeError::Invalid(
            "reading_time out of allowed range".to_string(),
        ));
    }

    if r.meter_serial_number.trim().is_empty() {
        return Err(DecodeError::Invalid(
            "meter_serial_number is empty".to_string(),
        ));
    }

    Ok(())
}
