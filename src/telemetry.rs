mod fields;
mod timestamp;

pub use fields::{resolve_number, Accessor, Field};
pub use timestamp::{parse_timestamp, TimestampQuality};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingStatus {
    Normal,
    Warning,
    Critical,
}

impl ReadingStatus {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "normal" => Some(ReadingStatus::Normal),
            "warning" => Some(ReadingStatus::Warning),
            "critical" => Some(ReadingStatus::Critical),
            _ => None,
        }
    }
}

/// Canonical sensor reading. Every measurement is populated; a missing
/// field reads as `0.0`. `status` is `None` when the source did not classify
/// the reading, which is not the same as `Normal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub timestamp: DateTime<Utc>,
    pub timestamp_quality: TimestampQuality,
    pub machine_id: String,
    pub temperature_c: f64,
    pub humidity_pct: f64,
    pub pm25: f64,
    pub pm10: f64,
    pub pm25_average: f64,
    pub pm10_average: f64,
    pub co2_ppm: f64,
    pub tvoc: f64,
    pub status: Option<ReadingStatus>,
}

impl SensorReading {
    pub fn value(&self, field: Field) -> f64 {
        match field {
            Field::Temperature => self.temperature_c,
            Field::Humidity => self.humidity_pct,
            Field::Pm25 => self.pm25,
            Field::Pm10 => self.pm10,
            Field::Pm25Average => self.pm25_average,
            Field::Pm10Average => self.pm10_average,
            Field::Co2 => self.co2_ppm,
            Field::Tvoc => self.tvoc,
        }
    }

    pub fn has_parsed_timestamp(&self) -> bool {
        self.timestamp_quality != TimestampQuality::Unparsed
    }
}

/// The two payload shapes the backend sends: snapshot rows carry their
/// measurements in a `values` object, push frames carry them at top level.
#[derive(Debug, Clone, Copy)]
pub enum RawPayload<'a> {
    Nested {
        envelope: &'a Map<String, Value>,
        values: &'a Map<String, Value>,
    },
    Flat(&'a Map<String, Value>),
}

impl<'a> RawPayload<'a> {
    /// Returns `None` for anything that is not a JSON object.
    pub fn classify(raw: &'a Value) -> Option<Self> {
        let envelope = raw.as_object()?;
        match envelope.get("values").and_then(Value::as_object) {
            Some(values) => Some(RawPayload::Nested { envelope, values }),
            None => Some(RawPayload::Flat(envelope)),
        }
    }

    pub fn envelope(&self) -> &'a Map<String, Value> {
        match self {
            RawPayload::Nested { envelope, .. } => envelope,
            RawPayload::Flat(envelope) => envelope,
        }
    }

    pub fn values(&self) -> Option<&'a Map<String, Value>> {
        match self {
            RawPayload::Nested { values, .. } => Some(values),
            RawPayload::Flat(_) => None,
        }
    }
}

/// Normalizes a raw payload using the current time as the receipt time.
pub fn normalize(raw: &Value, fallback_machine: &str) -> SensorReading {
    normalize_at(raw, fallback_machine, Utc::now())
}

/// Normalizes a raw payload of either shape. Never fails: non-object input
/// yields an all-zero reading for `fallback_machine`.
pub fn normalize_at(
    raw: &Value,
    fallback_machine: &str,
    received_at: DateTime<Utc>,
) -> SensorReading {
    let empty = Map::new();
    let payload = RawPayload::classify(raw).unwrap_or_else(|| {
        tracing::debug!(kind = json_kind(raw), "non-object telemetry payload");
        RawPayload::Flat(&empty)
    });

    let machine_id = fields::first_text(&payload, fields::MACHINE_ACCESSORS)
        .unwrap_or_else(|| fallback_machine.to_string());
    let (timestamp, timestamp_quality) = timestamp::resolve(
        fields::first_value(&payload, fields::TIMESTAMP_ACCESSORS),
        received_at,
    );
    let status = fields::first_text(&payload, fields::STATUS_ACCESSORS)
        .and_then(|raw| ReadingStatus::parse(&raw));

    SensorReading {
        timestamp,
        timestamp_quality,
        machine_id,
        temperature_c: resolve_number(&payload, Field::Temperature),
        humidity_pct: resolve_number(&payload, Field::Humidity),
        pm25: resolve_number(&payload, Field::Pm25),
        pm10: resolve_number(&payload, Field::Pm10),
        pm25_average: resolve_number(&payload, Field::Pm25Average),
        pm10_average: resolve_number(&payload, Field::Pm10Average),
        co2_ppm: resolve_number(&payload, Field::Co2),
        tvoc: resolve_number(&payload, Field::Tvoc),
        status,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
