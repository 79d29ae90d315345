use super::RawPayload;
use serde_json::Value;

/// Canonical numeric measurement on a [`super::SensorReading`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Temperature,
    Humidity,
    Pm25,
    Pm10,
    Pm25Average,
    Pm10Average,
    Co2,
    Tvoc,
}

impl Field {
    pub const ALL: [Field; 8] = [
        Field::Temperature,
        Field::Humidity,
        Field::Pm25,
        Field::Pm10,
        Field::Pm25Average,
        Field::Pm10Average,
        Field::Co2,
        Field::Tvoc,
    ];

    /// Ordered lookup chain; the first accessor yielding a finite number wins.
    pub fn accessors(self) -> &'static [Accessor] {
        use Accessor::{Flat, Nested};
        match self {
            Field::Temperature => &[
                Nested("temperature"),
                Nested("temperatu"),
                Flat("temperature"),
                Flat("temperatu"),
            ],
            Field::Humidity => &[Nested("humidity"), Flat("humidity")],
            Field::Pm25 => &[Nested("pm25"), Flat("pm25")],
            Field::Pm10 => &[Nested("pm10"), Flat("pm10")],
            Field::Pm25Average => &[
                Nested("pm25_average"),
                Nested("pm25_ave"),
                Flat("pm25_average"),
                Flat("pm25_ave"),
            ],
            Field::Pm10Average => &[
                Nested("pm10_average"),
                Nested("pm10_ave"),
                Flat("pm10_average"),
                Flat("pm10_ave"),
            ],
            Field::Co2 => &[Nested("co2"), Flat("co2")],
            Field::Tvoc => &[Nested("tvoc"), Flat("tvoc")],
        }
    }
}

/// Where to look for a key: inside the `values` object of a nested payload,
/// or at the top level of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accessor {
    Nested(&'static str),
    Flat(&'static str),
}

impl Accessor {
    pub fn lookup<'a>(self, payload: &RawPayload<'a>) -> Option<&'a Value> {
        match self {
            Accessor::Nested(key) => payload.values()?.get(key),
            Accessor::Flat(key) => payload.envelope().get(key),
        }
    }
}

pub(crate) const MACHINE_ACCESSORS: &[Accessor] = &[
    Accessor::Flat("machine"),
    Accessor::Flat("machine_id"),
    Accessor::Flat("machineId"),
    Accessor::Nested("machine"),
];

pub(crate) const TIMESTAMP_ACCESSORS: &[Accessor] =
    &[Accessor::Flat("timestamp"), Accessor::Nested("timestamp")];

pub(crate) const STATUS_ACCESSORS: &[Accessor] =
    &[Accessor::Flat("status"), Accessor::Nested("status")];

pub(crate) fn first_value<'a>(
    payload: &RawPayload<'a>,
    accessors: &[Accessor],
) -> Option<&'a Value> {
    accessors
        .iter()
        .filter_map(|accessor| accessor.lookup(payload))
        .find(|value| !value.is_null())
}

/// Resolves a numeric field, defaulting to `0.0` when no accessor matches.
pub fn resolve_number(payload: &RawPayload<'_>, field: Field) -> f64 {
    field
        .accessors()
        .iter()
        .filter_map(|accessor| accessor.lookup(payload))
        .find_map(as_number)
        .unwrap_or(0.0)
}

fn as_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

pub(crate) fn first_text(payload: &RawPayload<'_>, accessors: &[Accessor]) -> Option<String> {
    accessors
        .iter()
        .filter_map(|accessor| accessor.lookup(payload))
        .find_map(|value| match value {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|text| !text.is_empty())
}
