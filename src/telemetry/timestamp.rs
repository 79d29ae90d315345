use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

/// Where a reading's timestamp came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampQuality {
    /// Parsed from the payload.
    Parsed,
    /// Payload had no timestamp; the receipt time was substituted.
    Received,
    /// Payload carried a timestamp nothing could parse; pinned to the epoch.
    Unparsed,
}

const ZONED_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%z",
];

const DASHED_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

const SLASHED_FORMATS: &[&str] = &[
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y/%m/%dT%H:%M:%S",
    "%Y/%m/%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M",
    "%Y/%m/%dT%H:%M",
];

type Strategy = fn(&str) -> Option<DateTime<Utc>>;

const STRATEGIES: [Strategy; 3] = [parse_strict, parse_slashed, parse_extracted];

/// Tolerant timestamp parse. Strategies run in order and the first valid
/// instant wins. Naive timestamps are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    STRATEGIES.iter().find_map(|strategy| strategy(raw))
}

pub(crate) fn resolve(
    raw: Option<&Value>,
    received_at: DateTime<Utc>,
) -> (DateTime<Utc>, TimestampQuality) {
    let parsed = match raw {
        None | Some(Value::Null) => return (received_at, TimestampQuality::Received),
        Some(Value::String(text)) if text.trim().is_empty() => {
            return (received_at, TimestampQuality::Received)
        }
        Some(Value::String(text)) => parse_timestamp(text),
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|ms| ms as i64))
            .and_then(millis_to_dt),
        Some(_) => None,
    };
    match parsed {
        Some(ts) => (ts, TimestampQuality::Parsed),
        None => {
            tracing::debug!(raw = ?raw, "unparseable reading timestamp; pinning to epoch");
            (DateTime::<Utc>::UNIX_EPOCH, TimestampQuality::Unparsed)
        }
    }
}

fn millis_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn parse_strict(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ZONED_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(raw, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    parse_naive(raw, DASHED_FORMATS, "%Y-%m-%d")
}

fn parse_slashed(raw: &str) -> Option<DateTime<Utc>> {
    let slashed = raw.replace('-', "/");
    parse_naive(&slashed, SLASHED_FORMATS, "%Y/%m/%d")
}

fn parse_extracted(raw: &str) -> Option<DateTime<Utc>> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(\d{4})\D(\d{1,2})\D(\d{1,2})(?:\D+(\d{1,2}):(\d{1,2})(?::(\d{1,2}))?)?",
            )
            .ok()
        })
        .as_ref()?;
    let caps = pattern.captures(raw)?;
    let group = |idx: usize| caps.get(idx).and_then(|m| m.as_str().parse::<u32>().ok());

    let year = caps.get(1)?.as_str().parse::<i32>().ok()?;
    let date = NaiveDate::from_ymd_opt(year, group(2)?, group(3)?)?;
    let time = date.and_hms_opt(
        group(4).unwrap_or(0),
        group(5).unwrap_or(0),
        group(6).unwrap_or(0),
    )?;
    Some(Utc.from_utc_datetime(&time))
}

fn parse_naive(raw: &str, formats: &[&str], date_only: &str) -> Option<DateTime<Utc>> {
    for format in formats {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    let date = NaiveDate::parse_from_str(raw, date_only).ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}
