use crate::error::FetchError;
use crate::telemetry::{normalize, SensorReading};
use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use serde_json::{Map, Value};
use std::io::Cursor;

/// What a response body holds, judged from its declared content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Json,
    Csv,
    Spreadsheet,
    Unknown,
}

impl BodyKind {
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let Some(raw) = content_type else {
            return BodyKind::Unknown;
        };
        let mime = raw
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if mime == "application/json" || mime.ends_with("+json") || mime == "text/json" {
            BodyKind::Json
        } else if mime == "text/csv" || mime == "application/csv" {
            BodyKind::Csv
        } else if mime.contains("spreadsheetml")
            || mime.contains("ms-excel")
            || mime == "application/octet-stream"
        {
            BodyKind::Spreadsheet
        } else {
            BodyKind::Unknown
        }
    }

    pub fn is_binary(self) -> bool {
        matches!(self, BodyKind::Csv | BodyKind::Spreadsheet)
    }
}

/// Parses an exported CSV: the header row names the fields and every data
/// row goes through the normalizer as a flat payload.
pub fn parse_csv(bytes: &[u8], machine: &str) -> Result<Vec<SensorReading>, FetchError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(bytes);
    let headers: Vec<String> = reader
        .headers()
        .map_err(|err| FetchError::Format(format!("csv header: {err}")))?
        .iter()
        .map(header_key)
        .collect();

    let mut readings = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| FetchError::Format(format!("csv row: {err}")))?;
        let row: Map<String, Value> = headers
            .iter()
            .zip(record.iter())
            .filter(|(_, cell)| !cell.is_empty())
            .map(|(header, cell)| (header.clone(), Value::String(cell.to_string())))
            .collect();
        if !row.is_empty() {
            readings.push(normalize(&Value::Object(row), machine));
        }
    }
    Ok(readings)
}

/// Parses the first worksheet of an XLSX workbook the same way as CSV.
pub fn parse_xlsx(bytes: &[u8], machine: &str) -> Result<Vec<SensorReading>, FetchError> {
    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|err| FetchError::Format(format!("xlsx: {err}")))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| FetchError::Format("xlsx: workbook has no sheets".to_string()))?
        .map_err(|err| FetchError::Format(format!("xlsx sheet: {err}")))?;

    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Ok(Vec::new());
    };
    let headers: Vec<String> = header_row
        .iter()
        .map(|cell| header_key(&cell.to_string()))
        .collect();

    let mut readings = Vec::new();
    for row in rows {
        let payload: Map<String, Value> = headers
            .iter()
            .zip(row.iter())
            .filter_map(|(header, cell)| cell_value(cell).map(|value| (header.clone(), value)))
            .collect();
        if !payload.is_empty() {
            readings.push(normalize(&Value::Object(payload), machine));
        }
    }
    Ok(readings)
}

fn header_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace([' ', '-'], "_")
}

fn cell_value(cell: &Data) -> Option<Value> {
    match cell {
        Data::Empty | Data::Error(_) => None,
        Data::Int(value) => Some(Value::from(*value)),
        Data::Float(value) => Some(Value::from(*value)),
        Data::Bool(value) => Some(Value::Bool(*value)),
        Data::String(value) | Data::DateTimeIso(value) | Data::DurationIso(value) => {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| Value::String(trimmed.to_string()))
        }
        Data::DateTime(value) => value
            .as_datetime()
            .map(|naive| Value::String(naive.format("%Y-%m-%d %H:%M:%S").to_string())),
    }
}
