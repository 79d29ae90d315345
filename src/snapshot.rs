mod artifact;

#[cfg(test)]
mod tests;

pub use artifact::{parse_csv, parse_xlsx, BodyKind};

use crate::error::FetchError;
use crate::telemetry::{normalize, SensorReading};
use bytes::Bytes;
use chrono::NaiveDateTime;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

pub const REQUEST_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeFormat {
    Json,
    Csv,
    Xlsx,
}

impl RangeFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            RangeFormat::Json => "json",
            RangeFormat::Csv => "csv",
            RangeFormat::Xlsx => "xlsx",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryArtifact {
    pub content_type: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RangeResult {
    Readings(Vec<SensorReading>),
    Artifact(BinaryArtifact),
}

/// Point-in-time reads against the REST telemetry API. Results keep the
/// source order; callers sort by `timestamp` when they need to.
#[derive(Clone)]
pub struct SnapshotFetcher {
    client: Client,
    base_url: Url,
    credential: String,
}

impl SnapshotFetcher {
    pub fn new(base_url: Url, credential: impl Into<String>) -> Result<Self, FetchError> {
        Self::with_timeout(base_url, credential, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: Url,
        credential: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(FetchError::Unreachable)?;
        Ok(Self {
            client,
            base_url: with_trailing_slash(base_url),
            credential: credential.into(),
        })
    }

    /// Latest `count` readings for one machine.
    pub async fn fetch_recent(
        &self,
        company_lab: &str,
        machine: &str,
        count: usize,
    ) -> Result<Vec<SensorReading>, FetchError> {
        let request_id = Uuid::new_v4();
        let query = [
            ("company_lab", company_lab.to_string()),
            ("machine", machine.to_string()),
            ("number", count.to_string()),
        ];
        let (kind, content_type, body) = self.get(request_id, "recent", &query).await?;
        let readings = decode_readings(kind, &content_type, body, machine)?;
        tracing::debug!(%request_id, company_lab, machine, count = readings.len(), "fetched recent readings");
        Ok(readings)
    }

    /// Readings between `start` and `end` (lab-local wall time). When JSON
    /// was asked for but a spreadsheet came back, the artifact is parsed
    /// locally; otherwise a binary artifact is returned untouched.
    pub async fn fetch_range(
        &self,
        company_lab: &str,
        machine: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
        format: RangeFormat,
    ) -> Result<RangeResult, FetchError> {
        let request_id = Uuid::new_v4();
        let query = [
            ("company_lab", company_lab.to_string()),
            ("machine", machine.to_string()),
            ("start", start.format(REQUEST_TIME_FORMAT).to_string()),
            ("end", end.format(REQUEST_TIME_FORMAT).to_string()),
            ("format", format.as_str().to_string()),
        ];
        let (kind, content_type, body) = self.get(request_id, "search", &query).await?;

        if format != RangeFormat::Json && kind.is_binary() {
            return Ok(RangeResult::Artifact(BinaryArtifact {
                content_type,
                bytes: body,
            }));
        }
        if format == RangeFormat::Json && kind.is_binary() {
            tracing::info!(%request_id, content_type = %content_type, "range returned an artifact; parsing locally");
        }
        let readings = decode_readings(kind, &content_type, body, machine)?;
        tracing::debug!(%request_id, company_lab, machine, count = readings.len(), "fetched range");
        Ok(RangeResult::Readings(readings))
    }

    async fn get(
        &self,
        request_id: Uuid,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<(BodyKind, String, Bytes), FetchError> {
        let url = self
            .base_url
            .join(endpoint)
            .map_err(|err| FetchError::Format(format!("bad endpoint url: {err}")))?;

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.credential)
            .header("X-Request-Id", request_id.to_string())
            .query(query)
            .send()
            .await
            .map_err(|err| {
                tracing::warn!(%request_id, endpoint, error = %err, "telemetry API unreachable");
                FetchError::Unreachable(err)
            })?;

        let status = response.status();
        if !status.is_success() {
            let err = FetchError::from_status(status);
            tracing::warn!(%request_id, endpoint, status = %status, kind = err.kind(), "telemetry API rejected request");
            return Err(err);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let kind = BodyKind::from_content_type(content_type.as_deref());
        let body = response.bytes().await.map_err(FetchError::from)?;
        Ok((kind, content_type.unwrap_or_default(), body))
    }
}

fn decode_readings(
    kind: BodyKind,
    content_type: &str,
    body: Bytes,
    machine: &str,
) -> Result<Vec<SensorReading>, FetchError> {
    match kind {
        BodyKind::Json => parse_json_rows(body, machine),
        BodyKind::Csv => parse_csv(&body, machine),
        BodyKind::Spreadsheet => parse_xlsx(&body, machine),
        BodyKind::Unknown if looks_like_json(&body) => parse_json_rows(body, machine),
        BodyKind::Unknown => Err(FetchError::Format(format!(
            "unsupported content type {content_type:?}"
        ))),
    }
}

fn parse_json_rows(body: Bytes, machine: &str) -> Result<Vec<SensorReading>, FetchError> {
    let mut bytes = body.to_vec();
    let rows: Vec<Value> = simd_json::serde::from_slice(&mut bytes)
        .map_err(|err| FetchError::Format(format!("expected a JSON array of readings: {err}")))?;
    Ok(rows.iter().map(|row| normalize(row, machine)).collect())
}

fn looks_like_json(body: &[u8]) -> bool {
    body.iter()
        .find(|byte| !byte.is_ascii_whitespace())
        .is_some_and(|byte| *byte == b'[' || *byte == b'{')
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
