use super::*;
use crate::telemetry::TimestampQuality;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{NaiveDate, TimeZone, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct Captured {
    path: String,
    params: HashMap<String, String>,
    authorization: Option<String>,
}

type Log = Arc<Mutex<Vec<Captured>>>;

const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const READINGS_XLSX: &[u8] =
    include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/readings.xlsx"));

const CSV_BODY: &str = "timestamp,machine,temperature,co2\n2024-03-01 08:00:00,aq,20.5,420\n";

fn capture(log: &Log, path: &str, headers: &HeaderMap, params: &HashMap<String, String>) {
    log.lock().unwrap().push(Captured {
        path: path.to_string(),
        params: params.clone(),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });
}

fn scripted(machine: &str) -> Option<Response> {
    match machine {
        "missing" => Some(StatusCode::NOT_FOUND.into_response()),
        "boom" => Some(StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        "garbage" => Some(
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                "{\"oops\":",
            )
                .into_response(),
        ),
        "html" => Some(
            (StatusCode::OK, [(header::CONTENT_TYPE, "text/html")], "<html></html>").into_response(),
        ),
        "xlsx-only" => Some(
            (StatusCode::OK, [(header::CONTENT_TYPE, XLSX_MIME)], READINGS_XLSX).into_response(),
        ),
        "csv-only" => Some(
            (StatusCode::OK, [(header::CONTENT_TYPE, "text/csv")], CSV_BODY).into_response(),
        ),
        _ => None,
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) == Some("Bearer secret")
}

async fn recent(
    State(log): State<Log>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    capture(&log, "recent", &headers, &params);
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let machine = params.get("machine").cloned().unwrap_or_default();
    if let Some(response) = scripted(&machine) {
        return response;
    }
    Json(json!([
        {
            "_id": "1",
            "timestamp": "2024-03-01 08:00:00",
            "machine": machine,
            "values": {
                "temperature": 21.3, "humidity": 55, "pm25": 10, "pm10": 20,
                "pm25_average": 9, "pm10_average": 18, "co2": 410, "tvoc": 0.12
            }
        },
        {"timestamp": "2024-03-01 07:59:00", "temperatu": 21.0, "co2": 405}
    ]))
    .into_response()
}

async fn search(
    State(log): State<Log>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    capture(&log, "search", &headers, &params);
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let machine = params.get("machine").cloned().unwrap_or_default();
    if let Some(response) = scripted(&machine) {
        return response;
    }
    match params.get("format").map(String::as_str) {
        Some("xlsx") => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, XLSX_MIME)],
            b"PK\x03\x04fake".to_vec(),
        )
            .into_response(),
        Some("csv") => {
            (StatusCode::OK, [(header::CONTENT_TYPE, "text/csv")], CSV_BODY).into_response()
        }
        _ => Json(json!([{"timestamp": "2024-03-01T09:00:00", "machine": machine, "pm10": 33}]))
            .into_response(),
    }
}

async fn serve() -> (Url, Log) {
    let log: Log = Arc::default();
    let app = Router::new()
        .route("/api/recent", get(recent))
        .route("/api/search", get(search))
        .with_state(log.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (Url::parse(&format!("http://{addr}/api")).unwrap(), log)
}

fn window() -> (NaiveDateTime, NaiveDateTime) {
    let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
    (
        day.and_hms_opt(8, 0, 0).unwrap(),
        day.and_hms_opt(9, 30, 0).unwrap(),
    )
}

#[tokio::test]
async fn fetch_recent_normalizes_both_shapes() {
    let (base, log) = serve().await;
    let fetcher = SnapshotFetcher::new(base, "secret").unwrap();

    let readings = fetcher.fetch_recent("acme-lab1", "aq", 2).await.unwrap();
    assert_eq!(readings.len(), 2);
    let first = &readings[0];
    assert_eq!(first.machine_id, "aq");
    assert_eq!(first.temperature_c, 21.3);
    assert_eq!(first.humidity_pct, 55.0);
    assert_eq!(first.pm25, 10.0);
    assert_eq!(first.pm10, 20.0);
    assert_eq!(first.pm25_average, 9.0);
    assert_eq!(first.pm10_average, 18.0);
    assert_eq!(first.co2_ppm, 410.0);
    assert_eq!(first.tvoc, 0.12);
    assert_eq!(
        first.timestamp,
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    );

    // Flat row without a machine falls back to the requested one.
    assert_eq!(readings[1].machine_id, "aq");
    assert_eq!(readings[1].temperature_c, 21.0);
    assert!(readings[1].timestamp < first.timestamp);

    let captured = log.lock().unwrap()[0].clone();
    assert_eq!(captured.path, "recent");
    assert_eq!(captured.authorization.as_deref(), Some("Bearer secret"));
    assert_eq!(captured.params["company_lab"], "acme-lab1");
    assert_eq!(captured.params["machine"], "aq");
    assert_eq!(captured.params["number"], "2");
}

#[tokio::test]
async fn fetch_range_sends_local_wall_time() {
    let (base, log) = serve().await;
    let fetcher = SnapshotFetcher::new(base, "secret").unwrap();
    let (start, end) = window();

    let result = fetcher
        .fetch_range("acme-lab1", "aq", start, end, RangeFormat::Json)
        .await
        .unwrap();
    let RangeResult::Readings(readings) = result else {
        panic!("expected readings");
    };
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].pm10, 33.0);

    let captured = log.lock().unwrap()[0].clone();
    assert_eq!(captured.path, "search");
    assert_eq!(captured.params["start"], "2024-03-01 08:00:00");
    assert_eq!(captured.params["end"], "2024-03-01 09:30:00");
    assert_eq!(captured.params["format"], "json");
}

#[tokio::test]
async fn json_request_answered_with_csv_is_parsed_locally() {
    let (base, _log) = serve().await;
    let fetcher = SnapshotFetcher::new(base, "secret").unwrap();
    let (start, end) = window();

    let result = fetcher
        .fetch_range("acme-lab1", "csv-only", start, end, RangeFormat::Json)
        .await
        .unwrap();
    let RangeResult::Readings(readings) = result else {
        panic!("expected readings parsed from the artifact");
    };
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].machine_id, "aq");
    assert_eq!(readings[0].temperature_c, 20.5);
    assert_eq!(readings[0].co2_ppm, 420.0);
    assert_eq!(readings[0].timestamp_quality, TimestampQuality::Parsed);
}

#[tokio::test]
async fn json_request_answered_with_a_workbook_is_parsed_locally() {
    let (base, log) = serve().await;
    let fetcher = SnapshotFetcher::new(base, "secret").unwrap();
    let (start, end) = window();

    let result = fetcher
        .fetch_range("acme-lab1", "xlsx-only", start, end, RangeFormat::Json)
        .await
        .unwrap();
    let RangeResult::Readings(readings) = result else {
        panic!("expected readings parsed from the workbook");
    };
    assert_eq!(readings.len(), 2);
    assert_eq!(readings[0].machine_id, "aq");
    assert_eq!(
        readings[0].timestamp,
        Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap()
    );
    assert_eq!(readings[0].temperature_c, 21.5);
    assert_eq!(readings[0].pm25_average, 9.0);
    assert_eq!(readings[0].co2_ppm, 415.0);
    assert_eq!(readings[1].machine_id, "xlsx-only");
    assert_eq!(readings[1].co2_ppm, 430.0);
    assert_eq!(log.lock().unwrap()[0].params["format"], "json");
}

#[tokio::test]
async fn requested_artifacts_are_returned_untouched() {
    let (base, _log) = serve().await;
    let fetcher = SnapshotFetcher::new(base, "secret").unwrap();
    let (start, end) = window();

    let result = fetcher
        .fetch_range("acme-lab1", "aq", start, end, RangeFormat::Xlsx)
        .await
        .unwrap();
    let RangeResult::Artifact(artifact) = result else {
        panic!("expected an artifact");
    };
    assert!(artifact.content_type.contains("spreadsheetml"));
    assert_eq!(&artifact.bytes[..], b"PK\x03\x04fake");

    let result = fetcher
        .fetch_range("acme-lab1", "aq", start, end, RangeFormat::Csv)
        .await
        .unwrap();
    assert!(matches!(result, RangeResult::Artifact(a) if a.content_type == "text/csv"));
}

#[tokio::test]
async fn failures_are_classified() {
    let (base, _log) = serve().await;
    let fetcher = SnapshotFetcher::new(base.clone(), "secret").unwrap();

    let err = fetcher.fetch_recent("acme-lab1", "missing", 5).await.unwrap_err();
    assert!(matches!(err, FetchError::NotFound));

    let err = fetcher.fetch_recent("acme-lab1", "boom", 5).await.unwrap_err();
    assert!(matches!(err, FetchError::ServerError { status: 500 }));

    let err = fetcher.fetch_recent("acme-lab1", "garbage", 5).await.unwrap_err();
    assert!(matches!(err, FetchError::Format(_)));

    let err = fetcher.fetch_recent("acme-lab1", "html", 5).await.unwrap_err();
    assert!(matches!(err, FetchError::Format(_)));

    let stranger = SnapshotFetcher::new(base, "nope").unwrap();
    let err = stranger.fetch_recent("acme-lab1", "aq", 5).await.unwrap_err();
    assert!(matches!(err, FetchError::Unauthorized { status: 401 }));
}

#[tokio::test]
async fn unreachable_api_is_reported() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let base = Url::parse(&format!("http://{addr}/api")).unwrap();
    let fetcher = SnapshotFetcher::with_timeout(base, "secret", Duration::from_secs(2)).unwrap();
    let err = fetcher.fetch_recent("acme-lab1", "aq", 1).await.unwrap_err();
    assert_eq!(err.kind(), "unreachable");
}

#[test]
fn endpoints_join_under_the_base_path() {
    let base = with_trailing_slash(Url::parse("https://api.example.com/v1/telemetry").unwrap());
    assert_eq!(
        base.join("recent").unwrap().as_str(),
        "https://api.example.com/v1/telemetry/recent"
    );
    let root = with_trailing_slash(Url::parse("https://api.example.com").unwrap());
    assert_eq!(root.join("search").unwrap().as_str(), "https://api.example.com/search");
}

#[test]
fn sniffs_json_bodies() {
    assert!(looks_like_json(b"  [1]"));
    assert!(looks_like_json(b"{}"));
    assert!(!looks_like_json(b"PK\x03\x04"));
    assert!(!looks_like_json(b""));
}
