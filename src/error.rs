use reqwest::StatusCode;
use thiserror::Error;

/// Failures surfaced on a live stream. None of these are returned from
/// `connect()`; they arrive as `error` events.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("gave up reconnecting after {attempts} consecutive failures")]
    ReconnectExhausted { attempts: u32 },
}

impl StreamError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamError::ReconnectExhausted { .. })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("credential rejected (HTTP {status})")]
    Unauthorized { status: u16 },
    #[error("resource not found")]
    NotFound,
    #[error("server returned HTTP {status}")]
    ServerError { status: u16 },
    #[error("telemetry API unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),
    #[error("unreadable response body: {0}")]
    Format(String),
}

impl FetchError {
    /// Classifies a non-success HTTP status.
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::Unauthorized {
                status: status.as_u16(),
            },
            StatusCode::NOT_FOUND => FetchError::NotFound,
            other => FetchError::ServerError {
                status: other.as_u16(),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Unauthorized { .. } => "unauthorized",
            FetchError::NotFound => "not_found",
            FetchError::ServerError { .. } => "server_error",
            FetchError::Unreachable(_) => "unreachable",
            FetchError::Format(_) => "format_error",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return FetchError::Format(err.to_string());
        }
        match err.status() {
            Some(status) => FetchError::from_status(status),
            None => FetchError::Unreachable(err),
        }
    }
}
