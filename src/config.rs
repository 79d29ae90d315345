use crate::stream::ReconnectPolicy;
use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_HYDRATE_COUNT: usize = 20;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

fn setup_config_path(lookup: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    lookup("LAB_STREAM_SETUP_CONFIG_PATH").map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    api_url: Option<String>,
    #[serde(default)]
    ws_url: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    company_lab: Option<String>,
    #[serde(default)]
    machine: Option<String>,
    #[serde(default)]
    reconnect_delay_ms: Option<u64>,
    #[serde(default)]
    max_reconnect_attempts: Option<u32>,
    #[serde(default)]
    hydrate_count: Option<usize>,
    #[serde(default)]
    request_timeout_ms: Option<u64>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "lab-stream failed to read setup config; using env only"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "lab-stream failed to parse setup config; using env only"
            );
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub api_url: Url,
    pub ws_url: Url,
    pub token: String,
    pub company_lab: String,
    pub machine_id: String,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub hydrate_count: usize,
    pub request_timeout_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any variable source. Blank values count as
    /// unset; explicit variables win over the setup file.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let lookup = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let overrides = setup_config_path(&lookup)
            .and_then(|path| load_setup_config_overrides(&path))
            .unwrap_or_default();

        let text = |key: &str, fallback: &Option<String>| {
            lookup(key).or_else(|| {
                fallback
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
            })
        };

        let api_url = text("LAB_STREAM_API_URL", &overrides.api_url)
            .context("LAB_STREAM_API_URL is required (or api_url in the setup config)")?;
        let api_url = Url::parse(&api_url).with_context(|| format!("invalid API url {api_url:?}"))?;

        let ws_url = match text("LAB_STREAM_WS_URL", &overrides.ws_url) {
            Some(raw) => Url::parse(&raw).with_context(|| format!("invalid stream url {raw:?}"))?,
            None => derive_ws_url(&api_url)?,
        };

        let token = text("LAB_STREAM_TOKEN", &overrides.token)
            .context("LAB_STREAM_TOKEN is required (or token in the setup config)")?;
        let company_lab = text("LAB_STREAM_COMPANY_LAB", &overrides.company_lab)
            .context("LAB_STREAM_COMPANY_LAB is required (or company_lab in the setup config)")?;
        let machine_id = text("LAB_STREAM_MACHINE", &overrides.machine)
            .context("LAB_STREAM_MACHINE is required (or machine in the setup config)")?;

        let reconnect_delay_ms = lookup("LAB_STREAM_RECONNECT_DELAY_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .or(overrides.reconnect_delay_ms)
            .unwrap_or(DEFAULT_RECONNECT_DELAY_MS);
        let max_reconnect_attempts = lookup("LAB_STREAM_MAX_RECONNECT_ATTEMPTS")
            .and_then(|v| v.parse::<u32>().ok())
            .or(overrides.max_reconnect_attempts)
            .filter(|v| *v != 0)
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS);
        let hydrate_count = lookup("LAB_STREAM_HYDRATE_COUNT")
            .and_then(|v| v.parse::<usize>().ok())
            .or(overrides.hydrate_count)
            .unwrap_or(DEFAULT_HYDRATE_COUNT);
        let request_timeout_ms = lookup("LAB_STREAM_REQUEST_TIMEOUT_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .or(overrides.request_timeout_ms)
            .filter(|v| *v != 0)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);

        Ok(Self {
            api_url,
            ws_url,
            token,
            company_lab,
            machine_id,
            reconnect_delay_ms,
            max_reconnect_attempts,
            hydrate_count,
            request_timeout_ms,
        })
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: self.reconnect_delay(),
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

/// `http(s)://host/...` becomes `ws(s)://host/ws`.
fn derive_ws_url(api_url: &Url) -> Result<Url> {
    let scheme = match api_url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => bail!("cannot derive a stream url from scheme {other:?}; set LAB_STREAM_WS_URL"),
    };
    let mut ws_url = api_url.clone();
    ws_url.set_query(None);
    ws_url.set_path("/ws");
    ws_url
        .set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("cannot derive a stream url from {api_url}"))?;
    Ok(ws_url)
}
