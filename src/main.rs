use anyhow::{Context, Result};
use lab_stream::config::Config;
use lab_stream::stream::WebSocketTransport;
use lab_stream::{CacheEntry, ConnectionManager, LabFeed, ReadingCache, SnapshotFetcher};
use std::sync::Arc;

fn init_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,lab_stream=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let config = Config::from_env()?;

    let fetcher = SnapshotFetcher::with_timeout(
        config.api_url.clone(),
        config.token.clone(),
        config.request_timeout(),
    )
    .context("failed to build REST client")?;
    let transport =
        WebSocketTransport::new(config.ws_url.clone()).with_connect_timeout(config.request_timeout());
    let manager = ConnectionManager::new(transport, config.reconnect_policy());
    let cache = Arc::new(ReadingCache::new());
    let feed = LabFeed::new(
        cache.clone(),
        manager,
        config.company_lab.clone(),
        config.machine_id.clone(),
    );

    let updates = cache.subscribe(&config.company_lab, &config.machine_id, |entry: &CacheEntry| {
        tracing::info!(
            machine = %entry.reading.machine_id,
            timestamp = %entry.reading.timestamp,
            status = entry.connection_status.as_str(),
            temperature_c = entry.reading.temperature_c,
            humidity_pct = entry.reading.humidity_pct,
            pm25 = entry.reading.pm25,
            pm10 = entry.reading.pm10,
            co2_ppm = entry.reading.co2_ppm,
            tvoc = entry.reading.tvoc,
            "latest reading"
        );
    });

    if config.hydrate_count > 0 {
        if let Err(err) = feed.hydrate(&fetcher, config.hydrate_count).await {
            tracing::warn!(error = %err, kind = err.kind(), "snapshot hydrate failed; waiting for live data");
        }
    }

    feed.start(config.token.clone());
    tracing::info!(
        api = %config.api_url,
        stream = %config.ws_url,
        company_lab = %config.company_lab,
        machine = %config.machine_id,
        "lab-stream running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    feed.shutdown();
    cache.unsubscribe(&config.company_lab, &config.machine_id, updates);
    Ok(())
}
