use crate::cache::ReadingCache;
use crate::error::FetchError;
use crate::events::HandlerId;
use crate::snapshot::SnapshotFetcher;
use crate::stream::{ConnectionEvent, ConnectionManager, ConnectionStatus, Disconnect, EventKind};
use crate::telemetry::{normalize, SensorReading};
use std::sync::{Arc, Mutex, MutexGuard};

/// Wires one machine's push stream and REST snapshots into a shared cache.
///
/// The caller owns the feed and decides when it starts and stops; nothing
/// here is process-global.
pub struct LabFeed {
    cache: Arc<ReadingCache>,
    manager: ConnectionManager,
    company_lab: String,
    machine_id: String,
    handlers: Mutex<Vec<(EventKind, HandlerId)>>,
}

impl LabFeed {
    pub fn new(
        cache: Arc<ReadingCache>,
        manager: ConnectionManager,
        company_lab: impl Into<String>,
        machine_id: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            manager,
            company_lab: company_lab.into(),
            machine_id: machine_id.into(),
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn cache(&self) -> &Arc<ReadingCache> {
        &self.cache
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Seeds the cache from the most recent `count` readings. Returns how
    /// many of them were newer than what the cache already held.
    pub async fn hydrate(&self, fetcher: &SnapshotFetcher, count: usize) -> Result<usize, FetchError> {
        let readings = fetcher
            .fetch_recent(&self.company_lab, &self.machine_id, count)
            .await?;
        let fetched = readings.len();
        let accepted = readings
            .into_iter()
            .map(|reading| store(&self.cache, &self.company_lab, &self.machine_id, reading))
            .filter(|stored| *stored)
            .count();
        tracing::info!(
            company_lab = %self.company_lab,
            machine = %self.machine_id,
            fetched,
            accepted,
            "cache hydrated from snapshot"
        );
        Ok(accepted)
    }

    /// Registers the cache handlers once and opens the stream. A stream that
    /// is already active is left alone and its status copied into the cache.
    pub fn start(&self, credential: impl Into<String>) {
        self.attach();
        let status = self.manager.status();
        if status.is_active() {
            self.cache
                .set_connection_status(&self.company_lab, &self.machine_id, status);
            return;
        }
        self.cache
            .set_connection_status(&self.company_lab, &self.machine_id, ConnectionStatus::Connecting);
        self.manager
            .connect(credential, self.company_lab.clone(), self.machine_id.clone());
    }

    /// Closes the stream and removes the handlers `start` registered.
    pub fn shutdown(&self) {
        self.manager.disconnect();
        // Only an open stream reports its own close.
        self.cache
            .set_connection_status(&self.company_lab, &self.machine_id, ConnectionStatus::Closed);
        let handlers = std::mem::take(&mut *self.lock());
        for (kind, id) in handlers {
            self.manager.off(kind, id);
        }
    }

    fn attach(&self) {
        let mut handlers = self.lock();
        if !handlers.is_empty() {
            return;
        }

        let cache = self.cache.clone();
        let company_lab = self.company_lab.clone();
        let machine_id = self.machine_id.clone();
        let data = self.manager.on(EventKind::Data, move |event| {
            if let ConnectionEvent::Data(raw) = event {
                store(&cache, &company_lab, &machine_id, normalize(raw, &machine_id));
            }
        });

        let cache = self.cache.clone();
        let company_lab = self.company_lab.clone();
        let machine_id = self.machine_id.clone();
        let connected = self.manager.on(EventKind::Connected, move |_| {
            cache.set_connection_status(&company_lab, &machine_id, ConnectionStatus::Open);
        });

        let cache = self.cache.clone();
        let company_lab = self.company_lab.clone();
        let machine_id = self.machine_id.clone();
        let disconnected = self.manager.on(EventKind::Disconnected, move |event| {
            if let ConnectionEvent::Disconnected(info) = event {
                cache.set_connection_status(&company_lab, &machine_id, status_after(info));
            }
        });

        handlers.extend([
            (EventKind::Data, data),
            (EventKind::Connected, connected),
            (EventKind::Disconnected, disconnected),
        ]);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(EventKind, HandlerId)>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The stream and snapshots are scoped to one `(company_lab, machine)`, so
/// readings land under that key whatever machine label the payload carries.
fn store(cache: &ReadingCache, company_lab: &str, machine_id: &str, reading: SensorReading) -> bool {
    if !reading.has_parsed_timestamp() {
        tracing::debug!(
            company_lab,
            machine = machine_id,
            "skipping reading without a usable timestamp"
        );
        return false;
    }
    if reading.machine_id != machine_id {
        tracing::trace!(
            company_lab,
            machine = machine_id,
            labelled = %reading.machine_id,
            "payload machine label differs from stream scope"
        );
    }
    cache.set(company_lab, machine_id, reading)
}

fn status_after(info: &Disconnect) -> ConnectionStatus {
    if info.will_reconnect {
        ConnectionStatus::Reconnecting
    } else if info.initiated_by_client {
        ConnectionStatus::Closed
    } else {
        ConnectionStatus::Failed
    }
}
