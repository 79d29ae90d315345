use crate::events::{HandlerId, SubscriberRegistry};
use crate::stream::ConnectionStatus;
use crate::telemetry::SensorReading;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub company_lab: String,
    pub machine_id: String,
}

impl CacheKey {
    pub fn new(company_lab: impl Into<String>, machine_id: impl Into<String>) -> Self {
        Self {
            company_lab: company_lab.into(),
            machine_id: machine_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub reading: SensorReading,
    pub connection_status: ConnectionStatus,
}

#[derive(Debug)]
struct Slot {
    reading: Option<SensorReading>,
    status: ConnectionStatus,
}

impl Slot {
    fn entry(&self) -> Option<CacheEntry> {
        self.reading.as_ref().map(|reading| CacheEntry {
            reading: reading.clone(),
            connection_status: self.status,
        })
    }
}

/// Latest reading and connectivity per `(company_lab, machine)`.
///
/// `set` only ever moves a key forward in time: a reading whose timestamp is
/// not strictly newer than the stored one is dropped, so the final value is
/// the same whatever order REST snapshots and push frames arrive in. The
/// compare-and-store runs under the slot lock.
#[derive(Default)]
pub struct ReadingCache {
    slots: Mutex<HashMap<CacheKey, Slot>>,
    subscribers: SubscriberRegistry<CacheKey, CacheEntry>,
}

impl ReadingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, company_lab: &str, machine_id: &str) -> Option<CacheEntry> {
        self.lock()
            .get(&CacheKey::new(company_lab, machine_id))
            .and_then(Slot::entry)
    }

    /// Returns `true` when the reading replaced the stored one.
    pub fn set(&self, company_lab: &str, machine_id: &str, reading: SensorReading) -> bool {
        let key = CacheKey::new(company_lab, machine_id);
        let entry = {
            let mut slots = self.lock();
            let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
                reading: None,
                status: ConnectionStatus::Idle,
            });
            if let Some(current) = &slot.reading {
                if reading.timestamp <= current.timestamp {
                    tracing::trace!(
                        company_lab,
                        machine = machine_id,
                        stored = %current.timestamp,
                        incoming = %reading.timestamp,
                        "ignoring stale reading"
                    );
                    return false;
                }
            }
            slot.reading = Some(reading);
            slot.entry()
        };
        if let Some(entry) = entry {
            self.subscribers.emit(&key, &entry);
        }
        true
    }

    /// Records connectivity for a key. Subscribers hear about it only once
    /// the key holds a reading.
    pub fn set_connection_status(
        &self,
        company_lab: &str,
        machine_id: &str,
        status: ConnectionStatus,
    ) -> bool {
        let key = CacheKey::new(company_lab, machine_id);
        let entry = {
            let mut slots = self.lock();
            let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
                reading: None,
                status,
            });
            if slot.status == status && slot.reading.is_some() {
                return false;
            }
            slot.status = status;
            slot.entry()
        };
        if let Some(entry) = entry {
            self.subscribers.emit(&key, &entry);
        }
        true
    }

    pub fn connection_status(&self, company_lab: &str, machine_id: &str) -> Option<ConnectionStatus> {
        self.lock()
            .get(&CacheKey::new(company_lab, machine_id))
            .map(|slot| slot.status)
    }

    pub fn subscribe<F>(&self, company_lab: &str, machine_id: &str, callback: F) -> HandlerId
    where
        F: Fn(&CacheEntry) + Send + Sync + 'static,
    {
        self.subscribers
            .on(CacheKey::new(company_lab, machine_id), callback)
    }

    pub fn unsubscribe(&self, company_lab: &str, machine_id: &str, id: HandlerId) -> bool {
        self.subscribers
            .off(&CacheKey::new(company_lab, machine_id), id)
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::normalize_at;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;

    fn reading(minute: u32, co2: f64) -> SensorReading {
        let ts = format!("2024-03-01 08:{minute:02}:00");
        normalize_at(
            &json!({"timestamp": ts, "machine": "aq", "co2": co2}),
            "aq",
            received(),
        )
    }

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn empty_cache_has_nothing() {
        let cache = ReadingCache::new();
        assert_eq!(cache.get("lab", "aq"), None);
    }

    #[test]
    fn older_or_equal_readings_are_ignored() {
        let cache = ReadingCache::new();
        assert!(cache.set("lab", "aq", reading(10, 400.0)));
        assert!(!cache.set("lab", "aq", reading(5, 999.0)));
        assert!(!cache.set("lab", "aq", reading(10, 777.0)));
        assert_eq!(cache.get("lab", "aq").unwrap().reading.co2_ppm, 400.0);
        assert!(cache.set("lab", "aq", reading(11, 401.0)));
        assert_eq!(cache.get("lab", "aq").unwrap().reading.co2_ppm, 401.0);
    }

    #[test]
    fn arrival_order_does_not_change_the_result() {
        let readings = [reading(1, 1.0), reading(7, 7.0), reading(3, 3.0), reading(5, 5.0)];
        let orders: [[usize; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 0, 3, 2], [2, 3, 0, 1]];
        for order in orders {
            let cache = ReadingCache::new();
            for idx in order {
                cache.set("lab", "aq", readings[idx].clone());
            }
            assert_eq!(cache.get("lab", "aq").unwrap().reading, readings[1]);
        }
    }

    #[test]
    fn keys_are_isolated() {
        let cache = ReadingCache::new();
        cache.set("lab", "aq", reading(10, 400.0));
        cache.set("lab", "other", reading(1, 1.0));
        cache.set("lab-2", "aq", reading(2, 2.0));
        assert_eq!(cache.get("lab", "aq").unwrap().reading.co2_ppm, 400.0);
        assert_eq!(cache.get("lab", "other").unwrap().reading.co2_ppm, 1.0);
        assert_eq!(cache.get("lab-2", "aq").unwrap().reading.co2_ppm, 2.0);
        assert_eq!(cache.keys().len(), 3);
    }

    #[test]
    fn subscribers_see_accepted_updates_only() {
        let cache = ReadingCache::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = cache.subscribe("lab", "aq", move |entry: &CacheEntry| {
            sink.lock().unwrap().push(entry.reading.co2_ppm)
        });

        cache.set("lab", "aq", reading(10, 400.0));
        cache.set("lab", "aq", reading(9, 1.0));
        cache.set("lab", "other", reading(11, 2.0));
        cache.set("lab", "aq", reading(12, 410.0));
        assert_eq!(*seen.lock().unwrap(), vec![400.0, 410.0]);

        assert!(cache.unsubscribe("lab", "aq", id));
        cache.set("lab", "aq", reading(13, 420.0));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn connection_status_keeps_last_good_reading() {
        let cache = ReadingCache::new();
        assert!(cache.set_connection_status("lab", "aq", ConnectionStatus::Connecting));
        assert_eq!(cache.get("lab", "aq"), None);
        assert_eq!(
            cache.connection_status("lab", "aq"),
            Some(ConnectionStatus::Connecting)
        );

        cache.set("lab", "aq", reading(10, 400.0));
        cache.set_connection_status("lab", "aq", ConnectionStatus::Reconnecting);
        let entry = cache.get("lab", "aq").unwrap();
        assert_eq!(entry.connection_status, ConnectionStatus::Reconnecting);
        assert_eq!(entry.reading.co2_ppm, 400.0);
        assert!(!cache.set_connection_status("lab", "aq", ConnectionStatus::Reconnecting));
    }

    #[test]
    fn concurrent_writers_converge_on_newest() {
        let cache = Arc::new(ReadingCache::new());
        let handles: Vec<_> = (0..8u32)
            .map(|worker| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for minute in (worker..60).step_by(8) {
                        cache.set("lab", "aq", reading(minute, minute as f64));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.get("lab", "aq").unwrap().reading.co2_ppm, 59.0);
    }
}
