//! Live lab sensor telemetry: a reconnecting push stream, REST snapshots and
//! a latest-reading cache that both feed into.

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod feed;
pub mod snapshot;
pub mod stream;
pub mod telemetry;

pub use cache::{CacheEntry, CacheKey, ReadingCache};
pub use error::{FetchError, StreamError};
pub use feed::LabFeed;
pub use snapshot::{RangeFormat, RangeResult, SnapshotFetcher};
pub use stream::{ConnectionEvent, ConnectionManager, ConnectionStatus, EventKind, ReconnectPolicy};
pub use telemetry::{normalize, SensorReading};
