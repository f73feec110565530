//! Persistence collaborator
//!
//! The gateway writes traces, temperature samples, unknown messages and proxy
//! disagreements through the [`Persistence`] trait. The handle is passed
//! explicitly to each component as `Arc<dyn Persistence>`. Write failures are
//! reported to the caller, which logs them and carries on.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::Result;

/// Transport a trace was recorded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraceSource {
    Udp,
    Http,
}

impl fmt::Display for TraceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceSource::Udp => f.write_str("UDP"),
            TraceSource::Http => f.write_str("HTTP"),
        }
    }
}

/// One handled datagram or proxied request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceRecord {
    pub timestamp: DateTime<Utc>,
    pub source: TraceSource,
    /// Peer address for UDP, request host for HTTP
    pub host: String,
    /// Message name or hex dump for UDP, request URI for HTTP
    pub uri: String,
    pub elapsed_ms: u64,
    /// `OK`, an HTTP status code, or the error text
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemperatureRecord {
    pub timestamp: DateTime<Utc>,
    pub device_id: u32,
    pub room: u32,
    pub temp: f32,
    pub set_temp: f32,
    pub heating: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutsideTemperatureRecord {
    pub timestamp: DateTime<Utc>,
    pub device_id: u32,
    pub temp: f32,
}

/// Raw bytes of a message the dispatcher could not fully account for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMessageRecord {
    pub timestamp: DateTime<Utc>,
    pub peer: SocketAddr,
    pub opcode_name: String,
    /// `None` when the frame could not be decoded far enough to read it
    pub opcode_value: Option<u8>,
    pub raw_frame: Bytes,
    pub payload: Bytes,
    /// Bytes left over after the handler finished
    pub undecoded_tail: Option<Bytes>,
}

/// Local and upstream answers that did not match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisagreementRecord {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub uri: String,
    pub behaviour: String,
    pub local_body: Bytes,
    pub remote_body: Bytes,
}

/// Storage for gateway observations.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn log_trace(&self, record: TraceRecord) -> Result<()>;

    async fn log_temperature(&self, record: TemperatureRecord) -> Result<()>;

    async fn log_outside_temperature(&self, record: OutsideTemperatureRecord) -> Result<()>;

    async fn log_unknown_message(&self, record: UnknownMessageRecord) -> Result<()>;

    async fn log_disagreement(&self, record: DisagreementRecord) -> Result<()>;

    /// Delete records older than `days`. Returns the number removed.
    async fn purge_older_than(&self, days: u32) -> Result<usize>;
}

/// Log a failed write without propagating it.
pub(crate) fn report(operation: &str, result: Result<()>) {
    if let Err(err) = result {
        warn!("Persistence {} failed: {}", operation, err);
    }
}

#[derive(Debug, Default)]
struct Tables {
    traces: Vec<TraceRecord>,
    temperatures: Vec<TemperatureRecord>,
    outside_temperatures: Vec<OutsideTemperatureRecord>,
    unknown_messages: Vec<UnknownMessageRecord>,
    disagreements: Vec<DisagreementRecord>,
}

/// In-memory [`Persistence`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn traces(&self) -> Vec<TraceRecord> {
        self.tables().traces.clone()
    }

    pub fn temperatures(&self) -> Vec<TemperatureRecord> {
        self.tables().temperatures.clone()
    }

    pub fn outside_temperatures(&self) -> Vec<OutsideTemperatureRecord> {
        self.tables().outside_temperatures.clone()
    }

    pub fn unknown_messages(&self) -> Vec<UnknownMessageRecord> {
        self.tables().unknown_messages.clone()
    }

    pub fn disagreements(&self) -> Vec<DisagreementRecord> {
        self.tables().disagreements.clone()
    }

    /// Traces whose uri equals `uri`.
    pub fn traces_for(&self, uri: &str) -> Vec<TraceRecord> {
        self.tables().traces.iter().filter(|trace| trace.uri == uri).cloned().collect()
    }

    /// Most recent temperature sample for a room.
    pub fn latest_temperature(&self, device_id: u32, room: u32) -> Option<TemperatureRecord> {
        self.tables()
            .temperatures
            .iter()
            .rev()
            .find(|record| record.device_id == device_id && record.room == room)
            .cloned()
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut tables = self.tables();
        let before = tables.traces.len()
            + tables.temperatures.len()
            + tables.outside_temperatures.len()
            + tables.unknown_messages.len()
            + tables.disagreements.len();

        tables.traces.retain(|r| r.timestamp >= cutoff);
        tables.temperatures.retain(|r| r.timestamp >= cutoff);
        tables.outside_temperatures.retain(|r| r.timestamp >= cutoff);
        tables.unknown_messages.retain(|r| r.timestamp >= cutoff);
        tables.disagreements.retain(|r| r.timestamp >= cutoff);

        let after = tables.traces.len()
            + tables.temperatures.len()
            + tables.outside_temperatures.len()
            + tables.unknown_messages.len()
            + tables.disagreements.len();
        before - after
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn log_trace(&self, record: TraceRecord) -> Result<()> {
        self.tables().traces.push(record);
        Ok(())
    }

    async fn log_temperature(&self, record: TemperatureRecord) -> Result<()> {
        self.tables().temperatures.push(record);
        Ok(())
    }

    async fn log_outside_temperature(&self, record: OutsideTemperatureRecord) -> Result<()> {
        self.tables().outside_temperatures.push(record);
        Ok(())
    }

    async fn log_unknown_message(&self, record: UnknownMessageRecord) -> Result<()> {
        self.tables().unknown_messages.push(record);
        Ok(())
    }

    async fn log_disagreement(&self, record: DisagreementRecord) -> Result<()> {
        self.tables().disagreements.push(record);
        Ok(())
    }

    async fn purge_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(days as i64);
        let removed = self.purge_before(cutoff);
        debug!("Purged {} records older than {}", removed, cutoff);
        Ok(removed)
    }
}
