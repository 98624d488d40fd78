//! Sinks for drained aggregates.
//!
//! This module provides multiple sink implementations:
//! - `duckdb`: document-store style table with additive upserts
//! - `cache`: key-value hashes with per-identity expiry
//! - `stdout`: one JSON line per drained record
//!
//! Each sink implements the [`Sink`] trait. Upserts are additive: `count`
//! and every value field are added to what is stored, `name`, `partition`
//! and `key` are set on write. The engine never retries a failed upsert.

pub mod cache;
pub mod duckdb;
pub mod stdout;

use crate::aggregation::{AggregationRecord, Identity};
use crate::config::SinkConfig;
use crate::error::{Result, RollupError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of handing one drained window to a sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
}

impl FlushReport {
    pub fn add(&mut self, other: FlushReport) {
        self.written += other.written;
        self.failed += other.failed;
    }
}

/// Persists or relays finalized aggregates.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Prepares the sink (tables, connections). Called once before use.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Adds `record` into whatever is stored under `identity`, creating the
    /// entry when absent.
    async fn upsert(&self, identity: &str, record: &AggregationRecord) -> Result<()>;

    fn name(&self) -> &str {
        "sink"
    }

    /// Upserts every drained record. Failures are logged and counted, the
    /// remaining records are still written.
    async fn flush_all(&self, drained: Vec<(Identity, AggregationRecord)>) -> FlushReport {
        upsert_each(self, drained).await
    }
}

/// The default [`Sink::flush_all`] body, for sinks that override it to do
/// extra work around the upserts.
pub async fn upsert_each<S>(sink: &S, drained: Vec<(Identity, AggregationRecord)>) -> FlushReport
where
    S: Sink + ?Sized,
{
    let mut report = FlushReport::default();
    for (identity, record) in &drained {
        match sink.upsert(identity, record).await {
            Ok(()) => report.written += 1,
            Err(e) => {
                warn!(sink = sink.name(), identity = %identity, error = %e, "upsert failed");
                report.failed += 1;
            }
        }
    }
    debug!(sink = sink.name(), written = report.written, failed = report.failed, "flushed");
    report
}

/// Builds the sink named by `config.engine`.
pub fn sink_from_config(config: &SinkConfig) -> Result<Arc<dyn Sink>> {
    let sink: Arc<dyn Sink> = match config.engine.as_str() {
        "duckdb" => Arc::new(duckdb::DuckDbSink::new_with_options(
            &config.connection,
            &config.options,
        )?),
        "memory" => Arc::new(cache::MemorySink::new(
            config.expire_secs.map(Duration::from_secs),
        )),
        "stdout" => Arc::new(stdout::StdoutSink::new()),
        other => {
            return Err(RollupError::invalid_config(format!(
                "unsupported sink engine {:?}: expected duckdb, memory or stdout",
                other
            )))
        }
    };
    Ok(sink)
}
