//! Rollup agent: turns a local record stream into keyed aggregates.
//!
//! Each record is evaluated against every configured metric definition.
//! In single-node mode the results are merged locally and flushed into a
//! sink. In distributed mode they are routed by key to a partition, merged
//! per partition and forwarded to the `rollup` node that owns it.
//!
//! # Example
//!
//! ```rust,no_run
//! use rollup_agent::{run, JsonLinesSource, Pipeline};
//! use rollup_core::config::MetricSpec;
//! use rollup_core::storage::stdout::StdoutSink;
//! use rollup_core::MetricsRegistry;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = MetricsRegistry::from_specs(&[MetricSpec {
//!         name: Some("req_count".to_string()),
//!         each_key: Some("host,path".to_string()),
//!         partition_by: Some("minutely".to_string()),
//!         ..Default::default()
//!     }])?;
//!
//!     let pipeline = Pipeline::new(registry, Arc::new(StdoutSink::new()));
//!     let source = JsonLinesSource::stdin("time");
//!
//!     let report = run(&pipeline, &source, Duration::from_secs(10)).await;
//!     println!("written: {}, failed: {}", report.written, report.failed);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod forward;
pub mod pipeline;
pub mod source;
pub mod tests;

pub use config::AgentSettings;
pub use forward::{ForwardPipeline, ForwardReport, TcpNode, Transport};
pub use pipeline::{run, Aggregator, Event, Pipeline, RecordSource};
pub use source::JsonLinesSource;
