//! Configuration management for the aggregation node.
//!
//! This module provides configuration handling through multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/rollup/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `ROLLUP_`, `__` between sections)
//! 5. Command-line arguments
//!
//! Configuration options are loaded in order of precedence, with later sources
//! overriding earlier ones.
//!
//! It also defines [`MetricSpec`], the declarative form of one metric
//! definition, shared with the producing agent.

use clap::Parser;
use config::{Config, ConfigError};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");
const DEFAULT_CONFIG_PATH: &str = "/etc/rollup/config.toml";

/// Declarative metric definition, as written in configuration.
///
/// ```toml
/// [[metrics]]
/// name = "req_count"
/// each_key = "host,path"
/// value_key = "bytes"
/// type = "int"
/// partition_by = "hourly"
/// utc = true
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricSpec {
    pub name: Option<String>,
    /// Comma-separated key fields.
    pub each_key: Option<String>,
    pub value_key: Option<String>,
    pub default_value: Option<String>,
    pub count_key: Option<String>,
    /// `int` (default) or `float`.
    #[serde(rename = "type")]
    pub value_type: Option<String>,
    pub partition_key: Option<String>,
    /// `daily`, `hourly` (default), `minutely` or `secondly`.
    pub partition_by: Option<String>,
    pub localtime: Option<bool>,
    pub utc: Option<bool>,
}

impl MetricSpec {
    /// `localtime = true` takes precedence over `utc = true`; local time is
    /// the default.
    pub fn is_utc(&self) -> bool {
        !self.localtime.unwrap_or(false) && self.utc.unwrap_or(false)
    }
}

/// Command-line arguments parser.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Listen address
    #[arg(long, env = "ROLLUP_SERVER_HOST")]
    pub host: Option<String>,

    /// Listen port
    #[arg(long, env = "ROLLUP_SERVER_PORT")]
    pub port: Option<u16>,

    /// Sink engine type
    #[arg(long, env = "ROLLUP_SINK_ENGINE")]
    pub sink_engine: Option<String>,

    /// Sink connection string
    #[arg(long, env = "ROLLUP_SINK_CONNECTION")]
    pub sink_connection: Option<String>,

    /// Sink options (key=value pairs)
    #[arg(long, env = "ROLLUP_SINK_OPTIONS")]
    pub sink_options: Option<Vec<String>>,

    /// Per-identity expiry in seconds (memory sink)
    #[arg(long, env = "ROLLUP_SINK_EXPIRE")]
    pub sink_expire: Option<u64>,

    /// Flush interval in seconds
    #[arg(long, env = "ROLLUP_FLUSH_INTERVAL")]
    pub flush_interval: Option<u64>,
}

/// Complete node configuration.
#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    #[serde(default)]
    pub flush: FlushConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

/// Listen address for forwarded payloads.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlushConfig {
    /// Seconds between drains of the accumulation store.
    #[serde(default = "default_flush_interval")]
    pub interval_secs: u64,
}

fn default_flush_interval() -> u64 {
    60
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_flush_interval(),
        }
    }
}

/// Where drained aggregates go.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// `duckdb`, `memory` or `stdout`
    pub engine: String,
    #[serde(default)]
    pub connection: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
    /// Expiry applied per identity on every upsert, when supported.
    #[serde(default)]
    pub expire_secs: Option<u64>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            engine: "stdout".to_string(),
            connection: String::new(),
            options: HashMap::new(),
            expire_secs: None,
        }
    }
}

impl Settings {
    /// Loads configuration from all available sources.
    pub fn new(cli: CliArgs) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        builder = builder.add_source(config::File::from_str(
            DEFAULT_CONFIG,
            config::FileFormat::Toml,
        ));

        if let Ok(metadata) = std::fs::metadata(DEFAULT_CONFIG_PATH) {
            if metadata.is_file() {
                builder = builder.add_source(config::File::from(PathBuf::from(DEFAULT_CONFIG_PATH)));
            }
        }

        if let Some(ref config_path) = cli.config {
            builder = builder.add_source(config::File::from(config_path.clone()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ROLLUP")
                .prefix_separator("_")
                .separator("__"),
        );

        if let Some(ref host) = cli.host {
            builder = builder.set_override("server.host", host.as_str())?;
        }
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(ref engine) = cli.sink_engine {
            builder = builder.set_override("sink.engine", engine.as_str())?;
        }
        if let Some(ref connection) = cli.sink_connection {
            builder = builder.set_override("sink.connection", connection.as_str())?;
        }
        if let Some(ref options) = cli.sink_options {
            builder = builder.set_override("sink.options", parse_options(options))?;
        }
        if let Some(expire) = cli.sink_expire {
            builder = builder.set_override("sink.expire_secs", expire)?;
        }
        if let Some(interval) = cli.flush_interval {
            builder = builder.set_override("flush.interval_secs", interval)?;
        }

        builder.build()?.try_deserialize()
    }
}

/// Parses `key=value` pairs, ignoring malformed entries.
pub fn parse_options(options: &[String]) -> HashMap<String, String> {
    options
        .iter()
        .filter_map(|opt| {
            let (key, value) = opt.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}
