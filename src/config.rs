use config::{Config, ConfigError, Environment, File};
use rollup_core::config::{MetricSpec, SinkConfig};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct AgentSettings {
    #[serde(default)]
    pub flush: FlushSettings,
    #[serde(default)]
    pub source: SourceSettings,
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
    #[serde(default)]
    pub forward: ForwardSettings,
    /// Used only when no forward nodes are configured.
    #[serde(default)]
    pub sink: SinkConfig,
}

#[derive(Debug, Deserialize)]
pub struct FlushSettings {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct SourceSettings {
    /// Record field holding the event time in unix seconds.
    #[serde(default = "default_time_key")]
    pub time_key: String,
}

#[derive(Debug, Deserialize)]
pub struct ForwardSettings {
    #[serde(default)]
    pub nodes: Vec<NodeSettings>,
    /// Seconds a failed node stays out of rotation.
    #[serde(default = "default_recover_wait_secs")]
    pub recover_wait_secs: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSettings {
    pub address: String,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_time_key() -> String {
    "time".to_string()
}

fn default_recover_wait_secs() -> u64 {
    10
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            time_key: default_time_key(),
        }
    }
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            recover_wait_secs: default_recover_wait_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl AgentSettings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(Path::new("config"))
    }

    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            // Start with default settings
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local overrides
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment variables with prefix ROLLUP_AGENT_
            .add_source(
                Environment::with_prefix("ROLLUP_AGENT")
                    .prefix_separator("_")
                    .separator("__"),
            );

        builder.build()?.try_deserialize()
    }
}
