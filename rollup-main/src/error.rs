//! Error types shared by the engine, the sinks and the node service.

use thiserror::Error;

/// Errors raised by configuration, routing, encoding and sinks.
///
/// A record that fails key or value extraction is not an error: evaluation
/// returns `None` for that definition and nothing is raised.
#[derive(Debug, Error)]
pub enum RollupError {
    /// Unrecognized `type`/`partition_by`, or a missing required parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Every node was probed and none reported itself available.
    #[error("no nodes are available")]
    NoAvailableNodes,

    /// A payload was fully written but its acknowledgement never arrived.
    /// The node may or may not have applied it.
    #[error("payload not acknowledged: {0}")]
    Unacknowledged(String),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings error: {0}")]
    Settings(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, RollupError>;

impl RollupError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        RollupError::InvalidConfig(msg.into())
    }

    pub fn sink(msg: impl std::fmt::Display) -> Self {
        RollupError::Sink(msg.to_string())
    }
}
