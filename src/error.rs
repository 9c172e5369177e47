use thiserror::Error;

/// Errors raised by the monitoring core.
///
/// Only [`MonitorError::Config`] is fatal; everything else is contained by
/// the component that hit it and reported through logs and meta-metrics.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("probe {probe} failed: {message}")]
    Probe { probe: String, message: String },

    #[error("rejected sample for {metric}: {reason}")]
    Validation { metric: String, reason: String },

    #[error("push queue full, dropped sample for {metric}")]
    Backpressure { metric: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("delivery via {channel} failed: {message}")]
    Delivery { channel: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MonitorError {
    pub fn probe(probe: &str, message: impl std::fmt::Display) -> Self {
        Self::Probe { probe: probe.to_string(), message: message.to_string() }
    }

    pub fn validation(metric: &str, reason: impl Into<String>) -> Self {
        Self::Validation { metric: metric.to_string(), reason: reason.into() }
    }

    pub fn delivery(channel: &str, message: impl std::fmt::Display) -> Self {
        Self::Delivery { channel: channel.to_string(), message: message.to_string() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Configuration errors stop startup; all other errors are survivable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

impl From<rusqlite::Error> for MonitorError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("serialization: {}", e))
    }
}

pub type Result<T, E = MonitorError> = std::result::Result<T, E>;
