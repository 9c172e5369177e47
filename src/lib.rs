pub mod alerter;
pub mod analyzer;
pub mod collector;
pub mod config;
pub mod error;
pub mod monitor;
pub mod report;
pub mod storage;

pub use error::{MonitorError, Result};
pub use monitor::Monitor;

/// Common types used across modules
pub mod types {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /// Metric tags. Ordered so that two tag sets with the same pairs always
    /// compare equal regardless of insertion order.
    pub type Tags = BTreeMap<String, String>;

    /// A single metric measurement
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct MetricSample {
        pub name: String,
        pub value: f64,
        #[serde(default)]
        pub tags: Tags,
        pub timestamp: DateTime<Utc>,
    }

    impl MetricSample {
        pub fn new(name: impl Into<String>, value: f64, timestamp: DateTime<Utc>) -> Self {
            Self { name: name.into(), value, tags: Tags::new(), timestamp }
        }

        pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
            self.tags.insert(key.into(), value.into());
            self
        }

        pub fn series_key(&self) -> SeriesKey {
            SeriesKey { name: self.name.clone(), tags: self.tags.clone() }
        }
    }

    /// Identity of a time series: metric name plus its tag set
    #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
    pub struct SeriesKey {
        pub name: String,
        pub tags: Tags,
    }

    impl SeriesKey {
        pub fn new(name: impl Into<String>, tags: Tags) -> Self {
            Self { name: name.into(), tags }
        }
    }

    /// Which side of a threshold is unhealthy for a metric
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Direction {
        HigherIsBad,
        LowerIsBad,
    }

    impl Direction {
        /// Inclusive breach test: `value >= limit` or `value <= limit`.
        pub fn breaches(self, value: f64, limit: f64) -> bool {
            match self {
                Direction::HigherIsBad => value >= limit,
                Direction::LowerIsBad => value <= limit,
            }
        }

        pub fn as_str(self) -> &'static str {
            match self {
                Direction::HigherIsBad => "higher_is_bad",
                Direction::LowerIsBad => "lower_is_bad",
            }
        }

        pub fn parse(s: &str) -> Option<Self> {
            match s {
                "higher_is_bad" => Some(Direction::HigherIsBad),
                "lower_is_bad" => Some(Direction::LowerIsBad),
                _ => None,
            }
        }
    }

    /// Severity of a detected anomaly
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Severity {
        Warning,
        Critical,
    }

    /// Detection strategy a rule uses
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum DetectorKind {
        Threshold,
        Zscore,
        Trend,
    }

    impl std::fmt::Display for DetectorKind {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                DetectorKind::Threshold => write!(f, "threshold"),
                DetectorKind::Zscore => write!(f, "zscore"),
                DetectorKind::Trend => write!(f, "trend"),
            }
        }
    }

    /// Alert levels, lowest first
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum AlertLevel {
        Info,
        Warning,
        Error,
        Critical,
    }

    impl AlertLevel {
        pub fn parse(s: &str) -> Option<Self> {
            match s.to_ascii_lowercase().as_str() {
                "info" => Some(AlertLevel::Info),
                "warning" => Some(AlertLevel::Warning),
                "error" => Some(AlertLevel::Error),
                "critical" => Some(AlertLevel::Critical),
                _ => None,
            }
        }
    }

    impl std::fmt::Display for AlertLevel {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                AlertLevel::Info => write!(f, "INFO"),
                AlertLevel::Warning => write!(f, "WARNING"),
                AlertLevel::Error => write!(f, "ERROR"),
                AlertLevel::Critical => write!(f, "CRITICAL"),
            }
        }
    }

    /// Lifecycle state of an alert record
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum AlertState {
        Active,
        Suppressed,
        Resolved,
    }

    impl AlertState {
        pub fn as_str(self) -> &'static str {
            match self {
                AlertState::Active => "active",
                AlertState::Suppressed => "suppressed",
                AlertState::Resolved => "resolved",
            }
        }

        pub fn parse(s: &str) -> Option<Self> {
            match s {
                "active" => Some(AlertState::Active),
                "suppressed" => Some(AlertState::Suppressed),
                "resolved" => Some(AlertState::Resolved),
                _ => None,
            }
        }

        pub fn is_open(self) -> bool {
            !matches!(self, AlertState::Resolved)
        }
    }

    /// One logical alert lineage: a metric breaching in one direction
    #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
    pub struct DedupKey {
        pub metric: String,
        pub direction: Direction,
    }

    impl std::fmt::Display for DedupKey {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}:{}", self.metric, self.direction.as_str())
        }
    }

    /// Output of the anomaly detector, consumed by the alert manager
    #[derive(Debug, Clone, Serialize)]
    pub struct AnomalyEvent {
        pub metric: String,
        pub tags: Tags,
        pub observed_value: f64,
        pub severity: Severity,
        pub direction: Direction,
        pub rule_triggered: DetectorKind,
        pub detail: String,
        pub detected_at: DateTime<Utc>,
    }

    impl AnomalyEvent {
        pub fn dedup_key(&self) -> DedupKey {
            DedupKey { metric: self.metric.clone(), direction: self.direction }
        }
    }

    /// Outcome of one channel delivering one alert
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct DeliveryRecord {
        pub channel: String,
        pub attempted_at: DateTime<Utc>,
        pub success: bool,
        pub error: Option<String>,
    }

    /// A persisted alert, owned by the alert manager
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AlertRecord {
        pub id: Uuid,
        pub level: AlertLevel,
        pub metric: String,
        pub direction: Direction,
        pub dedup_key: String,
        pub message: String,
        pub observed_value: f64,
        pub hostname: String,
        pub created_at: DateTime<Utc>,
        pub last_fired_at: DateTime<Utc>,
        pub resolved_at: Option<DateTime<Utc>>,
        pub state: AlertState,
        /// Dispatches so far, the first fire included
        pub fire_count: u32,
        /// Breaches swallowed by the cooldown
        pub repeat_count: u32,
        /// Dispatches made for critical breaches, drives escalation
        pub critical_fires: u32,
        #[serde(default)]
        pub deliveries: Vec<DeliveryRecord>,
    }
}
