use anyhow::Context;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

use crate::error::{MonitorError, Result};
use crate::types::{AlertLevel, DetectorKind, Direction};

/// Longest accepted interval, window, cooldown or retention span (ten years)
pub const MAX_SPAN_SECS: u64 = 10 * 365 * 24 * 3600;

fn span(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_SPAN_SECS) as i64)
}

fn check_span(field: &str, secs: u64) -> Result<()> {
    if secs > MAX_SPAN_SECS {
        return Err(MonitorError::config(format!(
            "{} of {}s exceeds the maximum of {}s",
            field, secs, MAX_SPAN_SECS
        )));
    }
    Ok(())
}

/// Top-level configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default = "default_rules")]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub alerting: AlertingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            storage: StorageConfig::default(),
            collector: CollectorConfig::default(),
            analyzer: AnalyzerConfig::default(),
            rules: default_rules(),
            alerting: AlertingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    /// Seconds between collector ticks
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval: u64,
    /// Seconds between performance digests
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,
    /// Seconds between dispatches of the same alert
    #[serde(default = "default_cooldown")]
    pub alert_cooldown: u64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    /// Seconds a metric must stay clear before its alert resolves.
    /// Defaults to one metrics interval.
    pub hysteresis: Option<u64>,
    /// When set, a critical alert stays ERROR until it has refired more than
    /// this many times. Unset maps critical breaches straight to CRITICAL.
    pub escalation_refires: Option<u32>,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub report_dir: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            metrics_interval: 60,
            report_interval: 3600,
            alert_cooldown: 300,
            retention_hours: 24,
            hysteresis: None,
            escalation_refires: None,
            hostname: default_hostname(),
            log_level: default_log_level(),
            report_dir: None,
        }
    }
}

impl MonitorConfig {
    pub fn metrics_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.metrics_interval)
    }

    pub fn report_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.report_interval)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        span(self.alert_cooldown)
    }

    pub fn hysteresis(&self) -> chrono::Duration {
        span(self.hysteresis.unwrap_or(self.metrics_interval))
    }

    pub fn retention(&self) -> chrono::Duration {
        span(self.retention_hours.saturating_mul(3600))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// SQLite file backing both logical tables; memory only when unset
    pub sqlite_path: Option<String>,
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_push_queue_capacity")]
    pub push_queue_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: None,
            write_retries: 3,
            retry_backoff_ms: 200,
            push_queue_capacity: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    #[serde(default = "default_true")]
    pub cpu: bool,
    #[serde(default = "default_true")]
    pub memory: bool,
    #[serde(default = "default_true")]
    pub disk: bool,
    #[serde(default = "default_true")]
    pub network: bool,
    #[serde(default = "default_proc_root")]
    pub proc_root: String,
    #[serde(default = "default_disk_mountpoints")]
    pub disk_mountpoints: Vec<String>,
    #[serde(default = "default_exclude_interfaces")]
    pub exclude_interfaces: Vec<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            cpu: true,
            memory: true,
            disk: true,
            network: true,
            proc_root: default_proc_root(),
            disk_mountpoints: default_disk_mountpoints(),
            exclude_interfaces: default_exclude_interfaces(),
        }
    }
}

impl CollectorConfig {
    /// No system probes; only pushed metrics are collected.
    pub fn push_only() -> Self {
        Self { cpu: false, memory: false, disk: false, network: false, ..Self::default() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct AnalyzerConfig {
    #[serde(default = "default_zscore_min_samples")]
    pub zscore_min_samples: usize,
    #[serde(default = "default_trend_min_samples")]
    pub trend_min_samples: usize,
    #[serde(default = "default_r_squared")]
    pub trend_min_r_squared: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            zscore_min_samples: 10,
            trend_min_samples: 5,
            trend_min_r_squared: 0.5,
        }
    }
}

/// A detection rule for one metric name
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub metric: String,
    pub direction: Direction,
    #[serde(default = "default_detector")]
    pub detector: DetectorKind,
    pub warning: Option<f64>,
    pub critical: Option<f64>,
    /// Trailing window in seconds for zscore and trend rules
    #[serde(default = "default_window")]
    pub window: u64,
    #[serde(default = "default_sigma")]
    pub sigma: f64,
    /// Degrading slope, in metric units per minute, that trend rules flag
    pub slope_threshold: Option<f64>,
}

impl Rule {
    pub fn threshold(metric: &str, direction: Direction, warning: f64, critical: f64) -> Self {
        Self {
            metric: metric.to_string(),
            direction,
            detector: DetectorKind::Threshold,
            warning: Some(warning),
            critical: Some(critical),
            window: default_window(),
            sigma: default_sigma(),
            slope_threshold: None,
        }
    }

    pub fn zscore(metric: &str, direction: Direction, window_secs: u64, sigma: f64) -> Self {
        Self {
            metric: metric.to_string(),
            direction,
            detector: DetectorKind::Zscore,
            warning: None,
            critical: None,
            window: window_secs,
            sigma,
            slope_threshold: None,
        }
    }

    pub fn trend(metric: &str, direction: Direction, window_secs: u64, slope_per_minute: f64) -> Self {
        Self {
            metric: metric.to_string(),
            direction,
            detector: DetectorKind::Trend,
            warning: None,
            critical: None,
            window: window_secs,
            sigma: default_sigma(),
            slope_threshold: Some(slope_per_minute),
        }
    }

    pub fn window(&self) -> chrono::Duration {
        span(self.window)
    }

    fn validate(&self) -> Result<()> {
        let bad = |msg: &str| {
            Err(MonitorError::config(format!(
                "rule {} ({}): {}",
                self.metric, self.detector, msg
            )))
        };

        if self.metric.trim().is_empty() {
            return bad("metric name is empty");
        }
        if self.window > MAX_SPAN_SECS {
            return bad(&format!("window exceeds the maximum of {}s", MAX_SPAN_SECS));
        }

        match self.detector {
            DetectorKind::Threshold => {
                let (Some(warn), Some(crit)) = (self.warning, self.critical) else {
                    return bad("threshold rules need both warning and critical");
                };
                if !warn.is_finite() || !crit.is_finite() {
                    return bad("thresholds must be finite");
                }
                // critical must sit at or beyond warning on the unhealthy side
                if !self.direction.breaches(crit, warn) {
                    return bad("critical is on the healthy side of warning");
                }
            }
            DetectorKind::Zscore => {
                if !(self.sigma.is_finite() && self.sigma > 0.0) {
                    return bad("sigma must be a positive number");
                }
                if self.window == 0 {
                    return bad("window must be positive");
                }
            }
            DetectorKind::Trend => {
                match self.slope_threshold {
                    Some(s) if s.is_finite() && s > 0.0 => {}
                    _ => return bad("slope_threshold must be a positive number"),
                }
                if self.window == 0 {
                    return bad("window must be positive");
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct AlertingConfig {
    #[serde(default)]
    pub email_alerts_enabled: bool,
    #[serde(default)]
    pub webhook_alerts_enabled: bool,
    /// Seconds a single channel send may take
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout: u64,
    #[serde(default = "default_true")]
    pub recovery_notifications: bool,
    #[serde(default = "default_min_level")]
    pub min_level: String,
    #[serde(default)]
    pub email: Option<EmailConfig>,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            email_alerts_enabled: false,
            webhook_alerts_enabled: false,
            delivery_timeout: 10,
            recovery_notifications: true,
            min_level: default_min_level(),
            email: None,
            webhook: None,
        }
    }
}

impl AlertingConfig {
    pub fn delivery_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.delivery_timeout)
    }

    pub fn min_level(&self) -> Result<AlertLevel> {
        AlertLevel::parse(&self.min_level)
            .ok_or_else(|| MonitorError::config(format!("unknown alert level: {}", self.min_level)))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct EmailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default = "default_true")]
    pub smtp_tls: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub from: String,
    pub to: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to load configuration from {}", path))?;

        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content)?;

        let config: Config = toml::from_str(&expanded)
            .map_err(|e| MonitorError::config(format!("failed to parse configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.monitor;
        if m.metrics_interval == 0 {
            return Err(MonitorError::config("metrics_interval must be positive"));
        }
        if m.report_interval == 0 {
            return Err(MonitorError::config("report_interval must be positive"));
        }
        if m.retention_hours == 0 {
            return Err(MonitorError::config("retention_hours must be positive"));
        }
        check_span("metrics_interval", m.metrics_interval)?;
        check_span("report_interval", m.report_interval)?;
        check_span("alert_cooldown", m.alert_cooldown)?;
        check_span("retention_hours", m.retention_hours.saturating_mul(3600))?;
        if let Some(h) = m.hysteresis {
            check_span("hysteresis", h)?;
        }
        if self.storage.push_queue_capacity == 0 {
            return Err(MonitorError::config("push_queue_capacity must be positive"));
        }
        if self.analyzer.zscore_min_samples < 2 {
            return Err(MonitorError::config("zscore_min_samples must be at least 2"));
        }
        if self.analyzer.trend_min_samples < 2 {
            return Err(MonitorError::config("trend_min_samples must be at least 2"));
        }

        let mut seen = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !seen.insert((rule.metric.as_str(), rule.direction, rule.detector)) {
                return Err(MonitorError::config(format!(
                    "duplicate {} rule for {} ({})",
                    rule.detector,
                    rule.metric,
                    rule.direction.as_str()
                )));
            }
        }

        let a = &self.alerting;
        a.min_level()?;
        if a.delivery_timeout == 0 {
            return Err(MonitorError::config("delivery_timeout must be positive"));
        }
        check_span("delivery_timeout", a.delivery_timeout)?;
        if a.email_alerts_enabled {
            match &a.email {
                Some(email) if !email.to.is_empty() => {}
                Some(_) => return Err(MonitorError::config("email alerts need at least one recipient")),
                None => return Err(MonitorError::config("email_alerts_enabled without [alerting.email]")),
            }
        }
        if a.webhook_alerts_enabled && a.webhook.is_none() {
            return Err(MonitorError::config("webhook_alerts_enabled without [alerting.webhook]"));
        }

        Ok(())
    }
}

/// Expand ${ENV_VAR} references in config string
fn expand_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| MonitorError::config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .to_string())
}

/// Resource rules installed when the file defines none
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::threshold("cpu_usage", Direction::HigherIsBad, 80.0, 90.0),
        Rule::threshold("memory_usage", Direction::HigherIsBad, 80.0, 90.0),
        Rule::threshold("disk_usage", Direction::HigherIsBad, 85.0, 95.0),
    ]
}

// Default value functions
fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
fn default_log_level() -> String { "info".to_string() }
fn default_metrics_interval() -> u64 { 60 }
fn default_report_interval() -> u64 { 3600 }
fn default_cooldown() -> u64 { 300 }
fn default_retention_hours() -> u64 { 24 }
fn default_write_retries() -> u32 { 3 }
fn default_retry_backoff_ms() -> u64 { 200 }
fn default_push_queue_capacity() -> usize { 10_000 }
fn default_true() -> bool { true }
fn default_proc_root() -> String { "/proc".to_string() }
fn default_disk_mountpoints() -> Vec<String> { vec!["/".into()] }
fn default_exclude_interfaces() -> Vec<String> { vec!["lo".into()] }
fn default_zscore_min_samples() -> usize { 10 }
fn default_trend_min_samples() -> usize { 5 }
fn default_r_squared() -> f64 { 0.5 }
fn default_detector() -> DetectorKind { DetectorKind::Threshold }
fn default_window() -> u64 { 3600 }
fn default_sigma() -> f64 { 3.0 }
fn default_delivery_timeout() -> u64 { 10 }
fn default_min_level() -> String { "info".to_string() }
fn default_smtp_port() -> u16 { 587 }
