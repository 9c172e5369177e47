use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::alerter::AlertManager;
use crate::storage::MetricsStore;
use crate::types::{AlertRecord, AlertState, Tags};

/// Summary statistics of one series over the report period
#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub name: String,
    pub tags: Tags,
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub latest: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertSummary {
    pub by_level: BTreeMap<String, usize>,
    pub active: usize,
    pub suppressed: usize,
    pub resolved: usize,
    /// Breaches swallowed by cooldown across all counted alerts
    pub total_repeats: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub hostname: String,
    pub generated_at: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    /// Series summaries keyed by category
    pub categories: BTreeMap<String, Vec<MetricSummary>>,
    pub alerts: AlertSummary,
    pub active_alerts: Vec<AlertRecord>,
}

/// Category of a series: its `category` tag, else the name up to the first `_`.
pub fn category_of(name: &str, tags: &Tags) -> String {
    if let Some(category) = tags.get("category") {
        return category.clone();
    }
    name.split('_').next().unwrap_or(name).to_string()
}

/// Read-only aggregation over the metrics store and alert history
#[derive(Clone)]
pub struct ReportGenerator {
    store: MetricsStore,
    alerts: AlertManager,
    hostname: String,
}

impl ReportGenerator {
    pub fn new(store: MetricsStore, alerts: AlertManager, hostname: impl Into<String>) -> Self {
        Self { store, alerts, hostname: hostname.into() }
    }

    /// Report over the `period` leading up to now.
    pub async fn generate_performance_report(&self, period: Duration) -> PerformanceReport {
        self.generate_at(Utc::now(), period).await
    }

    /// Report over `[now - period, now]`.
    pub async fn generate_at(&self, now: DateTime<Utc>, period: Duration) -> PerformanceReport {
        let start = now - period;
        let until = now + Duration::nanoseconds(1);

        let mut categories: BTreeMap<String, Vec<MetricSummary>> = BTreeMap::new();
        for key in self.store.series(start, until) {
            let samples = self.store.query(&key.name, &key.tags, start, until);
            let Some(last) = samples.last() else { continue };

            let count = samples.len();
            let (min, max, sum) = samples.iter().fold(
                (f64::INFINITY, f64::NEG_INFINITY, 0.0),
                |(min, max, sum), s| (min.min(s.value), max.max(s.value), sum + s.value),
            );

            categories.entry(category_of(&key.name, &key.tags)).or_default().push(MetricSummary {
                name: key.name.clone(),
                tags: key.tags.clone(),
                count,
                min,
                max,
                avg: sum / count as f64,
                latest: last.value,
            });
        }

        let mut summary = AlertSummary::default();
        let counted = self
            .alerts
            .history()
            .await
            .into_iter()
            .filter(|a| a.state.is_open() || (a.created_at >= start && a.created_at <= now));
        for alert in counted {
            *summary.by_level.entry(alert.level.to_string()).or_default() += 1;
            match alert.state {
                AlertState::Active => summary.active += 1,
                AlertState::Suppressed => summary.suppressed += 1,
                AlertState::Resolved => summary.resolved += 1,
            }
            summary.total_repeats += u64::from(alert.repeat_count);
        }

        PerformanceReport {
            hostname: self.hostname.clone(),
            generated_at: now,
            period_start: start,
            period_end: now,
            categories,
            alerts: summary,
            active_alerts: self.alerts.list_active_alerts().await,
        }
    }
}

impl PerformanceReport {
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Performance report for {} ({} to {})",
            self.hostname,
            self.period_start.format("%Y-%m-%d %H:%M:%S"),
            self.period_end.format("%Y-%m-%d %H:%M:%S"),
        );

        for (category, metrics) in &self.categories {
            let _ = writeln!(out, "\n[{}]", category);
            for m in metrics {
                let tags = if m.tags.is_empty() {
                    String::new()
                } else {
                    let pairs: Vec<String> = m.tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                    format!("{{{}}}", pairs.join(","))
                };
                let _ = writeln!(
                    out,
                    "  {}{}: min={:.2} max={:.2} avg={:.2} latest={:.2} (n={})",
                    m.name, tags, m.min, m.max, m.avg, m.latest, m.count
                );
            }
        }

        let _ = writeln!(
            out,
            "\nAlerts: {} active, {} suppressed, {} resolved, {} repeats suppressed",
            self.alerts.active, self.alerts.suppressed, self.alerts.resolved, self.alerts.total_repeats
        );
        for (level, count) in &self.alerts.by_level {
            let _ = writeln!(out, "  {}: {}", level, count);
        }

        if !self.active_alerts.is_empty() {
            let _ = writeln!(out, "\nOpen alerts:");
            for a in &self.active_alerts {
                let _ = writeln!(
                    out,
                    "  [{}] {} since {} ({})",
                    a.level,
                    a.dedup_key,
                    a.created_at.format("%Y-%m-%d %H:%M:%S"),
                    a.message
                );
            }
        }

        out
    }
}
