use crate::config::Rule;
use crate::storage::MetricsStore;
use crate::types::{AnomalyEvent, DetectorKind, MetricSample, Severity};
use super::Analyzer;

/// Static threshold detection.
/// Compares the sample against the rule's critical then warning limit.
pub struct ThresholdAnalyzer;

impl Analyzer for ThresholdAnalyzer {
    fn kind(&self) -> DetectorKind { DetectorKind::Threshold }

    fn check(&self, rule: &Rule, sample: &MetricSample, _store: &MetricsStore) -> Option<AnomalyEvent> {
        let value = sample.value;

        let (severity, limit) = match (rule.critical, rule.warning) {
            (Some(crit), _) if rule.direction.breaches(value, crit) => (Severity::Critical, crit),
            (_, Some(warn)) if rule.direction.breaches(value, warn) => (Severity::Warning, warn),
            _ => return None,
        };

        let label = match severity {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
        };

        Some(AnomalyEvent {
            metric: sample.name.clone(),
            tags: sample.tags.clone(),
            observed_value: value,
            severity,
            direction: rule.direction,
            rule_triggered: DetectorKind::Threshold,
            detail: format!("{} is {:.2} ({} threshold: {:.2})", sample.name, value, label, limit),
            detected_at: sample.timestamp,
        })
    }
}
