use chrono::{DateTime, Utc};

use crate::config::{AnalyzerConfig, Rule};
use crate::storage::MetricsStore;
use crate::types::{AnomalyEvent, DetectorKind, MetricSample, Severity};
use super::Analyzer;

/// Z-Score based anomaly detection.
/// Detects values that deviate significantly from the trailing window,
/// in either direction.
pub struct ZScoreAnalyzer {
    min_samples: usize,
}

impl ZScoreAnalyzer {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self { min_samples: config.zscore_min_samples }
    }
}

/// Population mean and standard deviation
pub(crate) fn mean_stddev(values: &[f64]) -> Option<(f64, f64)> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    // sample variance
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some((mean, variance.sqrt()))
}

impl Analyzer for ZScoreAnalyzer {
    fn kind(&self) -> DetectorKind { DetectorKind::Zscore }

    fn check(&self, rule: &Rule, sample: &MetricSample, store: &MetricsStore) -> Option<AnomalyEvent> {
        // trailing window, the sample under test excluded
        let history = store.query(
            &sample.name,
            &sample.tags,
            sample.timestamp.checked_sub_signed(rule.window()).unwrap_or(DateTime::<Utc>::MIN_UTC),
            sample.timestamp,
        );
        if history.len() < self.min_samples {
            return None; // Not enough data
        }

        let values: Vec<f64> = history.iter().map(|s| s.value).collect();
        let (mean, stddev) = mean_stddev(&values)?;

        if stddev < 1e-10 {
            return None; // No variation
        }

        let z = (sample.value - mean) / stddev;
        if z.abs() < rule.sigma {
            return None;
        }

        let severity = if z.abs() >= rule.sigma * 2.0 {
            Severity::Critical
        } else {
            Severity::Warning
        };

        Some(AnomalyEvent {
            metric: sample.name.clone(),
            tags: sample.tags.clone(),
            observed_value: sample.value,
            severity,
            direction: rule.direction,
            rule_triggered: DetectorKind::Zscore,
            detail: format!(
                "{} anomaly detected: z-score={:.2} (value={:.2}, mean={:.2}, stddev={:.2})",
                sample.name, z, sample.value, mean, stddev
            ),
            detected_at: sample.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t(i: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(i * 60)
    }

    fn fill(store: &MetricsStore, values: &[f64]) {
        for (i, v) in values.iter().enumerate() {
            store.write(MetricSample::new("docs_per_min", *v, t(i as i64))).unwrap();
        }
    }

    fn analyzer() -> ZScoreAnalyzer {
        ZScoreAnalyzer::new(&AnalyzerConfig::default())
    }

    #[test]
    fn skips_when_history_is_short() {
        let store = MetricsStore::in_memory();
        fill(&store, &[10.0, 11.0, 9.0, 10.0, 500.0]);
        let rule = Rule::zscore("docs_per_min", Direction::LowerIsBad, 3600, 3.0);
        let latest = MetricSample::new("docs_per_min", 500.0, t(4));
        assert!(analyzer().check(&rule, &latest, &store).is_none());
    }

    #[test]
    fn skips_flat_history() {
        let store = MetricsStore::in_memory();
        fill(&store, &[10.0; 30]);
        store.write(MetricSample::new("docs_per_min", 50.0, t(30))).unwrap();
        let rule = Rule::zscore("docs_per_min", Direction::LowerIsBad, 3600, 3.0);
        let latest = MetricSample::new("docs_per_min", 50.0, t(30));
        assert!(analyzer().check(&rule, &latest, &store).is_none());
    }

    #[test]
    fn flags_deviation_on_either_side() {
        let store = MetricsStore::in_memory();
        let history: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 9.0 } else { 11.0 }).collect();
        fill(&store, &history);
        let rule = Rule::zscore("docs_per_min", Direction::LowerIsBad, 3600, 3.0);

        // mean 10, stddev ~1.02
        let drop = MetricSample::new("docs_per_min", 6.5, t(30));
        let event = analyzer().check(&rule, &drop, &store).unwrap();
        assert_eq!(event.severity, Severity::Warning);

        let surge = MetricSample::new("docs_per_min", 17.0, t(30));
        let event = analyzer().check(&rule, &surge, &store).unwrap();
        assert_eq!(event.severity, Severity::Critical);

        let normal = MetricSample::new("docs_per_min", 12.0, t(30));
        assert!(analyzer().check(&rule, &normal, &store).is_none());
    }

    #[test]
    fn stddev_uses_the_sample_estimator() {
        let (mean, sd) = mean_stddev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(mean, 5.0);
        assert!((sd - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
        assert!(mean_stddev(&[1.0]).is_none());
    }

    #[test]
    fn oversized_window_reads_all_history() {
        let store = MetricsStore::in_memory();
        let history: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 9.0 } else { 11.0 }).collect();
        fill(&store, &history);
        let rule = Rule::zscore("docs_per_min", Direction::LowerIsBad, u64::MAX, 3.0);
        let surge = MetricSample::new("docs_per_min", 17.0, t(30));
        assert!(analyzer().check(&rule, &surge, &store).is_some());
    }

    #[test]
    fn window_limits_history() {
        let store = MetricsStore::in_memory();
        let history: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 9.0 } else { 11.0 }).collect();
        fill(&store, &history);
        // 5 minutes of history is below the minimum sample count
        let rule = Rule::zscore("docs_per_min", Direction::LowerIsBad, 300, 3.0);
        let surge = MetricSample::new("docs_per_min", 17.0, t(30));
        assert!(analyzer().check(&rule, &surge, &store).is_none());
    }
}
