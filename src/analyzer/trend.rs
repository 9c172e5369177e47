use chrono::{DateTime, Duration, Utc};

use crate::config::{AnalyzerConfig, Rule};
use crate::storage::MetricsStore;
use crate::types::{AnomalyEvent, DetectorKind, Direction, MetricSample, Severity};
use super::Analyzer;

/// Trend-based anomaly detection using linear regression.
/// Flags a sustained slope in the unhealthy direction.
pub struct TrendAnalyzer {
    min_samples: usize,
    min_r_squared: f64,
}

impl TrendAnalyzer {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            min_samples: config.trend_min_samples,
            min_r_squared: config.trend_min_r_squared,
        }
    }

    /// Perform simple linear regression on (x, y) pairs.
    /// Returns (slope, intercept, r_squared).
    pub(crate) fn linear_regression(xs: &[f64], ys: &[f64]) -> Option<(f64, f64, f64)> {
        let n = xs.len() as f64;
        if n < 2.0 || xs.len() != ys.len() { return None; }

        let sum_x: f64 = xs.iter().sum();
        let sum_y: f64 = ys.iter().sum();
        let sum_xy: f64 = xs.iter().zip(ys).map(|(x, y)| x * y).sum();
        let sum_x2: f64 = xs.iter().map(|x| x * x).sum();

        let denom = n * sum_x2 - sum_x * sum_x;
        if denom.abs() < 1e-10 { return None; }

        let slope = (n * sum_xy - sum_x * sum_y) / denom;
        let intercept = (sum_y - slope * sum_x) / n;

        // R-squared
        let ss_res: f64 = xs.iter().zip(ys).map(|(x, y)| {
            let predicted = slope * x + intercept;
            (y - predicted).powi(2)
        }).sum();
        let mean_y = sum_y / n;
        let ss_tot: f64 = ys.iter().map(|y| (y - mean_y).powi(2)).sum();
        let r_squared = if ss_tot > 1e-10 { 1.0 - ss_res / ss_tot } else { 0.0 };

        Some((slope, intercept, r_squared))
    }
}

impl Analyzer for TrendAnalyzer {
    fn kind(&self) -> DetectorKind { DetectorKind::Trend }

    fn check(&self, rule: &Rule, sample: &MetricSample, store: &MetricsStore) -> Option<AnomalyEvent> {
        let threshold = rule.slope_threshold?;

        // trailing window, the sample under test included
        let samples = store.query(
            &sample.name,
            &sample.tags,
            sample.timestamp.checked_sub_signed(rule.window()).unwrap_or(DateTime::<Utc>::MIN_UTC),
            sample.timestamp + Duration::nanoseconds(1),
        );
        if samples.len() < self.min_samples { return None; }

        // x relative to the first sample keeps the sums well conditioned
        let origin = samples.first()?.timestamp;
        let xs: Vec<f64> = samples.iter()
            .map(|s| (s.timestamp - origin).num_milliseconds() as f64 / 1000.0)
            .collect();
        let ys: Vec<f64> = samples.iter().map(|s| s.value).collect();

        let (slope, _intercept, r_squared) = Self::linear_regression(&xs, &ys)?;
        let per_minute = slope * 60.0;

        // positive when moving the wrong way
        let degrading = match rule.direction {
            Direction::HigherIsBad => per_minute,
            Direction::LowerIsBad => -per_minute,
        };

        if degrading <= threshold || r_squared < self.min_r_squared { return None; }

        let severity = if degrading >= threshold * 2.0 {
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
            rule_triggered: DetectorKind::Trend,
            detail: format!(
                "{} trending the wrong way: slope={:.4}/min over {} samples (current={:.2}, R²={:.2})",
                sample.name, per_minute, samples.len(), sample.value, r_squared
            ),
            detected_at: sample.timestamp,
        })
    }
}
