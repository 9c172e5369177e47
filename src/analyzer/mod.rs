pub mod threshold;
pub mod trend;
pub mod zscore;

use std::collections::{HashMap, HashSet};

use crate::config::{AnalyzerConfig, Rule};
use crate::storage::MetricsStore;
use crate::types::{AnomalyEvent, DedupKey, DetectorKind, MetricSample, SeriesKey};

/// Trait for anomaly detection analyzers.
///
/// Each analyzer applies one kind of rule to a freshly written sample,
/// reading whatever history it needs from the store.
pub trait Analyzer: Send + Sync {
    fn kind(&self) -> DetectorKind;

    fn check(&self, rule: &Rule, sample: &MetricSample, store: &MetricsStore) -> Option<AnomalyEvent>;
}

/// Result of evaluating one batch
#[derive(Debug, Default)]
pub struct Evaluation {
    pub events: Vec<AnomalyEvent>,
    /// Every dedup key that had at least one rule evaluated, breaching or not
    pub evaluated: HashSet<DedupKey>,
}

/// Applies the configured rule set to newly written samples
pub struct AnomalyDetector {
    rules: HashMap<String, Vec<Rule>>,
    threshold: threshold::ThresholdAnalyzer,
    zscore: zscore::ZScoreAnalyzer,
    trend: trend::TrendAnalyzer,
}

impl AnomalyDetector {
    pub fn new(rules: &[Rule], config: &AnalyzerConfig) -> Self {
        let mut by_metric: HashMap<String, Vec<Rule>> = HashMap::new();
        for rule in rules {
            by_metric.entry(rule.metric.clone()).or_default().push(rule.clone());
        }

        tracing::info!(rules = rules.len(), metrics = by_metric.len(), "Initialized anomaly detector");

        Self {
            rules: by_metric,
            threshold: threshold::ThresholdAnalyzer,
            zscore: zscore::ZScoreAnalyzer::new(config),
            trend: trend::TrendAnalyzer::new(config),
        }
    }

    pub fn rules_for(&self, metric: &str) -> &[Rule] {
        self.rules.get(metric).map(Vec::as_slice).unwrap_or(&[])
    }

    fn analyzer(&self, kind: DetectorKind) -> &dyn Analyzer {
        match kind {
            DetectorKind::Threshold => &self.threshold,
            DetectorKind::Zscore => &self.zscore,
            DetectorKind::Trend => &self.trend,
        }
    }

    /// Evaluate the latest sample of every series in `batch`. The batch must
    /// already be written to `store`.
    pub fn evaluate(&self, batch: &[MetricSample], store: &MetricsStore) -> Evaluation {
        let mut latest: HashMap<SeriesKey, &MetricSample> = HashMap::new();
        for sample in batch {
            if !self.rules.contains_key(&sample.name) {
                continue;
            }
            let key = sample.series_key();
            match latest.get(&key) {
                Some(prev) if prev.timestamp > sample.timestamp => {}
                _ => {
                    latest.insert(key, sample);
                }
            }
        }

        let mut evaluation = Evaluation::default();
        let mut samples: Vec<&MetricSample> = latest.into_values().collect();
        samples.sort_by(|a, b| a.name.cmp(&b.name).then(a.timestamp.cmp(&b.timestamp)));

        for sample in samples {
            for rule in self.rules_for(&sample.name) {
                evaluation.evaluated.insert(DedupKey {
                    metric: rule.metric.clone(),
                    direction: rule.direction,
                });
                if let Some(event) = self.analyzer(rule.detector).check(rule, sample, store) {
                    tracing::debug!(
                        metric = %event.metric,
                        rule = %event.rule_triggered,
                        severity = ?event.severity,
                        value = event.observed_value,
                        "Anomaly detected"
                    );
                    evaluation.events.push(event);
                }
            }
        }

        evaluation
    }

    /// Re-check open keys that got no fresh sample this tick against the
    /// newest stored value of each of their series. A key whose series all
    /// stay clear is marked evaluated so its hysteresis clock keeps running.
    pub fn reevaluate_open(&self, open: &[DedupKey], evaluation: &mut Evaluation, store: &MetricsStore) {
        for key in open {
            if evaluation.evaluated.contains(key) {
                continue;
            }
            let rules: Vec<&Rule> = self
                .rules_for(&key.metric)
                .iter()
                .filter(|r| r.direction == key.direction)
                .collect();
            let latest = store.latest(&key.metric);
            if rules.is_empty() || latest.is_empty() {
                continue;
            }

            let breaching = latest.iter().any(|sample| {
                rules
                    .iter()
                    .any(|rule| self.analyzer(rule.detector).check(rule, sample, store).is_some())
            });
            if !breaching {
                tracing::debug!(dedup_key = %key, "No fresh sample, latest stored value is clear");
                evaluation.evaluated.insert(key.clone());
            }
        }
    }
}
