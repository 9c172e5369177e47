pub mod cpu;
pub mod disk;
pub mod memory;
pub mod network;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::alerter::{AlertManager, Dispatcher};
use crate::analyzer::AnomalyDetector;
use crate::config::{CollectorConfig, Config};
use crate::error::{MonitorError, Result};
use crate::storage::{BatchOutcome, MetricsStore};
use crate::types::{MetricSample, Tags};

/// Trait for system resource probes.
///
/// Each probe gathers one category of resource metrics and returns them
/// stamped with the tick time.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Human-readable name for this probe (e.g., "cpu", "memory")
    fn name(&self) -> &str;

    /// Collect metrics. Called once per tick.
    async fn collect(&mut self, now: DateTime<Utc>) -> Result<Vec<MetricSample>>;
}

/// Create all enabled probes based on configuration
pub fn create_probes(config: &CollectorConfig) -> Vec<Box<dyn Probe>> {
    let mut probes: Vec<Box<dyn Probe>> = Vec::new();

    if config.cpu {
        probes.push(Box::new(cpu::CpuProbe::new(&config.proc_root)));
    }

    if config.memory {
        probes.push(Box::new(memory::MemoryProbe::new(&config.proc_root)));
    }

    if config.disk {
        probes.push(Box::new(disk::DiskProbe::new(&config.disk_mountpoints)));
    }

    if config.network {
        probes.push(Box::new(network::NetworkProbe::new(&config.proc_root, &config.exclude_interfaces)));
    }

    tracing::info!(count = probes.len(), "Initialized probes");
    probes
}

/// Cumulative counters exported as meta-metrics
#[derive(Debug, Default)]
struct Counters {
    probe_failures: AtomicU64,
    samples_rejected: AtomicU64,
    push_dropped: AtomicU64,
    storage_write_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectorStats {
    pub probe_failures: u64,
    pub samples_rejected: u64,
    pub push_dropped: u64,
    pub storage_write_failures: u64,
    pub delivery_failures: u64,
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub written: usize,
    pub rejected: usize,
    pub probe_failures: usize,
    pub dispatched: usize,
}

struct TickState {
    probes: Vec<Box<dyn Probe>>,
    push_rx: mpsc::Receiver<MetricSample>,
}

/// Gathers probe output and pushed samples into one batch per tick, stores
/// it, evaluates it, and hands alerts to the dispatcher.
pub struct Collector {
    store: MetricsStore,
    detector: AnomalyDetector,
    alerts: AlertManager,
    dispatcher: Dispatcher,
    push_tx: mpsc::Sender<MetricSample>,
    state: Mutex<TickState>,
    counters: Counters,
    write_retries: u32,
    retry_backoff: Duration,
}

impl Collector {
    pub fn new(config: &Config, store: MetricsStore, alerts: AlertManager, dispatcher: Dispatcher) -> Self {
        let (push_tx, push_rx) = mpsc::channel(config.storage.push_queue_capacity);
        Self {
            store,
            detector: AnomalyDetector::new(&config.rules, &config.analyzer),
            alerts,
            dispatcher,
            push_tx,
            state: Mutex::new(TickState {
                probes: create_probes(&config.collector),
                push_rx,
            }),
            counters: Counters::default(),
            write_retries: config.storage.write_retries,
            retry_backoff: Duration::from_millis(config.storage.retry_backoff_ms),
        }
    }

    /// Add a probe on top of the configured ones.
    pub fn with_probe(mut self, probe: Box<dyn Probe>) -> Self {
        self.state.get_mut().probes.push(probe);
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            probe_failures: self.counters.probe_failures.load(Ordering::Relaxed),
            samples_rejected: self.counters.samples_rejected.load(Ordering::Relaxed),
            push_dropped: self.counters.push_dropped.load(Ordering::Relaxed),
            storage_write_failures: self.counters.storage_write_failures.load(Ordering::Relaxed),
            delivery_failures: self.dispatcher.failure_count(),
        }
    }

    /// Queue a sample for the next tick. Never waits: a full queue rejects
    /// the sample with `Backpressure`.
    pub fn push_metric(
        &self,
        name: &str,
        value: f64,
        tags: Tags,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if name.trim().is_empty() || !value.is_finite() {
            self.counters.samples_rejected.fetch_add(1, Ordering::Relaxed);
            let reason = if value.is_finite() {
                "metric name is empty".to_string()
            } else {
                format!("value {} is not finite", value)
            };
            tracing::warn!(metric = %name, reason = %reason, "Rejected pushed sample");
            return Err(MonitorError::validation(name, reason));
        }

        let sample = MetricSample {
            name: name.to_string(),
            value,
            tags,
            timestamp: timestamp.unwrap_or_else(Utc::now),
        };

        match self.push_tx.try_send(sample) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.push_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(metric = %name, "Push queue full, dropping sample");
                Err(MonitorError::Backpressure { metric: name.to_string() })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(MonitorError::Storage("push queue closed".into()))
            }
        }
    }

    pub async fn tick(&self) -> TickSummary {
        self.tick_at(Utc::now()).await
    }

    /// Run one collection tick as of `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickSummary {
        let mut state = self.state.lock().await;
        let mut summary = TickSummary::default();
        let mut batch = Vec::new();

        for probe in state.probes.iter_mut() {
            match probe.collect(now).await {
                Ok(samples) => batch.extend(samples),
                Err(e) => {
                    summary.probe_failures += 1;
                    self.counters.probe_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(probe = probe.name(), error = %e, "Probe failed");
                }
            }
        }

        drain(&mut state.push_rx, &mut batch);
        batch.extend(self.meta_metrics(now));
        batch.sort_by_key(|s| s.timestamp);

        let Some(outcome) = self.write_with_retry(batch).await else {
            return summary;
        };

        summary.written = outcome.written.len();
        summary.rejected = outcome.rejected.len();

        let mut evaluation = self.detector.evaluate(&outcome.written, &self.store);
        let open = self.alerts.open_keys().await;
        self.detector.reevaluate_open(&open, &mut evaluation, &self.store);
        let to_dispatch = self.alerts.process(now, &evaluation).await;
        summary.dispatched = to_dispatch.len();
        for record in to_dispatch {
            self.dispatcher.spawn(record, self.alerts.clone());
        }

        tracing::debug!(
            written = summary.written,
            rejected = summary.rejected,
            events = evaluation.events.len(),
            dispatched = summary.dispatched,
            "Tick complete"
        );
        summary
    }

    /// Write every queued push to the store without running probes or
    /// detection. Returns how many samples were written.
    pub async fn flush_pending(&self) -> usize {
        let mut state = self.state.lock().await;
        let mut batch = Vec::new();
        drain(&mut state.push_rx, &mut batch);
        if batch.is_empty() {
            return 0;
        }
        batch.sort_by_key(|s| s.timestamp);

        let written = self.write_with_retry(batch).await.map(|o| o.written.len()).unwrap_or(0);
        tracing::info!(written, "Flushed pending samples");
        written
    }

    fn meta_metrics(&self, now: DateTime<Utc>) -> Vec<MetricSample> {
        let stats = self.stats();
        vec![
            MetricSample::new("monitor_probe_failures", stats.probe_failures as f64, now),
            MetricSample::new("monitor_samples_rejected", stats.samples_rejected as f64, now),
            MetricSample::new("monitor_push_dropped", stats.push_dropped as f64, now),
            MetricSample::new("monitor_storage_write_failures", stats.storage_write_failures as f64, now),
            MetricSample::new("monitor_delivery_failures", stats.delivery_failures as f64, now),
        ]
    }

    /// Batches commit atomically, so a failed attempt can be replayed whole.
    /// The commit runs on the blocking pool.
    async fn write_with_retry(&self, batch: Vec<MetricSample>) -> Option<BatchOutcome> {
        let mut backoff = self.retry_backoff;
        let mut attempt = 0;

        loop {
            let store = self.store.clone();
            let attempt_batch = batch.clone();
            let result = tokio::task::spawn_blocking(move || store.write_batch(attempt_batch))
                .await
                .unwrap_or_else(|e| Err(MonitorError::Storage(format!("write task failed: {}", e))));

            match result {
                Ok(outcome) => {
                    for e in &outcome.rejected {
                        self.counters.samples_rejected.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(error = %e, "Rejected sample");
                    }
                    return Some(outcome);
                }
                Err(e) if attempt < self.write_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "Storage write failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    self.counters.storage_write_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(lost = batch.len(), error = %e, "Storage write failed, samples lost");
                    return None;
                }
            }
        }
    }
}

fn drain(rx: &mut mpsc::Receiver<MetricSample>, batch: &mut Vec<MetricSample>) {
    while let Ok(sample) = rx.try_recv() {
        batch.push(sample);
    }
}
