use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::alerter::store::AlertStore;
use crate::alerter::{AlertManager, AlertPolicy, Dispatcher};
use crate::collector::{Collector, CollectorStats};
use crate::config::Config;
use crate::error::Result;
use crate::report::{PerformanceReport, ReportGenerator};
use crate::storage::MetricsStore;
use crate::types::{AlertRecord, MetricSample, Tags};

/// The monitoring subsystem: one store, one alert manager, one collector
/// and the background loops driving them.
pub struct Monitor {
    config: Config,
    store: MetricsStore,
    alerts: AlertManager,
    collector: Arc<Collector>,
    reporter: ReportGenerator,
    running: Mutex<Option<Running>>,
}

struct Running {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Monitor {
    pub fn new(config: Config) -> Result<Self> {
        let dispatcher = Dispatcher::from_config(&config.alerting, &config.monitor.hostname)?;
        Self::with_dispatcher(config, dispatcher)
    }

    /// Build the monitor around an already assembled dispatcher.
    pub fn with_dispatcher(config: Config, dispatcher: Dispatcher) -> Result<Self> {
        config.validate()?;

        let keep_since = Utc::now() - config.monitor.retention();
        let store = MetricsStore::open(&config.storage, keep_since)?;
        let alerts = AlertManager::new(
            AlertPolicy::from_config(&config.monitor, &config.alerting),
            AlertStore::open(&config.storage)?,
            config.monitor.hostname.clone(),
        )?;

        tracing::info!(
            channels = ?dispatcher.channel_names(),
            rules = config.rules.len(),
            durable = store.is_durable(),
            "Monitor initialized"
        );

        let collector = Arc::new(Collector::new(&config, store.clone(), alerts.clone(), dispatcher));
        let reporter = ReportGenerator::new(store.clone(), alerts.clone(), config.monitor.hostname.clone());

        Ok(Self {
            config,
            store,
            alerts,
            collector,
            reporter,
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn store(&self) -> &MetricsStore {
        &self.store
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    pub fn stats(&self) -> CollectorStats {
        self.collector.stats()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Spawn the tick, report and retention loops. A second call while
    /// running is a no-op.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            tracing::warn!("Monitor already running");
            return;
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(tick_loop(
            self.collector.clone(),
            self.config.monitor.metrics_interval(),
            cancel.clone(),
        ));
        tracker.spawn(report_loop(
            self.reporter.clone(),
            self.config.monitor.report_interval(),
            self.config.monitor.report_dir.clone().map(PathBuf::from),
            cancel.clone(),
        ));
        tracker.spawn(retention_loop(
            self.store.clone(),
            self.config.monitor.retention(),
            self.config.monitor.metrics_interval(),
            cancel.clone(),
        ));

        tracing::info!(
            metrics_interval = self.config.monitor.metrics_interval,
            report_interval = self.config.monitor.report_interval,
            "Monitor started"
        );
        *running = Some(Running { cancel, tracker });
    }

    /// Cancel the loops, let an in-flight tick finish, then write queued
    /// pushes and wait for outstanding dispatches. The monitor can be
    /// started again afterwards.
    pub async fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();

        if let Some(Running { cancel, tracker }) = running {
            cancel.cancel();
            tracker.close();
            tracker.wait().await;
        }

        self.collector.flush_pending().await;
        self.collector.dispatcher().wait_idle().await;
        tracing::info!("Monitor stopped");
    }

    pub fn push_metric(
        &self,
        name: &str,
        value: f64,
        tags: Tags,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.collector.push_metric(name, value, tags, timestamp)
    }

    /// Samples of one series in `[since, until)`.
    pub fn get_metrics(
        &self,
        name: &str,
        tags: &Tags,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Vec<MetricSample> {
        self.store.query(name, tags, since, until)
    }

    pub async fn generate_performance_report(&self, period: chrono::Duration) -> PerformanceReport {
        self.reporter.generate_performance_report(period).await
    }

    pub async fn list_active_alerts(&self) -> Vec<AlertRecord> {
        self.alerts.list_active_alerts().await
    }
}

async fn tick_loop(collector: Arc<Collector>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Tick loop stopping");
                break;
            }
            _ = interval.tick() => {
                collector.tick().await;
            }
        }
    }
}

async fn report_loop(
    reporter: ReportGenerator,
    period: Duration,
    report_dir: Option<PathBuf>,
    cancel: CancellationToken,
) {
    // first report after one full period
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let span = chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::hours(1));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Report loop stopping");
                break;
            }
            _ = interval.tick() => {
                let report = reporter.generate_performance_report(span).await;
                tracing::info!(
                    categories = report.categories.len(),
                    active_alerts = report.active_alerts.len(),
                    resolved = report.alerts.resolved,
                    "Performance report generated"
                );
                if let Some(dir) = &report_dir {
                    if let Err(e) = write_report(dir, &report).await {
                        tracing::error!(dir = %dir.display(), error = %e, "Failed to write report");
                    }
                }
            }
        }
    }
}

async fn retention_loop(
    store: MetricsStore,
    retention: chrono::Duration,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Retention loop stopping");
                break;
            }
            _ = interval.tick() => {
                let cutoff = Utc::now() - retention;
                match store.purge(cutoff) {
                    Ok(0) => tracing::debug!("Retention: nothing to purge"),
                    Ok(removed) => tracing::info!(removed, "Retention: purged old samples"),
                    Err(e) => tracing::error!(error = %e, "Retention: purge failed"),
                }
            }
        }
    }
}

/// Write the report as JSON under `dir`, named by its generation time.
pub async fn write_report(dir: &Path, report: &PerformanceReport) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("report-{}.json", report.generated_at.format("%Y%m%dT%H%M%SZ")));
    let body = serde_json::to_vec_pretty(report)?;
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CollectorConfig, StorageConfig};
    use crate::types::AlertLevel;
    use chrono::SubsecRound;

    fn config() -> Config {
        Config { collector: CollectorConfig::push_only(), ..Config::default() }
    }

    fn monitor(config: Config) -> Monitor {
        let dispatcher = Dispatcher::new(Vec::new(), Duration::from_secs(1), AlertLevel::Info);
        Monitor::with_dispatcher(config, dispatcher).unwrap()
    }

    #[tokio::test]
    async fn stop_flushes_pushes_made_after_the_last_tick() {
        let mut cfg = config();
        cfg.monitor.metrics_interval = 3600;
        let m = monitor(cfg);
        m.start();
        assert!(m.is_running());

        let now = Utc::now();
        m.push_metric("docs_per_min", 7.0, Tags::new(), Some(now)).unwrap();
        m.stop().await;
        assert!(!m.is_running());

        let got = m.get_metrics("docs_per_min", &Tags::new(), now, now + chrono::Duration::seconds(1));
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn can_restart_after_stop() {
        let m = monitor(config());
        m.start();
        m.start();
        m.stop().await;
        m.start();
        assert!(m.is_running());
        m.stop().await;
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let mut cfg = config();
        cfg.monitor.metrics_interval = 0;
        let dispatcher = Dispatcher::new(Vec::new(), Duration::from_secs(1), AlertLevel::Info);
        let err = Monitor::with_dispatcher(cfg, dispatcher).err().unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn open_alerts_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.storage = StorageConfig {
            sqlite_path: Some(dir.path().join("monitor.db").to_string_lossy().to_string()),
            ..StorageConfig::default()
        };

        // whole seconds survive the microsecond round trip through SQLite
        let now = Utc::now().trunc_subsecs(0);
        {
            let m = monitor(cfg.clone());
            m.push_metric("cpu_usage", 97.0, Tags::new(), Some(now)).unwrap();
            m.collector().tick_at(now).await;
            m.stop().await;
            assert_eq!(m.list_active_alerts().await.len(), 1);
        }

        let m = monitor(cfg);
        let active = m.list_active_alerts().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].metric, "cpu_usage");
        assert_eq!(m.get_metrics("cpu_usage", &Tags::new(), now, now + chrono::Duration::seconds(1)).len(), 1);
    }

    #[tokio::test]
    async fn writes_report_json() {
        let dir = tempfile::tempdir().unwrap();
        let m = monitor(config());
        let report = m.generate_performance_report(chrono::Duration::hours(1)).await;
        let path = write_report(dir.path(), &report).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert!(body["categories"].is_object());
    }
}
