pub mod database;
pub mod email;
pub mod store;
pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::analyzer::Evaluation;
use crate::config::{AlertingConfig, MonitorConfig};
use crate::error::Result;
use crate::types::{
    AlertLevel, AlertRecord, AlertState, AnomalyEvent, DedupKey, DeliveryRecord, Severity,
};
use store::AlertStore;

/// The delivery sink variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Email,
    Webhook,
    DatabaseOnly,
}

/// Trait for alert delivery channels
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel name
    fn name(&self) -> &str;

    fn kind(&self) -> ChannelKind;

    /// Send a single alert
    async fn send(&self, alert: &AlertRecord) -> Result<()>;
}

/// Fans an alert out to every channel, each bounded by a timeout.
#[derive(Clone)]
pub struct Dispatcher {
    channels: Arc<Vec<Arc<dyn NotificationChannel>>>,
    timeout: Duration,
    min_level: AlertLevel,
    tracker: TaskTracker,
    failures: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>, timeout: Duration, min_level: AlertLevel) -> Self {
        Self {
            channels: Arc::new(channels),
            timeout,
            min_level,
            tracker: TaskTracker::new(),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Build the enabled channels. The database-only channel is always present.
    pub fn from_config(config: &AlertingConfig, hostname: &str) -> Result<Self> {
        let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();

        if config.email_alerts_enabled {
            if let Some(ref ec) = config.email {
                channels.push(Arc::new(email::EmailChannel::new(ec, config.delivery_timeout())?));
            }
        }

        if config.webhook_alerts_enabled {
            if let Some(ref wc) = config.webhook {
                channels.push(Arc::new(webhook::WebhookChannel::new(
                    wc,
                    hostname,
                    config.delivery_timeout(),
                )?));
            }
        }

        channels.push(Arc::new(database::DatabaseOnlyChannel));

        tracing::info!(channels = channels.len(), "Initialized alert channels");

        Ok(Self::new(channels, config.delivery_timeout(), config.min_level()?))
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    /// Failed or timed-out channel sends since startup
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Deliver to all channels concurrently and report each outcome.
    /// A failing channel never affects its siblings.
    pub async fn dispatch(&self, alert: &AlertRecord) -> Vec<DeliveryRecord> {
        if alert.level < self.min_level {
            tracing::debug!(alert_id = %alert.id, level = %alert.level, "Alert below notification level");
            return Vec::new();
        }

        let sends = self.channels.iter().map(|channel| async move {
            let attempted_at = Utc::now();
            let result = match tokio::time::timeout(self.timeout, channel.send(alert)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {:?}", self.timeout)),
            };

            match result {
                Ok(()) => {
                    tracing::debug!(channel = channel.name(), alert_id = %alert.id, "Alert delivered");
                    DeliveryRecord { channel: channel.name().to_string(), attempted_at, success: true, error: None }
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        channel = channel.name(),
                        alert_id = %alert.id,
                        error = %e,
                        "Failed to send alert"
                    );
                    DeliveryRecord { channel: channel.name().to_string(), attempted_at, success: false, error: Some(e) }
                }
            }
        });

        futures::future::join_all(sends).await
    }

    /// Dispatch in the background and record the outcomes on the alert.
    pub fn spawn(&self, alert: AlertRecord, manager: AlertManager) {
        let dispatcher = self.clone();
        self.tracker.spawn(async move {
            let deliveries = dispatcher.dispatch(&alert).await;
            if !deliveries.is_empty() {
                manager.record_deliveries(alert.id, deliveries).await;
            }
        });
    }

    /// Wait for every background dispatch started so far.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

/// Timing and escalation policy of the alert state machine
#[derive(Debug, Clone)]
pub struct AlertPolicy {
    pub cooldown: chrono::Duration,
    pub hysteresis: chrono::Duration,
    pub escalation_refires: Option<u32>,
    pub recovery_notifications: bool,
}

impl AlertPolicy {
    pub fn from_config(monitor: &MonitorConfig, alerting: &AlertingConfig) -> Self {
        Self {
            cooldown: monitor.cooldown(),
            hysteresis: monitor.hysteresis(),
            escalation_refires: monitor.escalation_refires,
            recovery_notifications: alerting.recovery_notifications,
        }
    }

    fn level_for(&self, severity: Severity, critical_fires: u32) -> AlertLevel {
        match severity {
            Severity::Warning => AlertLevel::Warning,
            Severity::Critical => match self.escalation_refires {
                // the first critical fire is not a refire
                Some(n) if critical_fires.saturating_sub(1) <= n => AlertLevel::Error,
                _ => AlertLevel::Critical,
            },
        }
    }
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default(), &AlertingConfig::default())
    }
}

/// Owns alert records and drives their lifecycle per dedup key:
/// new -> active -> suppressed -> active (refire) -> resolved.
#[derive(Clone)]
pub struct AlertManager {
    state: Arc<Mutex<ManagerState>>,
    store: AlertStore,
    policy: AlertPolicy,
    hostname: String,
}

#[derive(Default)]
struct ManagerState {
    records: Vec<AlertRecord>,
    open: HashMap<DedupKey, usize>,
    clear_since: HashMap<DedupKey, DateTime<Utc>>,
}

impl AlertManager {
    pub fn new(policy: AlertPolicy, store: AlertStore, hostname: impl Into<String>) -> Result<Self> {
        let records = store.load()?;
        let mut state = ManagerState::default();
        for (idx, record) in records.iter().enumerate() {
            if record.state.is_open() {
                state.open.insert(
                    DedupKey { metric: record.metric.clone(), direction: record.direction },
                    idx,
                );
            }
        }
        state.records = records;

        if !state.open.is_empty() {
            tracing::info!(open = state.open.len(), "Restored open alerts");
        }

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            store,
            policy,
            hostname: hostname.into(),
        })
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }

    fn persist(&self, record: &AlertRecord) {
        if let Err(e) = self.store.upsert(record) {
            tracing::error!(alert_id = %record.id, error = %e, "Failed to persist alert");
        }
    }

    /// Apply one evaluation tick. Returns the records that need dispatching.
    pub async fn process(&self, now: DateTime<Utc>, evaluation: &Evaluation) -> Vec<AlertRecord> {
        let mut state = self.state.lock().await;
        let mut dispatch = Vec::new();

        let mut breaches: BTreeMap<DedupKey, &AnomalyEvent> = BTreeMap::new();
        for event in &evaluation.events {
            let key = event.dedup_key();
            match breaches.get(&key) {
                Some(worst) if worst.severity >= event.severity => {}
                _ => {
                    breaches.insert(key, event);
                }
            }
        }

        for (key, event) in &breaches {
            state.clear_since.remove(key);
            let record = match state.open.get(key).copied() {
                Some(idx) => self.on_repeat(&mut state.records[idx], event, now),
                None => {
                    let record = self.open_alert(key, event, now);
                    state.records.push(record.clone());
                    let idx = state.records.len() - 1;
                    state.open.insert(key.clone(), idx);
                    Some(record)
                }
            };
            if let Some(record) = record {
                dispatch.push(record);
            }
        }

        // keys that were checked this tick and stayed clear
        let clear: Vec<(DedupKey, usize)> = state
            .open
            .iter()
            .filter(|(key, _)| evaluation.evaluated.contains(*key) && !breaches.contains_key(*key))
            .map(|(key, idx)| (key.clone(), *idx))
            .collect();

        for (key, idx) in clear {
            let since = *state.clear_since.entry(key.clone()).or_insert(now);
            if now - since < self.policy.hysteresis {
                continue;
            }

            state.open.remove(&key);
            state.clear_since.remove(&key);
            let record = &mut state.records[idx];
            record.state = AlertState::Resolved;
            record.resolved_at = Some(now);
            self.persist(record);
            tracing::info!(alert_id = %record.id, dedup_key = %key, "Alert resolved");

            if self.policy.recovery_notifications {
                dispatch.push(record.clone());
            }
        }

        dispatch
    }

    fn open_alert(&self, key: &DedupKey, event: &AnomalyEvent, now: DateTime<Utc>) -> AlertRecord {
        let critical_fires = u32::from(event.severity == Severity::Critical);
        let record = AlertRecord {
            id: Uuid::new_v4(),
            level: self.policy.level_for(event.severity, critical_fires),
            metric: key.metric.clone(),
            direction: key.direction,
            dedup_key: key.to_string(),
            message: event.detail.clone(),
            observed_value: event.observed_value,
            hostname: self.hostname.clone(),
            created_at: now,
            last_fired_at: now,
            resolved_at: None,
            state: AlertState::Active,
            fire_count: 1,
            repeat_count: 0,
            critical_fires,
            deliveries: Vec::new(),
        };
        self.persist(&record);
        tracing::info!(
            alert_id = %record.id,
            dedup_key = %key,
            level = %record.level,
            "Alert fired"
        );
        record
    }

    /// Breach on a key that already has an open record. Returns the record
    /// when the cooldown has run out and it must be dispatched again.
    fn on_repeat(&self, record: &mut AlertRecord, event: &AnomalyEvent, now: DateTime<Utc>) -> Option<AlertRecord> {
        record.observed_value = event.observed_value;

        if now - record.last_fired_at < self.policy.cooldown {
            record.state = AlertState::Suppressed;
            record.repeat_count += 1;
            self.persist(record);
            tracing::debug!(
                alert_id = %record.id,
                dedup_key = %record.dedup_key,
                repeats = record.repeat_count,
                "Alert suppressed by cooldown"
            );
            return None;
        }

        if event.severity == Severity::Critical {
            record.critical_fires += 1;
        }
        record.level = self.policy.level_for(event.severity, record.critical_fires);
        record.state = AlertState::Active;
        record.message = event.detail.clone();
        record.last_fired_at = now;
        record.fire_count += 1;
        self.persist(record);
        tracing::info!(
            alert_id = %record.id,
            dedup_key = %record.dedup_key,
            level = %record.level,
            fires = record.fire_count,
            "Alert refired"
        );
        Some(record.clone())
    }

    /// Attach channel outcomes to an alert. Never changes its state.
    pub async fn record_deliveries(&self, alert_id: Uuid, deliveries: Vec<DeliveryRecord>) {
        if let Err(e) = self.store.insert_deliveries(alert_id, &deliveries) {
            tracing::error!(alert_id = %alert_id, error = %e, "Failed to persist delivery outcomes");
        }
        let mut state = self.state.lock().await;
        if let Some(record) = state.records.iter_mut().find(|r| r.id == alert_id) {
            record.deliveries.extend(deliveries);
        }
    }

    /// Dedup keys with an open alert.
    pub async fn open_keys(&self) -> Vec<DedupKey> {
        let mut keys: Vec<DedupKey> = self.state.lock().await.open.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Open alerts (active or suppressed), oldest first.
    pub async fn list_active_alerts(&self) -> Vec<AlertRecord> {
        let state = self.state.lock().await;
        let mut open: Vec<AlertRecord> = state.open.values().map(|idx| state.records[*idx].clone()).collect();
        open.sort_by_key(|r| r.created_at);
        open
    }

    /// Every record ever created, oldest first.
    pub async fn history(&self) -> Vec<AlertRecord> {
        self.state.lock().await.records.clone()
    }

    pub async fn get(&self, id: Uuid) -> Option<AlertRecord> {
        self.state.lock().await.records.iter().find(|r| r.id == id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DetectorKind, Direction, Tags};
    use chrono::{Duration, TimeZone};
    use std::collections::HashSet;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn key() -> DedupKey {
        DedupKey { metric: "cpu_usage".into(), direction: Direction::HigherIsBad }
    }

    fn breach(severity: Severity, secs: i64) -> Evaluation {
        let event = AnomalyEvent {
            metric: "cpu_usage".into(),
            tags: Tags::new(),
            observed_value: 85.0,
            severity,
            direction: Direction::HigherIsBad,
            rule_triggered: DetectorKind::Threshold,
            detail: "cpu_usage is 85.00 (critical threshold: 80.00)".into(),
            detected_at: t(secs),
        };
        Evaluation { events: vec![event], evaluated: HashSet::from([key()]) }
    }

    fn clear() -> Evaluation {
        Evaluation { events: vec![], evaluated: HashSet::from([key()]) }
    }

    fn manager(policy: AlertPolicy) -> AlertManager {
        AlertManager::new(policy, AlertStore::in_memory(), "test-host").unwrap()
    }

    fn policy() -> AlertPolicy {
        AlertPolicy {
            cooldown: Duration::seconds(300),
            hysteresis: Duration::seconds(60),
            escalation_refires: None,
            recovery_notifications: false,
        }
    }

    #[tokio::test]
    async fn cooldown_suppresses_then_refires() {
        let m = manager(policy());

        let fired = m.process(t(0), &breach(Severity::Critical, 0)).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].state, AlertState::Active);

        let fired = m.process(t(100), &breach(Severity::Critical, 100)).await;
        assert!(fired.is_empty());
        let active = m.list_active_alerts().await;
        assert_eq!(active[0].state, AlertState::Suppressed);
        assert_eq!(active[0].repeat_count, 1);
        assert_eq!(active[0].last_fired_at, t(0));

        let fired = m.process(t(400), &breach(Severity::Critical, 400)).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].state, AlertState::Active);
        assert_eq!(fired[0].last_fired_at, t(400));
        assert_eq!(fired[0].fire_count, 2);
        assert_eq!(m.history().await.len(), 1);
    }

    #[tokio::test]
    async fn resolves_once_after_hysteresis() {
        let m = manager(policy());
        m.process(t(0), &breach(Severity::Warning, 0)).await;

        m.process(t(60), &clear()).await;
        assert_eq!(m.list_active_alerts().await.len(), 1);

        m.process(t(120), &clear()).await;
        assert!(m.list_active_alerts().await.is_empty());
        let history = m.history().await;
        assert_eq!(history[0].state, AlertState::Resolved);
        assert_eq!(history[0].resolved_at, Some(t(120)));

        m.process(t(180), &clear()).await;
        assert_eq!(m.history().await[0].resolved_at, Some(t(120)));
    }

    #[tokio::test]
    async fn breach_during_hysteresis_restarts_the_clock() {
        let m = manager(policy());
        m.process(t(0), &breach(Severity::Warning, 0)).await;
        m.process(t(60), &clear()).await;
        m.process(t(90), &breach(Severity::Warning, 90)).await;
        m.process(t(150), &clear()).await;
        assert_eq!(m.list_active_alerts().await.len(), 1);
        m.process(t(210), &clear()).await;
        assert!(m.list_active_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn unevaluated_keys_do_not_resolve() {
        let m = manager(policy());
        m.process(t(0), &breach(Severity::Warning, 0)).await;
        m.process(t(600), &Evaluation::default()).await;
        assert_eq!(m.list_active_alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn new_lineage_after_resolution() {
        let m = manager(policy());
        m.process(t(0), &breach(Severity::Warning, 0)).await;
        m.process(t(60), &clear()).await;
        m.process(t(120), &clear()).await;
        let fired = m.process(t(130), &breach(Severity::Warning, 130)).await;
        assert_eq!(fired.len(), 1);
        let history = m.history().await;
        assert_eq!(history.len(), 2);
        assert_ne!(history[0].id, history[1].id);
    }

    #[tokio::test]
    async fn severity_maps_to_levels_with_escalation() {
        let m = manager(AlertPolicy { escalation_refires: Some(2), ..policy() });
        for secs in [0, 300, 600] {
            let fired = m.process(t(secs), &breach(Severity::Critical, secs)).await;
            assert_eq!(fired[0].level, AlertLevel::Error, "fire at {}s", secs);
        }
        // third refire is the first one beyond two
        let fired = m.process(t(900), &breach(Severity::Critical, 900)).await;
        assert_eq!(fired[0].level, AlertLevel::Critical);
        assert_eq!(fired[0].critical_fires, 4);

        let m = manager(AlertPolicy { escalation_refires: Some(0), ..policy() });
        let fired = m.process(t(0), &breach(Severity::Critical, 0)).await;
        assert_eq!(fired[0].level, AlertLevel::Error);
        let fired = m.process(t(300), &breach(Severity::Critical, 300)).await;
        assert_eq!(fired[0].level, AlertLevel::Critical);

        let m = manager(policy());
        let fired = m.process(t(0), &breach(Severity::Warning, 0)).await;
        assert_eq!(fired[0].level, AlertLevel::Warning);
        let m = manager(policy());
        let fired = m.process(t(0), &breach(Severity::Critical, 0)).await;
        assert_eq!(fired[0].level, AlertLevel::Critical);
    }

    #[tokio::test]
    async fn worst_event_per_key_wins() {
        let m = manager(policy());
        let mut eval = breach(Severity::Warning, 0);
        eval.events.extend(breach(Severity::Critical, 0).events);
        let fired = m.process(t(0), &eval).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].level, AlertLevel::Critical);
    }

    #[tokio::test]
    async fn recovery_is_dispatched_when_enabled() {
        let m = manager(AlertPolicy { recovery_notifications: true, ..policy() });
        m.process(t(0), &breach(Severity::Warning, 0)).await;
        m.process(t(60), &clear()).await;
        let sent = m.process(t(120), &clear()).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].state, AlertState::Resolved);
    }

    #[tokio::test]
    async fn concurrent_first_breaches_fire_once() {
        let m = manager(policy());
        let eval = Arc::new(breach(Severity::Critical, 0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = m.clone();
            let eval = eval.clone();
            handles.push(tokio::spawn(async move { m.process(t(0), &eval).await.len() }));
        }
        let mut fired = 0;
        for h in handles {
            fired += h.await.unwrap();
        }
        assert_eq!(fired, 1);
        assert_eq!(m.history().await.len(), 1);
    }
}
