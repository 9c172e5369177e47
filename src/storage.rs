use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::config::StorageConfig;
use crate::error::{MonitorError, Result};
use crate::types::{MetricSample, SeriesKey, Tags};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metrics (
    name      TEXT    NOT NULL,
    tags      TEXT    NOT NULL,
    value     REAL    NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON metrics (timestamp);

CREATE TABLE IF NOT EXISTS alerts (
    id             TEXT    PRIMARY KEY,
    level          TEXT    NOT NULL,
    metric         TEXT    NOT NULL,
    direction      TEXT    NOT NULL,
    dedup_key      TEXT    NOT NULL,
    message        TEXT    NOT NULL,
    observed_value REAL    NOT NULL,
    hostname       TEXT    NOT NULL,
    created_at     INTEGER NOT NULL,
    last_fired_at  INTEGER NOT NULL,
    resolved_at    INTEGER,
    state          TEXT    NOT NULL,
    fire_count     INTEGER NOT NULL,
    repeat_count   INTEGER NOT NULL,
    critical_fires INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS alert_deliveries (
    alert_id     TEXT    NOT NULL,
    channel      TEXT    NOT NULL,
    attempted_at INTEGER NOT NULL,
    success      INTEGER NOT NULL,
    error        TEXT
);
";

/// Open (creating if needed) the SQLite file shared by metrics and alerts.
pub fn open_database(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(us: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(us)
        .ok_or_else(|| MonitorError::Storage(format!("timestamp out of range: {}", us)))
}

/// Result of a batch write: what landed and what validation turned away
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub written: Vec<MetricSample>,
    pub rejected: Vec<MonitorError>,
}

/// Thread-safe time-series storage.
///
/// Series are kept in memory, ordered by timestamp, for windowed queries.
/// When a SQLite path is configured every write is committed to disk before
/// it becomes visible in memory. Writers are serialized on `writer`; the
/// in-memory lock is only taken for the final append, so readers never wait
/// on a disk commit.
#[derive(Clone)]
pub struct MetricsStore {
    inner: Arc<RwLock<StorageInner>>,
    writer: Arc<Mutex<Option<Connection>>>,
    durable: bool,
}

#[derive(Default)]
struct StorageInner {
    series: HashMap<SeriesKey, Series>,
}

#[derive(Default)]
struct Series {
    samples: Vec<MetricSample>,
}

impl Series {
    fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.samples.last().map(|s| s.timestamp)
    }

    /// Samples in `[since, until)`
    fn range(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> &[MetricSample] {
        let start = self.samples.partition_point(|s| s.timestamp < since);
        let end = self.samples.partition_point(|s| s.timestamp < until);
        if start >= end {
            return &[];
        }
        &self.samples[start..end]
    }

    fn purge(&mut self, cutoff: DateTime<Utc>) -> usize {
        let n = self.samples.partition_point(|s| s.timestamp < cutoff);
        self.samples.drain(..n);
        n
    }
}

impl MetricsStore {
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StorageInner::default())),
            writer: Arc::new(Mutex::new(None)),
            durable: false,
        }
    }

    /// Open the store described by `config`, reloading samples newer than
    /// `keep_since` from disk.
    pub fn open(config: &StorageConfig, keep_since: DateTime<Utc>) -> Result<Self> {
        let Some(path) = config.sqlite_path.as_deref() else {
            return Ok(Self::in_memory());
        };

        let conn = open_database(path)?;
        let mut inner = StorageInner::default();
        let mut loaded = 0usize;
        {
            let mut stmt = conn.prepare(
                "SELECT name, tags, value, timestamp FROM metrics
                 WHERE timestamp >= ?1 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map(params![to_micros(keep_since)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;
            for row in rows {
                let (name, tags, value, ts) = row?;
                let tags: Tags = serde_json::from_str(&tags)?;
                let sample = MetricSample { name, value, tags, timestamp: from_micros(ts)? };
                inner.series.entry(sample.series_key()).or_default().samples.push(sample);
                loaded += 1;
            }
        }

        tracing::info!(path, samples = loaded, series = inner.series.len(), "Opened metrics store");

        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
            writer: Arc::new(Mutex::new(Some(conn))),
            durable: true,
        })
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        self.writer
            .lock()
            .map_err(|_| MonitorError::Storage("database lock poisoned".into()))
    }

    fn write_inner(&self) -> Result<RwLockWriteGuard<'_, StorageInner>> {
        self.inner
            .write()
            .map_err(|_| MonitorError::Storage("metrics lock poisoned".into()))
    }

    fn read(&self) -> RwLockReadGuard<'_, StorageInner> {
        // Readers only ever see whole samples, so a poisoned lock is still consistent.
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one sample.
    pub fn write(&self, sample: MetricSample) -> Result<()> {
        let mut outcome = self.write_batch(vec![sample])?;
        match outcome.rejected.pop() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Append a batch. Invalid samples are rejected individually; the rest
    /// are committed atomically, so a storage error leaves nothing behind
    /// and the batch can be retried as-is.
    pub fn write_batch(&self, samples: Vec<MetricSample>) -> Result<BatchOutcome> {
        let mut writer = self.lock_writer()?;

        let mut outcome = BatchOutcome::default();
        {
            let inner = self.read();
            let mut pending_last: HashMap<SeriesKey, DateTime<Utc>> = HashMap::new();

            for sample in samples {
                let key = sample.series_key();
                let last = pending_last
                    .get(&key)
                    .copied()
                    .or_else(|| inner.series.get(&key).and_then(Series::last_timestamp));

                match validate(&sample, last) {
                    Ok(()) => {
                        pending_last.insert(key, sample.timestamp);
                        outcome.written.push(sample);
                    }
                    Err(e) => outcome.rejected.push(e),
                }
            }
        }

        if outcome.written.is_empty() {
            return Ok(outcome);
        }

        if let Some(conn) = writer.as_mut() {
            persist(conn, &outcome.written)?;
        }

        let mut inner = self.write_inner()?;
        for sample in &outcome.written {
            inner
                .series
                .entry(sample.series_key())
                .or_default()
                .samples
                .push(sample.clone());
        }

        Ok(outcome)
    }

    /// Samples of one series in `[since, until)`, oldest first.
    pub fn query(
        &self,
        name: &str,
        tags: &Tags,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Vec<MetricSample> {
        let key = SeriesKey::new(name, tags.clone());
        let inner = self.read();
        match inner.series.get(&key) {
            Some(series) => series.range(since, until).to_vec(),
            None => Vec::new(),
        }
    }

    /// Samples of every series named `name` in `[since, until)`, oldest first.
    pub fn query_name(&self, name: &str, since: DateTime<Utc>, until: DateTime<Utc>) -> Vec<MetricSample> {
        let inner = self.read();
        let mut out: Vec<MetricSample> = inner
            .series
            .iter()
            .filter(|(key, _)| key.name == name)
            .flat_map(|(_, series)| series.range(since, until).iter().cloned())
            .collect();
        out.sort_by_key(|s| s.timestamp);
        out
    }

    /// Keys of all series holding at least one sample in `[since, until)`.
    pub fn series(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Vec<SeriesKey> {
        let inner = self.read();
        let mut keys: Vec<SeriesKey> = inner
            .series
            .iter()
            .filter(|(_, series)| !series.range(since, until).is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Newest sample of every series named `name`.
    pub fn latest(&self, name: &str) -> Vec<MetricSample> {
        let inner = self.read();
        let mut out: Vec<MetricSample> = inner
            .series
            .iter()
            .filter(|(key, _)| key.name == name)
            .filter_map(|(_, series)| series.samples.last().cloned())
            .collect();
        out.sort_by(|a, b| a.tags.cmp(&b.tags));
        out
    }

    pub fn last_timestamp(&self, key: &SeriesKey) -> Option<DateTime<Utc>> {
        self.read().series.get(key).and_then(Series::last_timestamp)
    }

    pub fn len(&self) -> usize {
        self.read().series.values().map(|s| s.samples.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete samples strictly older than `older_than`. Returns how many
    /// in-memory samples were dropped.
    pub fn purge(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let writer = self.lock_writer()?;
        if let Some(conn) = writer.as_ref() {
            conn.execute("DELETE FROM metrics WHERE timestamp < ?1", params![to_micros(older_than)])?;
        }

        let mut inner = self.write_inner()?;
        let mut removed = 0;
        for series in inner.series.values_mut() {
            removed += series.purge(older_than);
        }
        inner.series.retain(|_, series| !series.samples.is_empty());

        if removed > 0 {
            tracing::debug!(removed, cutoff = %older_than, "Purged expired samples");
        }
        Ok(removed)
    }
}

fn validate(sample: &MetricSample, last: Option<DateTime<Utc>>) -> Result<()> {
    if sample.name.trim().is_empty() {
        return Err(MonitorError::validation(&sample.name, "metric name is empty"));
    }
    if !sample.value.is_finite() {
        return Err(MonitorError::validation(
            &sample.name,
            format!("value {} is not finite", sample.value),
        ));
    }
    if let Some(last) = last {
        if sample.timestamp < last {
            return Err(MonitorError::validation(
                &sample.name,
                format!("timestamp {} is older than last written {}", sample.timestamp, last),
            ));
        }
    }
    Ok(())
}

fn persist(conn: &mut Connection, samples: &[MetricSample]) -> Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt =
            tx.prepare("INSERT INTO metrics (name, tags, value, timestamp) VALUES (?1, ?2, ?3, ?4)")?;
        for s in samples {
            let tags = serde_json::to_string(&s.tags)?;
            stmt.execute(params![s.name, tags, s.value, to_micros(s.timestamp)])?;
        }
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn sample(name: &str, value: f64, secs: i64) -> MetricSample {
        MetricSample::new(name, value, t(secs))
    }

    #[test]
    fn query_returns_half_open_window_in_order() {
        let store = MetricsStore::in_memory();
        for i in 0..10 {
            store.write(sample("cpu_usage", i as f64, i * 10)).unwrap();
        }

        let got = store.query("cpu_usage", &Tags::new(), t(20), t(60));
        let values: Vec<f64> = got.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn query_unknown_series_is_empty() {
        let store = MetricsStore::in_memory();
        assert!(store.query("nope", &Tags::new(), t(0), t(100)).is_empty());
        store.write(sample("cpu_usage", 1.0, 0)).unwrap();
        assert!(store.query("cpu_usage", &Tags::new(), t(50), t(10)).is_empty());
    }

    #[test]
    fn tags_distinguish_series_regardless_of_order() {
        let store = MetricsStore::in_memory();
        store
            .write(sample("scrape_success_rate", 0.9, 0).with_tag("source", "permits").with_tag("region", "west"))
            .unwrap();
        store.write(sample("scrape_success_rate", 0.5, 0).with_tag("source", "court")).unwrap();

        let mut tags = Tags::new();
        tags.insert("region".into(), "west".into());
        tags.insert("source".into(), "permits".into());
        let got = store.query("scrape_success_rate", &tags, t(0), t(1));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value, 0.9);

        assert_eq!(store.query_name("scrape_success_rate", t(0), t(1)).len(), 2);
        assert_eq!(store.series(t(0), t(1)).len(), 2);
        assert!(store.series(t(1), t(2)).is_empty());
    }

    #[test]
    fn rejects_non_finite_values() {
        let store = MetricsStore::in_memory();
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = store.write(sample("lead_yield", bad, 0)).unwrap_err();
            assert!(matches!(err, MonitorError::Validation { .. }));
        }
        assert!(store.is_empty());
    }

    #[test]
    fn rejects_timestamps_going_backwards_per_series() {
        let store = MetricsStore::in_memory();
        store.write(sample("cpu_usage", 1.0, 10)).unwrap();
        store.write(sample("cpu_usage", 2.0, 10)).unwrap();
        let err = store.write(sample("cpu_usage", 3.0, 5)).unwrap_err();
        assert!(matches!(err, MonitorError::Validation { .. }));

        // other series are independent
        store.write(sample("memory_usage", 1.0, 5)).unwrap();
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn batch_rejects_individually_and_keeps_the_rest() {
        let store = MetricsStore::in_memory();
        let outcome = store
            .write_batch(vec![
                sample("a", 1.0, 10),
                sample("a", 2.0, 5),
                sample("b", f64::NAN, 0),
                sample("b", 4.0, 1),
            ])
            .unwrap();
        assert_eq!(outcome.written.len(), 2);
        assert_eq!(outcome.rejected.len(), 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn purge_is_idempotent() {
        let store = MetricsStore::in_memory();
        for i in 0..10 {
            store.write(sample("cpu_usage", i as f64, i)).unwrap();
        }
        assert_eq!(store.purge(t(4)).unwrap(), 4);
        assert_eq!(store.purge(t(4)).unwrap(), 0);
        assert_eq!(store.len(), 6);
        assert_eq!(store.query("cpu_usage", &Tags::new(), t(0), t(100))[0].value, 4.0);
    }

    #[test]
    fn durable_store_reloads_within_retention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.db");
        let config = StorageConfig {
            sqlite_path: Some(path.to_string_lossy().to_string()),
            ..StorageConfig::default()
        };

        {
            let store = MetricsStore::open(&config, t(0)).unwrap();
            assert!(store.is_durable());
            for i in 0..5 {
                store.write(sample("cpu_usage", i as f64, i * 60).with_tag("host", "a")).unwrap();
            }
            store.purge(t(60)).unwrap();
        }

        let reopened = MetricsStore::open(&config, t(120)).unwrap();
        let mut tags = Tags::new();
        tags.insert("host".into(), "a".into());
        let values: Vec<f64> = reopened
            .query("cpu_usage", &tags, t(0), t(0) + Duration::hours(1))
            .iter()
            .map(|s| s.value)
            .collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn readers_do_not_wait_on_a_pending_commit() {
        let store = MetricsStore::in_memory();
        store.write(sample("cpu_usage", 1.0, 0)).unwrap();

        let _writer = store.lock_writer().unwrap();
        assert_eq!(store.query("cpu_usage", &Tags::new(), t(0), t(1)).len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn failed_commit_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.db");
        let config = StorageConfig {
            sqlite_path: Some(path.to_string_lossy().to_string()),
            ..StorageConfig::default()
        };
        let store = MetricsStore::open(&config, t(0)).unwrap();
        store.write(sample("cpu_usage", 1.0, 0)).unwrap();

        let other = Connection::open(&path).unwrap();
        other.execute_batch("DROP TABLE metrics").unwrap();

        let err = store.write_batch(vec![sample("cpu_usage", 2.0, 1)]).unwrap_err();
        assert!(matches!(err, MonitorError::Storage(_)));
        assert_eq!(store.len(), 1);
    }
}
