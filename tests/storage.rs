use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use lead_monitor::alerter::Dispatcher;
use lead_monitor::config::{CollectorConfig, Config, StorageConfig};
use lead_monitor::storage::MetricsStore;
use lead_monitor::types::{AlertLevel, MetricSample, Tags};
use lead_monitor::Monitor;

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn tags(source: &str) -> Tags {
    let mut tags = Tags::new();
    tags.insert("source".into(), source.into());
    tags
}

#[test]
fn query_returns_exactly_the_samples_in_range() {
    let mut rng = StdRng::seed_from_u64(42);
    let store = MetricsStore::in_memory();
    let sources = ["permits", "court", "planning"];

    let mut written: Vec<MetricSample> = Vec::new();
    let mut clock = [0i64; 3];
    for _ in 0..600 {
        let s = rng.gen_range(0..sources.len());
        clock[s] += rng.gen_range(0..30);
        let sample = MetricSample {
            name: "scrape_success_rate".into(),
            value: rng.gen_range(0.0..1.0),
            tags: tags(sources[s]),
            timestamp: t(clock[s]),
        };
        store.write(sample.clone()).unwrap();
        written.push(sample);
    }

    for _ in 0..100 {
        let a = rng.gen_range(0..6000);
        let b = a + rng.gen_range(0..2000);
        let source = sources[rng.gen_range(0..sources.len())];

        let got = store.query("scrape_success_rate", &tags(source), t(a), t(b));
        let expected: Vec<&MetricSample> = written
            .iter()
            .filter(|s| s.tags == tags(source) && s.timestamp >= t(a) && s.timestamp < t(b))
            .collect();

        assert_eq!(got.len(), expected.len());
        assert!(got.iter().zip(expected).all(|(g, e)| g == e));
        assert!(got.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }
}

#[test]
fn purge_is_idempotent() {
    let store = MetricsStore::in_memory();
    for i in 0..100 {
        store.write(MetricSample::new("queue_depth", i as f64, t(i * 60))).unwrap();
    }

    let cutoff = t(50 * 60);
    assert_eq!(store.purge(cutoff).unwrap(), 50);
    let after_first = store.query_name("queue_depth", t(0), t(100 * 60));
    assert_eq!(store.purge(cutoff).unwrap(), 0);
    let after_second = store.query_name("queue_depth", t(0), t(100 * 60));

    assert_eq!(after_first, after_second);
    assert_eq!(after_first.first().unwrap().timestamp, cutoff);
}

#[test]
fn durable_purge_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        sqlite_path: Some(dir.path().join("metrics.db").to_string_lossy().to_string()),
        ..StorageConfig::default()
    };

    let store = MetricsStore::open(&config, t(0)).unwrap();
    for i in 0..10 {
        store.write(MetricSample::new("queue_depth", i as f64, t(i))).unwrap();
    }
    store.purge(t(5)).unwrap();
    drop(store);

    let reopened = MetricsStore::open(&config, t(0)).unwrap();
    assert_eq!(reopened.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn storage_outage_is_retried_then_counted_as_data_loss() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("monitor.db").to_string_lossy().to_string();
    let mut config = Config { collector: CollectorConfig::push_only(), ..Config::default() };
    config.storage.sqlite_path = Some(path.clone());
    config.storage.write_retries = 2;
    config.storage.retry_backoff_ms = 10;

    let dispatcher = Dispatcher::new(Vec::new(), std::time::Duration::from_secs(1), AlertLevel::Info);
    let monitor = Monitor::with_dispatcher(config, dispatcher).unwrap();

    let other = rusqlite::Connection::open(&path).unwrap();
    other.execute_batch("DROP TABLE metrics;").unwrap();

    let now = Utc::now();
    monitor.push_metric("docs_per_min", 12.0, Tags::new(), Some(now)).unwrap();
    let summary = monitor.collector().tick_at(now).await;

    assert_eq!(summary.written, 0);
    assert_eq!(monitor.stats().storage_write_failures, 1);
    // nothing half-written
    assert!(monitor.get_metrics("docs_per_min", &Tags::new(), now, now + Duration::seconds(1)).is_empty());
}
