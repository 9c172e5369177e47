use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::error::{MonitorError, Result};
use crate::types::MetricSample;
use super::Probe;

/// CPU usage from /proc/stat, plus the 1 minute load average
pub struct CpuProbe {
    proc_root: PathBuf,
    prev: Option<(u64, u64)>, // (total, idle)
}

impl CpuProbe {
    pub fn new(proc_root: &str) -> Self {
        Self { proc_root: PathBuf::from(proc_root), prev: None }
    }

    /// Aggregate jiffies from the `cpu ` line: (total, idle + iowait)
    pub(crate) fn parse_stat(content: &str) -> Option<(u64, u64)> {
        let line = content.lines().find(|l| l.starts_with("cpu "))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|f| f.parse().ok())
            .collect();

        if fields.len() < 4 {
            return None;
        }

        let total: u64 = fields.iter().sum();
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        Some((total, idle))
    }

    /// Busy percentage between two readings. None until time has passed.
    pub(crate) fn usage(prev: (u64, u64), cur: (u64, u64)) -> Option<f64> {
        let d_total = cur.0.saturating_sub(prev.0);
        let d_idle = cur.1.saturating_sub(prev.1);
        if d_total == 0 {
            return None;
        }
        Some(100.0 * (1.0 - d_idle as f64 / d_total as f64))
    }
}

#[async_trait]
impl Probe for CpuProbe {
    fn name(&self) -> &str {
        "cpu"
    }

    async fn collect(&mut self, now: DateTime<Utc>) -> Result<Vec<MetricSample>> {
        let path = self.proc_root.join("stat");
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| MonitorError::probe("cpu", format!("{}: {}", path.display(), e)))?;
        let cur = Self::parse_stat(&content)
            .ok_or_else(|| MonitorError::probe("cpu", "no aggregate cpu line in stat"))?;

        let mut samples = Vec::new();

        // the first reading only primes the delta
        if let Some(usage) = self.prev.and_then(|prev| Self::usage(prev, cur)) {
            samples.push(MetricSample::new("cpu_usage", usage, now));
        }
        self.prev = Some(cur);

        if let Ok(loadavg) = tokio::fs::read_to_string(self.proc_root.join("loadavg")).await {
            if let Some(v) = loadavg.split_whitespace().next().and_then(|p| p.parse::<f64>().ok()) {
                samples.push(MetricSample::new("cpu_load_1m", v, now));
            }
        }

        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_A: &str = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\nintr 12345\n";
    const STAT_B: &str = "cpu  200 0 200 1300 300 0 0 0 0 0\ncpu0 100 0 100 650 150 0 0 0 0 0\nintr 12400\n";

    #[test]
    fn parses_aggregate_line() {
        assert_eq!(CpuProbe::parse_stat(STAT_A), Some((1000, 800)));
        assert_eq!(CpuProbe::parse_stat("intr 1\n"), None);
    }

    #[test]
    fn usage_is_busy_share_of_delta() {
        let a = CpuProbe::parse_stat(STAT_A).unwrap();
        let b = CpuProbe::parse_stat(STAT_B).unwrap();
        // delta total 1000, delta idle 800
        let usage = CpuProbe::usage(a, b).unwrap();
        assert!((usage - 20.0).abs() < 1e-9);
        assert!(CpuProbe::usage(a, a).is_none());
    }

    #[tokio::test]
    async fn reads_from_proc_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stat"), STAT_A).unwrap();
        std::fs::write(dir.path().join("loadavg"), "0.52 0.40 0.33 1/200 999\n").unwrap();

        let mut probe = CpuProbe::new(dir.path().to_str().unwrap());
        let first = probe.collect(Utc::now()).await.unwrap();
        assert!(first.iter().all(|s| s.name != "cpu_usage"));

        std::fs::write(dir.path().join("stat"), STAT_B).unwrap();
        let second = probe.collect(Utc::now()).await.unwrap();
        let cpu = second.iter().find(|s| s.name == "cpu_usage").unwrap();
        assert!((cpu.value - 20.0).abs() < 1e-9);
        assert!(second.iter().any(|s| s.name == "cpu_load_1m" && s.value == 0.52));
    }

    #[tokio::test]
    async fn missing_file_is_a_probe_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut probe = CpuProbe::new(dir.path().to_str().unwrap());
        let err = probe.collect(Utc::now()).await.unwrap_err();
        assert!(matches!(err, MonitorError::Probe { .. }));
    }
}
