use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::error::{MonitorError, Result};
use crate::types::MetricSample;
use super::Probe;

/// Memory usage from /proc/meminfo
pub struct MemoryProbe {
    proc_root: PathBuf,
}

impl MemoryProbe {
    pub fn new(proc_root: &str) -> Self {
        Self { proc_root: PathBuf::from(proc_root) }
    }

    /// Used memory percentage and available bytes
    pub(crate) fn parse_meminfo(content: &str) -> Option<(f64, u64)> {
        let mut total_kb = 0u64;
        let mut available_kb = None;
        let mut free_kb = 0u64;
        let mut buffers_kb = 0u64;
        let mut cached_kb = 0u64;

        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 2 { continue; }
            let Ok(val) = parts[1].parse::<u64>() else { continue };
            match parts[0] {
                "MemTotal:" => total_kb = val,
                "MemAvailable:" => available_kb = Some(val),
                "MemFree:" => free_kb = val,
                "Buffers:" => buffers_kb = val,
                "Cached:" => cached_kb = val,
                _ => {}
            }
        }

        if total_kb == 0 {
            return None;
        }

        // Fallback for kernels without MemAvailable
        let available_kb = available_kb.unwrap_or(free_kb + buffers_kb + cached_kb);
        let usage_pct = 100.0 * (1.0 - available_kb as f64 / total_kb as f64);
        Some((usage_pct, available_kb * 1024))
    }
}

#[async_trait]
impl Probe for MemoryProbe {
    fn name(&self) -> &str { "memory" }

    async fn collect(&mut self, now: DateTime<Utc>) -> Result<Vec<MetricSample>> {
        let path = self.proc_root.join("meminfo");
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| MonitorError::probe("memory", format!("{}: {}", path.display(), e)))?;

        let (usage_pct, available) = Self::parse_meminfo(&content)
            .ok_or_else(|| MonitorError::probe("memory", "MemTotal missing from meminfo"))?;

        Ok(vec![
            MetricSample::new("memory_usage", usage_pct, now),
            MetricSample::new("memory_available_bytes", available as f64, now),
        ])
    }
}
