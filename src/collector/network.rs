use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{MonitorError, Result};
use crate::types::MetricSample;
use super::Probe;

/// Network throughput per interface from /proc/net/dev
pub struct NetworkProbe {
    proc_root: PathBuf,
    exclude_interfaces: Vec<String>,
    prev: Option<(DateTime<Utc>, HashMap<String, (u64, u64)>)>, // interface -> (rx_bytes, tx_bytes)
}

impl NetworkProbe {
    pub fn new(proc_root: &str, exclude_interfaces: &[String]) -> Self {
        Self {
            proc_root: PathBuf::from(proc_root),
            exclude_interfaces: exclude_interfaces.to_vec(),
            prev: None,
        }
    }

    /// Byte counters per interface
    pub(crate) fn parse_net_dev(content: &str) -> HashMap<String, (u64, u64)> {
        let mut counters = HashMap::new();
        for line in content.lines().skip(2) {
            let Some((iface, rest)) = line.split_once(':') else { continue };
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() < 16 { continue; }

            let rx_bytes: u64 = parts[0].parse().unwrap_or(0);
            let tx_bytes: u64 = parts[8].parse().unwrap_or(0);
            counters.insert(iface.trim().to_string(), (rx_bytes, tx_bytes));
        }
        counters
    }
}

#[async_trait]
impl Probe for NetworkProbe {
    fn name(&self) -> &str { "network" }

    async fn collect(&mut self, now: DateTime<Utc>) -> Result<Vec<MetricSample>> {
        let path = self.proc_root.join("net/dev");
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| MonitorError::probe("network", format!("{}: {}", path.display(), e)))?;

        let mut counters = Self::parse_net_dev(&content);
        counters.retain(|iface, _| !self.exclude_interfaces.iter().any(|e| e == iface));

        let mut samples = Vec::new();
        if let Some((prev_at, prev)) = &self.prev {
            let elapsed = (now - *prev_at).num_milliseconds() as f64 / 1000.0;
            if elapsed > 0.0 {
                for (iface, (rx, tx)) in &counters {
                    let Some((prev_rx, prev_tx)) = prev.get(iface) else { continue };
                    let rx_rate = rx.saturating_sub(*prev_rx) as f64 / elapsed;
                    let tx_rate = tx.saturating_sub(*prev_tx) as f64 / elapsed;
                    samples.push(MetricSample::new("network_rx_bytes_rate", rx_rate, now).with_tag("interface", iface.as_str()));
                    samples.push(MetricSample::new("network_tx_bytes_rate", tx_rate, now).with_tag("interface", iface.as_str()));
                }
            }
        }

        self.prev = Some((now, counters));
        Ok(samples)
    }
}
