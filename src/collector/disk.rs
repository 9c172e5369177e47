use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sysinfo::Disks;

use crate::error::{MonitorError, Result};
use crate::types::MetricSample;
use super::Probe;

/// Disk usage of the configured mountpoints
pub struct DiskProbe {
    mountpoints: Vec<String>,
}

impl DiskProbe {
    pub fn new(mountpoints: &[String]) -> Self {
        Self { mountpoints: mountpoints.to_vec() }
    }

    pub(crate) fn usage_percent(total: u64, available: u64) -> Option<f64> {
        if total == 0 {
            return None;
        }
        Some(total.saturating_sub(available) as f64 / total as f64 * 100.0)
    }
}

#[async_trait]
impl Probe for DiskProbe {
    fn name(&self) -> &str { "disk" }

    async fn collect(&mut self, now: DateTime<Utc>) -> Result<Vec<MetricSample>> {
        let wanted = self.mountpoints.clone();

        // statvfs per mount blocks, keep it off the runtime threads
        let found = tokio::task::spawn_blocking(move || {
            let disks = Disks::new_with_refreshed_list();
            disks
                .list()
                .iter()
                .filter_map(|disk| {
                    let mount = disk.mount_point().to_string_lossy().to_string();
                    wanted.contains(&mount).then(|| (mount, disk.total_space(), disk.available_space()))
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| MonitorError::probe("disk", e))?;

        if found.is_empty() {
            return Err(MonitorError::probe(
                "disk",
                format!("none of the mountpoints {:?} are mounted", self.mountpoints),
            ));
        }

        let mut samples = Vec::new();
        for (mount, total, available) in found {
            if let Some(pct) = Self::usage_percent(total, available) {
                samples.push(MetricSample::new("disk_usage", pct, now).with_tag("mountpoint", mount.as_str()));
                samples.push(
                    MetricSample::new("disk_available_bytes", available as f64, now).with_tag("mountpoint", mount),
                );
            }
        }

        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_percent_of_total() {
        assert_eq!(DiskProbe::usage_percent(200, 50), Some(75.0));
        assert_eq!(DiskProbe::usage_percent(0, 0), None);
    }

    #[tokio::test]
    async fn unknown_mountpoint_is_a_probe_error() {
        let mut probe = DiskProbe::new(&["/definitely/not/mounted".to_string()]);
        let err = probe.collect(Utc::now()).await.unwrap_err();
        assert!(matches!(err, MonitorError::Probe { .. }));
    }
}
