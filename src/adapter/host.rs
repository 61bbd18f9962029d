// Host stats via sysinfo: CPU, memory, swap, disk usage and load average of the local machine.

use async_trait::async_trait;
use futures_util::stream;
use std::collections::BTreeMap;
use std::sync::Arc;
use sysinfo::{Disks, System};
use tracing::instrument;

use super::{StatSample, StatsAdapter, StatsRequest, StatsStream, single_batch};
use crate::bucket::now_micros;
use crate::error::{Result, RollupError};

pub const HOST_ADAPTER: &str = "host";

pub struct HostStatsAdapter {
    sys: Arc<std::sync::Mutex<System>>,
    disks: Arc<std::sync::Mutex<Disks>>,
}

impl Default for HostStatsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl HostStatsAdapter {
    pub fn new() -> Self {
        let mut sys = System::new();
        // CPU usage is a delta between refreshes; seed the first one.
        sys.refresh_cpu_all();
        sys.refresh_memory();
        Self {
            sys: Arc::new(std::sync::Mutex::new(sys)),
            disks: Arc::new(std::sync::Mutex::new(Disks::new_with_refreshed_list())),
        }
    }
}

fn sample(
    sys: &std::sync::Mutex<System>,
    disks: &std::sync::Mutex<Disks>,
) -> std::result::Result<BTreeMap<String, f64>, String> {
    let mut out = BTreeMap::new();
    {
        let mut sys = sys
            .lock()
            .map_err(|e| format!("sysinfo lock poisoned: {}", e))?;
        sys.refresh_cpu_all();
        sys.refresh_memory();

        out.insert(
            "cpuUtilizationPercent".to_string(),
            (sys.global_cpu_usage() as f64).clamp(0.0, 100.0),
        );
        let total = sys.total_memory();
        let used = total.saturating_sub(sys.available_memory());
        out.insert("memoryUsedBytes".to_string(), used as f64);
        if total > 0 {
            out.insert(
                "memoryUsedPercent".to_string(),
                used as f64 / total as f64 * 100.0,
            );
        }
        out.insert("swapUsedBytes".to_string(), sys.used_swap() as f64);
    }

    let load = System::load_average();
    out.insert("loadAverage1m".to_string(), load.one);
    out.insert("loadAverage5m".to_string(), load.five);

    let mut disks = disks
        .lock()
        .map_err(|e| format!("sysinfo disks lock poisoned: {}", e))?;
    disks.refresh(false);
    let used: u64 = disks
        .list()
        .iter()
        .map(|d| d.total_space().saturating_sub(d.available_space()))
        .sum();
    out.insert("diskUsedBytes".to_string(), used as f64);
    Ok(out)
}

fn adapter_error(resource_id: &str, reason: String) -> RollupError {
    RollupError::Adapter {
        adapter: HOST_ADAPTER.to_string(),
        resource_id: resource_id.to_string(),
        reason,
    }
}

#[async_trait]
impl StatsAdapter for HostStatsAdapter {
    fn name(&self) -> &str {
        HOST_ADAPTER
    }

    #[instrument(skip(self, request), fields(adapter = "host", operation = "request_stats", resource_id = %request.resource_id))]
    async fn request_stats(&self, request: StatsRequest) -> Result<StatsStream> {
        let sys = self.sys.clone();
        let disks = self.disks.clone();
        let values = tokio::task::spawn_blocking(move || sample(&sys, &disks))
            .await
            .map_err(|e| adapter_error(&request.resource_id, format!("sysinfo task join: {}", e)))?
            .map_err(|reason| adapter_error(&request.resource_id, reason))?;

        let source_micros = now_micros();
        let stat_values = values
            .into_iter()
            .map(|(name, value)| {
                (
                    name,
                    vec![StatSample {
                        value,
                        source_micros,
                    }],
                )
            })
            .collect();
        Ok(Box::pin(stream::once(async move {
            Ok(single_batch(stat_values))
        })))
    }
}
