// Flatten a Docker stats API response into named container metrics.

use bollard::models::{ContainerBlkioStatEntry, ContainerStatsResponse};
use std::collections::BTreeMap;

/// `None` when the response lacks the CPU snapshots needed for a utilization delta.
pub(super) fn container_metrics(s: &ContainerStatsResponse) -> Option<BTreeMap<String, f64>> {
    let cpu = s.cpu_stats.as_ref()?;
    let precpu = s.precpu_stats.as_ref()?;
    let usage = cpu.cpu_usage.as_ref()?;
    let pre_usage = precpu.cpu_usage.as_ref()?;

    let system_delta =
        cpu.system_cpu_usage.unwrap_or(0) as i64 - precpu.system_cpu_usage.unwrap_or(0) as i64;
    let online = cpu.online_cpus.unwrap_or(1) as f64;
    let percent_of_system = |now: Option<u64>, before: Option<u64>| {
        if system_delta > 0 && online > 0.0 {
            let delta = now.unwrap_or(0) as i64 - before.unwrap_or(0) as i64;
            delta as f64 / system_delta as f64 * online * 100.0
        } else {
            0.0
        }
    };

    let mut out = BTreeMap::new();
    out.insert(
        "cpuUtilizationPercent".to_string(),
        percent_of_system(usage.total_usage, pre_usage.total_usage),
    );
    out.insert(
        "cpuKernelPercent".to_string(),
        percent_of_system(usage.usage_in_kernelmode, pre_usage.usage_in_kernelmode),
    );
    out.insert(
        "cpuUserPercent".to_string(),
        percent_of_system(usage.usage_in_usermode, pre_usage.usage_in_usermode),
    );
    let throttled_periods = cpu
        .throttling_data
        .as_ref()
        .and_then(|t| t.throttled_periods)
        .unwrap_or(0);
    out.insert("cpuThrottledPeriods".to_string(), throttled_periods as f64);

    if let Some(mem) = s.memory_stats.as_ref() {
        let used = mem.usage.unwrap_or(0);
        let limit = mem.limit.unwrap_or(0);
        out.insert("memoryUsedBytes".to_string(), used as f64);
        if limit > 0 {
            out.insert(
                "memoryUsedPercent".to_string(),
                used as f64 / limit as f64 * 100.0,
            );
        }
    }

    if let Some(networks) = s.networks.as_ref() {
        let (rx, tx) = networks.values().fold((0u64, 0u64), |(rx, tx), n| {
            (rx + n.rx_bytes.unwrap_or(0), tx + n.tx_bytes.unwrap_or(0))
        });
        out.insert("networkInBytes".to_string(), rx as f64);
        out.insert("networkOutBytes".to_string(), tx as f64);
    }

    if let Some(entries) = s
        .blkio_stats
        .as_ref()
        .and_then(|b| b.io_service_bytes_recursive.as_ref())
    {
        out.insert("diskReadBytes".to_string(), sum_op(entries, "read") as f64);
        out.insert("diskWriteBytes".to_string(), sum_op(entries, "write") as f64);
    }

    if let Some(pids) = s.pids_stats.as_ref().and_then(|p| p.current) {
        out.insert("pids".to_string(), pids as f64);
    }

    Some(out)
}

fn sum_op(entries: &[ContainerBlkioStatEntry], op: &str) -> u64 {
    entries
        .iter()
        .filter(|e| e.op.as_ref().is_some_and(|o| o.eq_ignore_ascii_case(op)))
        .map(|e| e.value.unwrap_or(0))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{
        ContainerBlkioStatEntry, ContainerBlkioStats, ContainerCpuStats, ContainerCpuUsage,
        ContainerMemoryStats, ContainerNetworkStats, ContainerPidsStats, ContainerThrottlingData,
    };
    use std::collections::HashMap;

    fn cpu_snapshot(total_usage: u64, system_cpu_usage: u64) -> ContainerCpuStats {
        ContainerCpuStats {
            cpu_usage: Some(ContainerCpuUsage {
                total_usage: Some(total_usage),
                ..Default::default()
            }),
            system_cpu_usage: Some(system_cpu_usage),
            online_cpus: Some(2),
            throttling_data: None,
        }
    }

    #[test]
    fn missing_cpu_snapshots_yield_nothing() {
        let no_cpu = ContainerStatsResponse {
            cpu_stats: None,
            precpu_stats: Some(cpu_snapshot(0, 0)),
            ..Default::default()
        };
        assert!(container_metrics(&no_cpu).is_none());

        let no_precpu = ContainerStatsResponse {
            cpu_stats: Some(cpu_snapshot(100, 1000)),
            precpu_stats: None,
            ..Default::default()
        };
        assert!(container_metrics(&no_precpu).is_none());
    }

    #[test]
    fn flattens_cpu_memory_network_disk_and_pids() {
        let s = ContainerStatsResponse {
            cpu_stats: Some(cpu_snapshot(100_000_000, 1_000_000_000)),
            precpu_stats: Some(cpu_snapshot(50_000_000, 500_000_000)),
            memory_stats: Some(ContainerMemoryStats {
                usage: Some(256),
                limit: Some(1024),
                ..Default::default()
            }),
            networks: Some(HashMap::from([
                (
                    "eth0".to_string(),
                    ContainerNetworkStats {
                        rx_bytes: Some(1000),
                        tx_bytes: Some(2000),
                        ..Default::default()
                    },
                ),
                (
                    "eth1".to_string(),
                    ContainerNetworkStats {
                        rx_bytes: Some(5),
                        ..Default::default()
                    },
                ),
            ])),
            pids_stats: Some(ContainerPidsStats {
                current: Some(5),
                ..Default::default()
            }),
            blkio_stats: Some(ContainerBlkioStats {
                io_service_bytes_recursive: Some(vec![
                    ContainerBlkioStatEntry {
                        op: Some("Read".to_string()),
                        value: Some(100),
                        ..Default::default()
                    },
                    ContainerBlkioStatEntry {
                        op: Some("write".to_string()),
                        value: Some(200),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let m = container_metrics(&s).unwrap();
        assert!((m["cpuUtilizationPercent"] - 20.0).abs() < 0.01);
        assert_eq!(m["memoryUsedBytes"], 256.0);
        assert_eq!(m["memoryUsedPercent"], 25.0);
        assert_eq!(m["networkInBytes"], 1005.0);
        assert_eq!(m["networkOutBytes"], 2000.0);
        assert_eq!(m["diskReadBytes"], 100.0);
        assert_eq!(m["diskWriteBytes"], 200.0);
        assert_eq!(m["pids"], 5.0);
        assert_eq!(m["cpuThrottledPeriods"], 0.0);
    }

    #[test]
    fn reports_throttled_periods() {
        let s = ContainerStatsResponse {
            cpu_stats: Some(ContainerCpuStats {
                throttling_data: Some(ContainerThrottlingData {
                    throttled_periods: Some(3),
                    ..Default::default()
                }),
                ..cpu_snapshot(100, 1000)
            }),
            precpu_stats: Some(cpu_snapshot(50, 500)),
            ..Default::default()
        };
        let m = container_metrics(&s).unwrap();
        assert_eq!(m["cpuThrottledPeriods"], 3.0);
    }

    #[test]
    fn zero_system_delta_reports_zero_cpu() {
        let s = ContainerStatsResponse {
            cpu_stats: Some(cpu_snapshot(100, 500)),
            precpu_stats: Some(cpu_snapshot(50, 500)),
            ..Default::default()
        };
        let m = container_metrics(&s).unwrap();
        assert_eq!(m["cpuUtilizationPercent"], 0.0);
        assert!(!m.contains_key("memoryUsedBytes"));
    }
}
