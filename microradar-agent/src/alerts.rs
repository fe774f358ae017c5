//! Threshold alerting over published snapshots.
//!
//! Pure evaluation: a snapshot plus the configured thresholds yields the
//! set of containers currently in violation. The aggregator logs these
//! (rate-limited) and the dashboard highlights them.

use std::fmt;

use crate::config::AlertThresholds;
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    CpuHigh,
    MemoryHigh,
    NetworkLatencyHigh,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlertKind::CpuHigh => "cpu_high",
            AlertKind::MemoryHigh => "memory_high",
            AlertKind::NetworkLatencyHigh => "network_latency_high",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub kind: AlertKind,
    pub cgroup_id: u64,
    pub container_id: String,
    pub message: String,
}

/// Containers currently over a threshold. Thresholds are inclusive at the
/// configured value, matching "alert at 70" expectations.
pub fn evaluate(snapshot: &Snapshot, thresholds: &AlertThresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();

    for container in &snapshot.containers {
        if container.cpu_percent >= thresholds.cpu {
            alerts.push(Alert {
                kind: AlertKind::CpuHigh,
                cgroup_id: container.cgroup_id,
                container_id: container.container_id.clone(),
                message: format!(
                    "container {} cpu at {:.1}% (threshold {:.1}%)",
                    container.container_id, container.cpu_percent, thresholds.cpu
                ),
            });
        }
        if container.memory_percent >= thresholds.memory {
            alerts.push(Alert {
                kind: AlertKind::MemoryHigh,
                cgroup_id: container.cgroup_id,
                container_id: container.container_id.clone(),
                message: format!(
                    "container {} memory at {:.1}% (threshold {:.1}%)",
                    container.container_id, container.memory_percent, thresholds.memory
                ),
            });
        }
        if container.network_latency_ms >= thresholds.network_latency {
            alerts.push(Alert {
                kind: AlertKind::NetworkLatencyHigh,
                cgroup_id: container.cgroup_id,
                container_id: container.container_id.clone(),
                message: format!(
                    "container {} latency at {:.2}ms (threshold {:.2}ms)",
                    container.container_id, container.network_latency_ms,
                    thresholds.network_latency
                ),
            });
        }
    }

    alerts
}
