//! Prometheus text exposition.
//!
//! Pure function of a snapshot: the same input renders byte-identical
//! output. One HELP/TYPE block per metric, container lines ordered by
//! cgroup id ascending so scrapes diff cleanly.

use std::io::Write;
use std::time::Duration;

use crate::snapshot::Snapshot;

/// Render the exposition document into `out`. Without a snapshot only the
/// `up 0` gauge is emitted.
pub fn render_into(out: &mut Vec<u8>, snapshot: Option<&Snapshot>, uptime: Duration) {
    let snapshot = match snapshot {
        Some(snapshot) => snapshot,
        None => {
            let _ = write!(
                out,
                "# HELP microradar_up MicroRadar service status\n\
                 # TYPE microradar_up gauge\n\
                 microradar_up 0\n"
            );
            return;
        }
    };

    let mut containers: Vec<_> = snapshot.containers.iter().collect();
    containers.sort_by_key(|c| c.cgroup_id);

    let _ = write!(
        out,
        "# HELP microradar_up MicroRadar service status\n\
         # TYPE microradar_up gauge\n\
         microradar_up 1\n\
         # HELP microradar_containers_total Total number of monitored containers\n\
         # TYPE microradar_containers_total gauge\n\
         microradar_containers_total {}\n\
         # HELP microradar_ebpf_maps_count Number of eBPF maps\n\
         # TYPE microradar_ebpf_maps_count gauge\n\
         microradar_ebpf_maps_count {}\n\
         # HELP microradar_memory_usage_bytes Agent resident memory in bytes\n\
         # TYPE microradar_memory_usage_bytes gauge\n\
         microradar_memory_usage_bytes {}\n\
         # HELP microradar_uptime_seconds Agent uptime in seconds\n\
         # TYPE microradar_uptime_seconds counter\n\
         microradar_uptime_seconds {}\n",
        containers.len(),
        snapshot.kernel_maps,
        snapshot.system_memory_bytes,
        uptime.as_secs(),
    );

    render_gauge(
        out,
        "microradar_container_cpu_percent",
        "Container CPU usage percentage",
        "gauge",
        &containers,
        |c| format!("{:.2}", c.cpu_percent),
    );
    render_gauge(
        out,
        "microradar_container_memory_percent",
        "Container memory usage percentage",
        "gauge",
        &containers,
        |c| format!("{:.2}", c.memory_percent),
    );
    render_gauge(
        out,
        "microradar_container_memory_bytes",
        "Container memory usage in bytes",
        "gauge",
        &containers,
        |c| c.memory_bytes.to_string(),
    );
    render_gauge(
        out,
        "microradar_container_network_latency_ms",
        "Container network latency in milliseconds",
        "gauge",
        &containers,
        |c| format!("{:.2}", c.network_latency_ms),
    );
    render_gauge(
        out,
        "microradar_container_tcp_retransmits",
        "Container TCP retransmissions",
        "counter",
        &containers,
        |c| c.tcp_retransmits.to_string(),
    );
}

pub fn render(snapshot: Option<&Snapshot>, uptime: Duration) -> String {
    let mut out = Vec::new();
    render_into(&mut out, snapshot, uptime);
    String::from_utf8(out).expect("exposition text is always UTF-8")
}

fn render_gauge(
    out: &mut Vec<u8>,
    name: &str,
    help: &str,
    kind: &str,
    containers: &[&crate::snapshot::ContainerMetrics],
    value: impl Fn(&crate::snapshot::ContainerMetrics) -> String,
) {
    if containers.is_empty() {
        return;
    }
    let _ = write!(out, "# HELP {} {}\n# TYPE {} {}\n", name, help, name, kind);
    for container in containers {
        let _ = write!(
            out,
            "{}{{container_id=\"{}\",container_name=\"{}\"}} {}\n",
            name,
            escape_label(&container.container_id),
            escape_label(&container.name),
            value(container),
        );
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{ContainerMetrics, ContainerStatus};
    use chrono::Utc;

    fn sample_snapshot() -> Snapshot {
        let container = |cgroup_id: u64, id: &str, name: &str| ContainerMetrics {
            cgroup_id,
            container_id: id.to_string(),
            name: name.to_string(),
            pid: 100,
            cpu_percent: 32.1,
            memory_percent: 45.6,
            memory_bytes: 512 * 1024 * 1024,
            network_latency_ms: 8.5,
            tcp_retransmits: 2,
            status: ContainerStatus::Running,
            started_at: Utc::now(),
            reseeded: false,
        };
        Snapshot {
            generation: 3,
            containers: vec![
                container(0xBEEF, "beef", "db-primary"),
                container(0xABCD, "abcd", "web-server"),
            ],
            system_memory_bytes: 21 * 1024 * 1024,
            kernel_maps: 8,
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn no_snapshot_emits_only_up_zero() {
        let text = render(None, Duration::from_secs(5));
        assert!(text.contains("microradar_up 0"));
        assert!(!text.contains("microradar_containers_total"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let snapshot = sample_snapshot();
        let uptime = Duration::from_secs(90);
        let first = render(Some(&snapshot), uptime);
        let second = render(Some(&snapshot), uptime);
        assert_eq!(first, second);
    }

    #[test]
    fn container_lines_are_ordered_by_cgroup_id() {
        let text = render(Some(&sample_snapshot()), Duration::from_secs(1));
        let abcd = text.find("container_id=\"abcd\"").unwrap();
        let beef = text.find("container_id=\"beef\"").unwrap();
        assert!(abcd < beef);
    }

    #[test]
    fn emits_all_metric_families() {
        let text = render(Some(&sample_snapshot()), Duration::from_secs(1));
        for metric in [
            "microradar_up 1",
            "microradar_containers_total 2",
            "microradar_ebpf_maps_count 8",
            "microradar_memory_usage_bytes 22020096",
            "microradar_uptime_seconds 1",
            "microradar_container_cpu_percent",
            "microradar_container_memory_percent",
            "microradar_container_memory_bytes",
            "microradar_container_network_latency_ms",
            "microradar_container_tcp_retransmits",
        ] {
            assert!(text.contains(metric), "missing {}", metric);
        }
        // TYPE lines appear once per family, not once per container.
        assert_eq!(
            text.matches("# TYPE microradar_container_cpu_percent gauge").count(),
            1
        );
    }

    #[test]
    fn labels_are_escaped() {
        let mut snapshot = sample_snapshot();
        snapshot.containers[0].name = "we\"ird\\name".to_string();
        let text = render(Some(&snapshot), Duration::from_secs(1));
        assert!(text.contains("container_name=\"we\\\"ird\\\\name\""));
    }
}
