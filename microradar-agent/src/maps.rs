//! Typed userspace handles over the kernel maps shared with the probes.
//!
//! The aggregator and the reaper receive a read-mostly handle to this set;
//! neither holds a reference back to the loader. Map iteration is
//! single-reader: callers serialize access through a mutex around the set.

use aya::maps::{Array, HashMap as BpfHashMap, MapData};
use aya::Ebpf;
use chrono::{DateTime, Utc};

use microradar_common::{
    ContainerInfo, FlowKey, FlowStats, COUNTER_SLOTS, EVENTS_RING_BYTES, MAX_CONTAINERS,
    MAX_NETWORK_FLOWS, MAX_PID_MAPPINGS, NETWORK_EVENTS_RING_BYTES,
};

use crate::error::{AgentError, Result};

/// Name and capacity of every kernel map, for the status inspector.
pub fn map_capacities() -> Vec<(&'static str, u64)> {
    vec![
        ("CONTAINER_TABLE", MAX_CONTAINERS as u64),
        ("PID_TO_CGROUP", MAX_PID_MAPPINGS as u64),
        ("FLOW_TABLE", MAX_NETWORK_FLOWS as u64),
        ("LATENCY_PENDING", MAX_NETWORK_FLOWS as u64),
        ("EVENTS", EVENTS_RING_BYTES as u64),
        ("NETWORK_EVENTS", NETWORK_EVENTS_RING_BYTES as u64),
        ("COUNTERS", COUNTER_SLOTS as u64),
    ]
}

pub struct KernelMaps {
    container_table: BpfHashMap<MapData, u64, ContainerInfo>,
    flow_table: BpfHashMap<MapData, FlowKey, FlowStats>,
    lifecycle_counters: Array<MapData, u64>,
    network_counters: Array<MapData, u64>,
    map_count: usize,
}

impl KernelMaps {
    /// Take ownership of the shared maps out of the two loaded objects.
    /// The ring buffers are taken separately by the pump; `map_count` is the
    /// total across both objects, counted before anything was taken.
    pub fn take(container_obj: &mut Ebpf, network_obj: &mut Ebpf, map_count: usize) -> Result<Self> {
        let container_table = BpfHashMap::try_from(
            container_obj
                .take_map("CONTAINER_TABLE")
                .ok_or_else(|| AgentError::MapAccess("CONTAINER_TABLE not found".to_string()))?,
        )
        .map_err(|e| AgentError::MapAccess(format!("CONTAINER_TABLE: {}", e)))?;

        let lifecycle_counters = Array::try_from(
            container_obj
                .take_map("COUNTERS")
                .ok_or_else(|| AgentError::MapAccess("lifecycle COUNTERS not found".to_string()))?,
        )
        .map_err(|e| AgentError::MapAccess(format!("lifecycle COUNTERS: {}", e)))?;

        let flow_table = BpfHashMap::try_from(
            network_obj
                .take_map("FLOW_TABLE")
                .ok_or_else(|| AgentError::MapAccess("FLOW_TABLE not found".to_string()))?,
        )
        .map_err(|e| AgentError::MapAccess(format!("FLOW_TABLE: {}", e)))?;

        let network_counters = Array::try_from(
            network_obj
                .take_map("COUNTERS")
                .ok_or_else(|| AgentError::MapAccess("network COUNTERS not found".to_string()))?,
        )
        .map_err(|e| AgentError::MapAccess(format!("network COUNTERS: {}", e)))?;

        Ok(Self {
            container_table,
            flow_table,
            lifecycle_counters,
            network_counters,
            map_count,
        })
    }

    /// Collect the container table into `out`. An iteration error aborts and
    /// invalidates this cycle only.
    pub fn containers(&self, out: &mut Vec<(u64, ContainerInfo)>) -> Result<()> {
        out.clear();
        for entry in self.container_table.iter() {
            let (cgroup_id, info) =
                entry.map_err(|e| AgentError::MapAccess(format!("container table: {}", e)))?;
            out.push((cgroup_id, info));
        }
        Ok(())
    }

    pub fn flows(&self, out: &mut Vec<(FlowKey, FlowStats)>) -> Result<()> {
        out.clear();
        for entry in self.flow_table.iter() {
            let (key, stats) =
                entry.map_err(|e| AgentError::MapAccess(format!("flow table: {}", e)))?;
            out.push((key, stats));
        }
        Ok(())
    }

    /// Best-effort deletes; the kernel LRU reclaims anything we miss.
    pub fn remove_container(&mut self, cgroup_id: u64) {
        let _ = self.container_table.remove(&cgroup_id);
    }

    pub fn remove_flow(&mut self, key: &FlowKey) {
        let _ = self.flow_table.remove(key);
    }

    pub fn lifecycle_counter(&self, index: u32) -> u64 {
        self.lifecycle_counters.get(&index, 0).unwrap_or(0)
    }

    pub fn network_counter(&self, index: u32) -> u64 {
        self.network_counters.get(&index, 0).unwrap_or(0)
    }

    pub fn map_count(&self) -> usize {
        self.map_count
    }
}

/// Current CLOCK_MONOTONIC reading, the clock kernel probes stamp with.
pub fn kernel_clock_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Translate a kernel CLOCK_MONOTONIC timestamp into wall-clock time.
pub fn monotonic_to_wallclock(event_ns: u64) -> DateTime<Utc> {
    let age_ns = kernel_clock_ns().saturating_sub(event_ns);
    Utc::now() - chrono::Duration::nanoseconds(age_ns.min(i64::MAX as u64) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_clock_is_monotonic() {
        let a = kernel_clock_ns();
        let b = kernel_clock_ns();
        assert!(b >= a);
    }

    #[test]
    fn recent_event_maps_to_recent_wallclock() {
        let now_ns = kernel_clock_ns();
        let wallclock = monotonic_to_wallclock(now_ns);
        let delta = (Utc::now() - wallclock).num_seconds().abs();
        assert!(delta <= 1);
    }

    #[test]
    fn capacity_table_covers_all_maps() {
        let capacities = map_capacities();
        assert_eq!(capacities.len(), 7);
        assert!(capacities.iter().any(|(n, c)| *n == "FLOW_TABLE" && *c == 10_240));
        assert!(capacities.iter().any(|(n, c)| *n == "CONTAINER_TABLE" && *c == 1_000));
    }
}
