//! Immutable metrics snapshots and the single-writer/multi-reader store.
//!
//! The aggregator publishes a fresh snapshot each cycle by atomically
//! replacing the store's pointer. Readers (dashboard, HTTP handlers) load
//! the current pointer without locking and can hold it for as long as they
//! need; the previous snapshot is freed once the last reader drops it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;

use microradar_common::status;

/// User-visible container state. Kernel `CREATED` records surface as
/// `Starting` until an exec or cgroup-attach promotes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Starting,
    Running,
    Paused,
    Stopped,
    Exited,
    Unknown,
}

impl ContainerStatus {
    pub fn from_kernel(raw: u32) -> Self {
        match raw {
            status::CREATED => ContainerStatus::Starting,
            status::RUNNING => ContainerStatus::Running,
            status::PAUSED => ContainerStatus::Paused,
            status::STOPPED => ContainerStatus::Stopped,
            status::EXITED => ContainerStatus::Exited,
            _ => ContainerStatus::Unknown,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerStatus::Starting => "starting",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Per-container entry in a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerMetrics {
    pub cgroup_id: u64,
    pub container_id: String,
    pub name: String,
    pub pid: u32,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_bytes: u64,
    pub network_latency_ms: f64,
    pub tcp_retransmits: u64,
    pub status: ContainerStatus,
    pub started_at: DateTime<Utc>,
    /// True for one cycle after an LRU eviction forced a counter re-baseline.
    pub reseeded: bool,
}

/// One internally-consistent view of all metrics. Never mutated after
/// publication.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub generation: u64,
    pub containers: Vec<ContainerMetrics>,
    pub system_memory_bytes: u64,
    pub kernel_maps: usize,
    pub generated_at: DateTime<Utc>,
}

pub struct SnapshotStore {
    current: ArcSwapOption<Snapshot>,
    generation: AtomicU64,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
        }
    }

    /// Publish a new snapshot, assigning it the next generation number.
    /// Returns the generation assigned.
    pub fn publish(&self, mut snapshot: Snapshot) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        snapshot.generation = generation;
        self.current.store(Some(Arc::new(snapshot)));
        generation
    }

    /// Wait-free read of the current snapshot, if any has been published.
    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_snapshot() -> Snapshot {
        Snapshot {
            generation: 0,
            containers: Vec::new(),
            system_memory_bytes: 0,
            kernel_maps: 0,
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn store_starts_empty() {
        let store = SnapshotStore::new();
        assert!(store.current().is_none());
        assert_eq!(store.generation(), 0);
    }

    #[test]
    fn generations_are_monotonic() {
        let store = SnapshotStore::new();
        let g1 = store.publish(empty_snapshot());
        let g2 = store.publish(empty_snapshot());
        let g3 = store.publish(empty_snapshot());
        assert!(g1 < g2 && g2 < g3);
        assert_eq!(store.current().unwrap().generation, g3);
    }

    #[test]
    fn publish_times_strictly_increase() {
        let store = SnapshotStore::new();
        let mut first = empty_snapshot();
        first.generated_at = Utc::now();
        store.publish(first);
        let t1 = store.current().unwrap().generated_at;

        let mut second = empty_snapshot();
        second.generated_at = t1 + chrono::Duration::milliseconds(1);
        store.publish(second);
        let t2 = store.current().unwrap().generated_at;
        assert!(t2 > t1);
    }

    #[test]
    fn readers_keep_old_snapshot_alive_across_publish() {
        let store = SnapshotStore::new();
        store.publish(empty_snapshot());
        let held = store.current().unwrap();
        let held_generation = held.generation;

        store.publish(empty_snapshot());
        // The held view is unchanged even though the store moved on.
        assert_eq!(held.generation, held_generation);
        assert_ne!(store.current().unwrap().generation, held_generation);
    }

    #[test]
    fn kernel_created_maps_to_starting() {
        assert_eq!(ContainerStatus::from_kernel(1), ContainerStatus::Starting);
        assert_eq!(ContainerStatus::from_kernel(2), ContainerStatus::Running);
        assert_eq!(ContainerStatus::from_kernel(4), ContainerStatus::Stopped);
        assert_eq!(ContainerStatus::from_kernel(99), ContainerStatus::Unknown);
        assert_eq!(ContainerStatus::Starting.to_string(), "starting");
    }
}
