//! Soft memory budget enforcement.
//!
//! The agent targets a 48 MiB envelope. Reusable scratch objects live in
//! bounded pools; the supervisor samples the process RSS and, past the
//! critical threshold, halves every pool. Pool contents are logical caches,
//! so dropping them is always safe.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::{debug, warn};

use microradar_common::{ContainerInfo, FlowKey, FlowStats};

use crate::pump::Event;

/// Budget thresholds as fractions of the soft cap.
const WARNING_PERCENT: u64 = 70;
const CRITICAL_PERCENT: u64 = 85;

pub struct ObjectPool<T> {
    name: &'static str,
    capacity: usize,
    items: Mutex<Vec<T>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T: Default> ObjectPool<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            items: Mutex::new(Vec::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self) -> T {
        let mut items = self.items.lock().expect("pool lock poisoned");
        match items.pop() {
            Some(item) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                item
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                T::default()
            }
        }
    }

    /// Return an object to the pool. Full pools drop the object instead.
    pub fn put(&self, item: T) {
        let mut items = self.items.lock().expect("pool lock poisoned");
        if items.len() < self.capacity {
            items.push(item);
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard the least recently returned half of the pool.
    pub fn shrink_half(&self) -> usize {
        let mut items = self.items.lock().expect("pool lock poisoned");
        let target = items.len() / 2;
        let dropped = items.len() - target;
        items.truncate(target);
        dropped
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// The agent's reusable scratch pools. Capacities bound the worst-case
/// retained memory; all users tolerate a fresh (default) object on miss.
pub struct PoolSet {
    pub container_records: ObjectPool<Vec<(u64, ContainerInfo)>>,
    pub flow_keys: ObjectPool<Vec<FlowKey>>,
    pub flow_stats: ObjectPool<Vec<(FlowKey, FlowStats)>>,
    pub event_batches: ObjectPool<Vec<Event>>,
    pub byte_buffers: ObjectPool<Vec<u8>>,
}

impl PoolSet {
    pub fn new() -> Self {
        Self {
            container_records: ObjectPool::new("container_records", 100),
            flow_keys: ObjectPool::new("flow_keys", 1000),
            flow_stats: ObjectPool::new("flow_stats", 1000),
            event_batches: ObjectPool::new("event_batches", 500),
            byte_buffers: ObjectPool::new("byte_buffers", 200),
        }
    }

    /// A pooled output buffer with at least 4 KiB ready.
    pub fn get_buffer(&self) -> Vec<u8> {
        let mut buf = self.byte_buffers.get();
        buf.clear();
        buf.reserve(4096);
        buf
    }

    fn shrink_all(&self) -> usize {
        self.container_records.shrink_half()
            + self.flow_keys.shrink_half()
            + self.flow_stats.shrink_half()
            + self.event_batches.shrink_half()
            + self.byte_buffers.shrink_half()
    }
}

impl Default for PoolSet {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemorySupervisor {
    soft_cap: u64,
    warning: u64,
    critical: u64,
    current: AtomicU64,
    sweeps: AtomicU64,
    pub pools: PoolSet,
}

impl MemorySupervisor {
    pub fn new(soft_cap: u64) -> Self {
        Self {
            soft_cap,
            warning: soft_cap * WARNING_PERCENT / 100,
            critical: soft_cap * CRITICAL_PERCENT / 100,
            current: AtomicU64::new(0),
            sweeps: AtomicU64::new(0),
            pools: PoolSet::new(),
        }
    }

    pub fn soft_cap(&self) -> u64 {
        self.soft_cap
    }

    pub fn current_bytes(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    /// Sample RSS, sweep past the critical threshold, warn if still above.
    pub fn enforce(&self) {
        let used = self.sample();
        if used > self.critical {
            let dropped = self.sweep();
            let after = self.sample();
            if after > self.critical {
                warn!(
                    "memory budget exceeded: {} of {} bytes in use after dropping {} pooled objects",
                    after, self.soft_cap, dropped
                );
            } else {
                debug!(
                    "memory sweep reclaimed below critical: {} -> {} bytes",
                    used, after
                );
            }
        } else if used > self.warning {
            debug!(
                "memory usage above warning threshold: {} of {} bytes",
                used, self.soft_cap
            );
        }
    }

    /// Halve every pool. Returns the number of objects dropped.
    pub fn sweep(&self) -> usize {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.pools.shrink_all()
    }

    fn sample(&self) -> u64 {
        let used = rss_bytes().unwrap_or(0);
        self.current.store(used, Ordering::Relaxed);
        used
    }
}

/// Resident set size from /proc/self/statm (second field, in pages).
fn rss_bytes() -> Option<u64> {
    let statm = fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(resident_pages * page_size as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_returned_objects() {
        let pool: ObjectPool<Vec<u8>> = ObjectPool::new("test", 4);
        let mut buf = pool.get();
        buf.extend_from_slice(b"data");
        buf.clear();
        pool.put(buf);
        assert_eq!(pool.len(), 1);

        let reused = pool.get();
        assert!(reused.is_empty());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn pool_drops_past_capacity() {
        let pool: ObjectPool<Vec<u8>> = ObjectPool::new("test", 2);
        pool.put(Vec::new());
        pool.put(Vec::new());
        pool.put(Vec::new());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn sweep_halves_every_pool() {
        let supervisor = MemorySupervisor::new(48 * 1024 * 1024);
        for _ in 0..10 {
            supervisor.pools.flow_keys.put(Vec::new());
            supervisor.pools.byte_buffers.put(Vec::new());
        }
        let keys_before = supervisor.pools.flow_keys.len();
        let buffers_before = supervisor.pools.byte_buffers.len();

        supervisor.sweep();

        assert!(supervisor.pools.flow_keys.len() <= keys_before / 2);
        assert!(supervisor.pools.byte_buffers.len() <= buffers_before / 2);
        assert_eq!(supervisor.sweeps(), 1);
    }

    #[test]
    fn thresholds_follow_the_cap() {
        let supervisor = MemorySupervisor::new(100);
        assert_eq!(supervisor.warning, 70);
        assert_eq!(supervisor.critical, 85);
        assert_eq!(supervisor.soft_cap(), 100);
    }

    #[test]
    fn rss_sampling_works_on_linux() {
        assert!(rss_bytes().unwrap_or(0) > 0);
    }
}
