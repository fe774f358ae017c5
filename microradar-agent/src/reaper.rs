//! Staleness reaper.
//!
//! Two horizons: the short horizon (2x the sampling window) ages out idle
//! aggregation entries and best-effort deletes the matching kernel map
//! entries; the long horizon (10 minutes) forces a full sweep. Kernel LRU
//! eviction reclaims anything the reaper misses.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use tokio::sync::watch;

use crate::aggregator::{Aggregator, WINDOW};
use crate::maps::{kernel_clock_ns, KernelMaps};
use crate::memory::MemorySupervisor;

/// Idle entries older than this are dropped.
pub const SHORT_HORIZON: Duration = Duration::from_secs(2 * WINDOW.as_secs());

/// Everything is reconsidered at this cadence.
pub const LONG_HORIZON: Duration = Duration::from_secs(600);

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct Reaper {
    aggregator: Arc<Aggregator>,
    maps: Arc<Mutex<KernelMaps>>,
    supervisor: Arc<MemorySupervisor>,
}

impl Reaper {
    pub fn new(
        aggregator: Arc<Aggregator>,
        maps: Arc<Mutex<KernelMaps>>,
        supervisor: Arc<MemorySupervisor>,
    ) -> Self {
        Self {
            aggregator,
            maps,
            supervisor,
        }
    }

    pub async fn run(self, mut cancel: watch::Receiver<bool>) {
        debug!(
            "reaper started: short horizon {:?}, long horizon {:?}",
            SHORT_HORIZON, LONG_HORIZON
        );
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let sweeps_per_long_horizon =
            (LONG_HORIZON.as_secs() / SWEEP_INTERVAL.as_secs()).max(1);
        let mut sweep_count: u64 = 0;

        loop {
            tokio::select! {
                // The signal only ever flips to true.
                _ = cancel.changed() => break,
                _ = interval.tick() => {
                    sweep_count += 1;
                    let full = sweep_count % sweeps_per_long_horizon == 0;
                    self.sweep(full);
                }
            }
        }
        debug!("reaper stopped");
    }

    fn sweep(&self, full: bool) {
        let dropped = self.aggregator.prune(SHORT_HORIZON);
        if !dropped.is_empty() {
            debug!("reaper dropped {} stale container(s)", dropped.len());
        }

        self.sweep_kernel_maps(&dropped);

        if full {
            debug!("long-horizon sweep");
            // A full pass re-applies the short horizon to everything that
            // event handlers may have touched since, then revisits pools.
            self.aggregator.prune(SHORT_HORIZON);
            self.supervisor.enforce();
        }
    }

    /// Delete kernel entries for dropped containers and for flows idle past
    /// the short horizon. Best effort: the LRU also reclaims them.
    fn sweep_kernel_maps(&self, dropped_cgroups: &[u64]) {
        let mut stale_keys = self.supervisor.pools.flow_keys.get();
        stale_keys.clear();

        let mut maps = self.maps.lock().expect("kernel maps lock poisoned");

        for cgroup_id in dropped_cgroups {
            maps.remove_container(*cgroup_id);
        }

        let mut flows = self.supervisor.pools.flow_stats.get();
        if maps.flows(&mut flows).is_ok() {
            let now_ns = kernel_clock_ns();
            let horizon_ns = SHORT_HORIZON.as_nanos() as u64;
            for (key, stats) in flows.iter() {
                if now_ns.saturating_sub(stats.last_seen_ns) > horizon_ns {
                    stale_keys.push(*key);
                }
            }
            for key in stale_keys.iter() {
                maps.remove_flow(key);
            }
            if !stale_keys.is_empty() {
                debug!("reaper deleted {} idle kernel flow(s)", stale_keys.len());
            }
        }
        drop(maps);

        flows.clear();
        stale_keys.clear();
        self.supervisor.pools.flow_stats.put(flows);
        self.supervisor.pools.flow_keys.put(stale_keys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_horizon_is_twice_the_window() {
        assert_eq!(SHORT_HORIZON, Duration::from_secs(120));
    }

    #[test]
    fn long_horizon_is_ten_minutes() {
        assert_eq!(LONG_HORIZON, Duration::from_secs(600));
    }
}
