//! Metrics aggregation.
//!
//! Converts pump events plus periodic polls of the kernel container and
//! flow tables into immutable snapshots. Kernel counters are cumulative;
//! each cycle folds the delta against a per-flow baseline, and a counter
//! that moved backwards means the LRU evicted the entry: the baseline is
//! reseeded and the delta discarded for that cycle.
//!
//! The aggregation state sits behind a single reader-writer lock. Pump
//! handlers take the writer briefly; the poll cycle clones everything it
//! needs out of the lock before publishing, so the lock is never held
//! across a suspension point.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::sync::watch;

use microradar_common::{flow_flags, is_container_cgroup, ContainerInfo, FlowKey, FlowStats};

use crate::config::AlertThresholds;
use crate::error::LogThrottle;
use crate::maps::{monotonic_to_wallclock, KernelMaps};
use crate::memory::MemorySupervisor;
use crate::pump::Event;
use crate::runtime::RuntimeResolver;
use crate::snapshot::{ContainerMetrics, ContainerStatus, Snapshot, SnapshotStore};

/// Sliding sample window length.
pub const WINDOW: Duration = Duration::from_secs(60);

/// At most this many samples are retained per metric; oldest dropped first.
pub const MAX_SAMPLES: usize = 100;

/// Memory-percent denominator when the host total cannot be read.
const FALLBACK_TOTAL_MEMORY: u64 = 8 * 1024 * 1024 * 1024;

/// Runtime-reported container ids are shortened to this many chars, matching
/// the kernel-derived hex fallback.
const SHORT_ID_LEN: usize = 12;

/// Bounded ring of f64 samples with running summaries.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    values: VecDeque<f64>,
    cap: usize,
}

impl SampleWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(cap.min(16)),
            cap,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.cap {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn avg(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    pub fn min(&self) -> f64 {
        self.values.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Aggregated per-container record.
#[derive(Debug, Clone)]
pub struct ContainerAgg {
    pub cgroup_id: u64,
    pub container_id: String,
    pub name: String,
    pub pid: u32,
    pub cpu_samples: SampleWindow,
    pub memory_samples: SampleWindow,
    pub current_cpu_percent: f64,
    pub current_memory_bytes: u64,
    pub status: ContainerStatus,
    pub started_at: DateTime<Utc>,
    pub last_update: Instant,
    pub reseeded: bool,
}

impl ContainerAgg {
    fn new(cgroup_id: u64) -> Self {
        Self {
            cgroup_id,
            container_id: short_hex_id(cgroup_id),
            name: String::new(),
            pid: 0,
            cpu_samples: SampleWindow::new(MAX_SAMPLES),
            memory_samples: SampleWindow::new(MAX_SAMPLES),
            current_cpu_percent: 0.0,
            current_memory_bytes: 0,
            status: ContainerStatus::Starting,
            started_at: Utc::now(),
            last_update: Instant::now(),
            reseeded: false,
        }
    }
}

/// Aggregated per-cgroup network rollup.
#[derive(Debug, Clone)]
pub struct NetworkAgg {
    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub latency_samples: SampleWindow,
    pub tcp_retransmits: u64,
    pub last_update: Instant,
}

impl NetworkAgg {
    fn new() -> Self {
        Self {
            packets_in: 0,
            packets_out: 0,
            bytes_in: 0,
            bytes_out: 0,
            latency_samples: SampleWindow::new(MAX_SAMPLES),
            tcp_retransmits: 0,
            last_update: Instant::now(),
        }
    }
}

/// Last observed cumulative counters per flow key.
#[derive(Debug, Clone, Copy, Default)]
struct FlowBaseline {
    packets: u64,
    bytes: u64,
    retransmits: u32,
    latency_count: u32,
}

/// The mutable aggregation state. Pure with respect to kernel maps: polls
/// hand it plain slices, which keeps every transition unit-testable.
pub struct AggState {
    containers: HashMap<u64, ContainerAgg>,
    networks: HashMap<u64, NetworkAgg>,
    baselines: HashMap<FlowKey, FlowBaseline>,
    max_containers: usize,
}

impl AggState {
    pub fn new(max_containers: usize) -> Self {
        Self {
            containers: HashMap::new(),
            networks: HashMap::new(),
            baselines: HashMap::new(),
            max_containers,
        }
    }

    /// Reseed markers last exactly one cycle.
    pub fn begin_cycle(&mut self) {
        for container in self.containers.values_mut() {
            container.reseeded = false;
        }
    }

    pub fn apply_event(&mut self, event: Event) {
        match event {
            Event::ContainerStart(info) => self.on_container_start(info),
            Event::ContainerStop(info) => self.on_container_stop(info),
            Event::NetworkPacket { cgroup_id, .. } => self.on_network_packet(cgroup_id),
            Event::CpuSample {
                cgroup_id,
                millipercent,
            } => self.on_cpu_sample(cgroup_id, millipercent),
            Event::MemorySample { cgroup_id, bytes } => self.on_memory_sample(cgroup_id, bytes),
        }
    }

    fn on_container_start(&mut self, info: ContainerInfo) {
        if !self.containers.contains_key(&info.cgroup_id)
            && self.containers.len() >= self.max_containers
        {
            return;
        }
        let container = self
            .containers
            .entry(info.cgroup_id)
            .or_insert_with(|| ContainerAgg::new(info.cgroup_id));
        container.pid = info.pid;
        container.name = comm_to_string(&info.comm);
        container.status = ContainerStatus::from_kernel(info.status);
        container.started_at = monotonic_to_wallclock(info.start_time_ns);
        container.last_update = Instant::now();
    }

    fn on_container_stop(&mut self, info: ContainerInfo) {
        if let Some(container) = self.containers.get_mut(&info.cgroup_id) {
            container.status = ContainerStatus::Stopped;
            container.last_update = Instant::now();
        }
    }

    fn on_network_packet(&mut self, cgroup_id: u64) {
        // Counter folding happens on the poll; the event only refreshes
        // liveness so the reaper keeps the rollup.
        let network = self.networks.entry(cgroup_id).or_insert_with(NetworkAgg::new);
        network.last_update = Instant::now();
    }

    fn on_cpu_sample(&mut self, cgroup_id: u64, millipercent: u64) {
        if let Some(container) = self.containers.get_mut(&cgroup_id) {
            let percent = millipercent as f64 / 10.0;
            container.cpu_samples.push(percent);
            container.current_cpu_percent = percent;
            container.last_update = Instant::now();
        }
    }

    fn on_memory_sample(&mut self, cgroup_id: u64, bytes: u64) {
        if let Some(container) = self.containers.get_mut(&cgroup_id) {
            // Zero is a valid sample.
            container.memory_samples.push(bytes as f64);
            container.current_memory_bytes = bytes;
            container.last_update = Instant::now();
        }
    }

    /// Reconcile with the authoritative kernel container table.
    /// `resolve` maps a primary pid to a runtime-reported container id.
    pub fn reconcile_containers<F>(&mut self, entries: &[(u64, ContainerInfo)], resolve: F)
    where
        F: Fn(u32) -> Option<String>,
    {
        for (cgroup_id, info) in entries {
            if !is_container_cgroup(*cgroup_id) {
                continue;
            }
            // New containers past the configured cap are ignored until the
            // reaper makes room.
            if !self.containers.contains_key(cgroup_id)
                && self.containers.len() >= self.max_containers
            {
                continue;
            }
            let container = self
                .containers
                .entry(*cgroup_id)
                .or_insert_with(|| ContainerAgg::new(*cgroup_id));
            container.pid = info.pid;
            container.name = comm_to_string(&info.comm);
            container.status = ContainerStatus::from_kernel(info.status);
            container.started_at = monotonic_to_wallclock(info.start_time_ns);
            // Millipercent from the kernel table; 325 means 32.5%.
            container.current_cpu_percent = info.cpu_millipercent as f64 / 10.0;
            container.current_memory_bytes = info.memory_bytes;
            // Runtime-reported id wins over the kernel-derived hex id.
            if let Some(runtime_id) = resolve(info.pid) {
                container.container_id = shorten_id(&runtime_id);
            }
            container.last_update = Instant::now();
        }
    }

    /// Fold cumulative flow counters into per-cgroup rollups.
    pub fn fold_flows(&mut self, flows: &[(FlowKey, FlowStats)]) {
        for (key, stats) in flows {
            // Only flows of known containers contribute.
            if !self.containers.contains_key(&key.cgroup_id) {
                continue;
            }

            let network = self
                .networks
                .entry(key.cgroup_id)
                .or_insert_with(NetworkAgg::new);
            let baseline = self.baselines.entry(*key).or_default();

            if stats.packets < baseline.packets {
                // LRU eviction recreated the entry; discard this delta.
                *baseline = FlowBaseline {
                    packets: stats.packets,
                    bytes: stats.bytes,
                    retransmits: stats.tcp_retransmits,
                    latency_count: stats.latency_count,
                };
                if let Some(container) = self.containers.get_mut(&key.cgroup_id) {
                    container.reseeded = true;
                }
                network.last_update = Instant::now();
                continue;
            }

            let packet_delta = stats.packets - baseline.packets;
            let byte_delta = stats.bytes - baseline.bytes;
            let retransmit_delta = stats.tcp_retransmits.saturating_sub(baseline.retransmits);

            if packet_delta > 0 {
                if stats.flags & flow_flags::OUTBOUND != 0 {
                    network.packets_out += packet_delta;
                    network.bytes_out += byte_delta;
                } else if stats.flags & flow_flags::INBOUND != 0 {
                    network.packets_in += packet_delta;
                    network.bytes_in += byte_delta;
                }
            }
            network.tcp_retransmits += retransmit_delta as u64;

            if stats.latency_count > 0 && stats.latency_count != baseline.latency_count {
                let mean_ms =
                    stats.latency_sum_ns as f64 / stats.latency_count as f64 / 1_000_000.0;
                network.latency_samples.push(mean_ms);
            }

            if packet_delta > 0 || retransmit_delta > 0 {
                network.last_update = Instant::now();
            }

            *baseline = FlowBaseline {
                packets: stats.packets,
                bytes: stats.bytes,
                retransmits: stats.tcp_retransmits,
                latency_count: stats.latency_count,
            };
        }
    }

    /// Assemble an immutable snapshot, containers ordered by cgroup id.
    pub fn build_snapshot(
        &self,
        system_memory_bytes: u64,
        kernel_maps: usize,
        host_memory_bytes: u64,
    ) -> Snapshot {
        let denominator = if host_memory_bytes > 0 {
            host_memory_bytes
        } else {
            FALLBACK_TOTAL_MEMORY
        };

        let mut containers: Vec<ContainerMetrics> = self
            .containers
            .values()
            .map(|c| {
                let network = self.networks.get(&c.cgroup_id);
                ContainerMetrics {
                    cgroup_id: c.cgroup_id,
                    container_id: c.container_id.clone(),
                    name: c.name.clone(),
                    pid: c.pid,
                    cpu_percent: c.current_cpu_percent,
                    memory_percent: c.current_memory_bytes as f64 / denominator as f64 * 100.0,
                    memory_bytes: c.current_memory_bytes,
                    network_latency_ms: network
                        .map(|n| n.latency_samples.avg())
                        .unwrap_or(0.0),
                    tcp_retransmits: network.map(|n| n.tcp_retransmits).unwrap_or(0),
                    status: c.status,
                    started_at: c.started_at,
                    reseeded: c.reseeded,
                }
            })
            .collect();
        containers.sort_by_key(|c| c.cgroup_id);

        Snapshot {
            generation: 0,
            containers,
            system_memory_bytes,
            kernel_maps,
            generated_at: Utc::now(),
        }
    }

    /// Drop entries whose last update is older than `horizon`. Returns the
    /// cgroup ids removed so kernel map entries can be deleted too.
    pub fn prune(&mut self, horizon: Duration) -> Vec<u64> {
        let mut dropped = Vec::new();
        self.containers.retain(|cgroup_id, container| {
            let keep = container.last_update.elapsed() <= horizon;
            if !keep {
                dropped.push(*cgroup_id);
            }
            keep
        });
        self.networks
            .retain(|_, network| network.last_update.elapsed() <= horizon);
        let live: std::collections::HashSet<u64> = self.containers.keys().copied().collect();
        self.baselines.retain(|key, _| live.contains(&key.cgroup_id));
        dropped
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    #[cfg(test)]
    fn container_mut(&mut self, cgroup_id: u64) -> Option<&mut ContainerAgg> {
        self.containers.get_mut(&cgroup_id)
    }

    #[cfg(test)]
    fn network(&self, cgroup_id: u64) -> Option<&NetworkAgg> {
        self.networks.get(&cgroup_id)
    }
}

impl Default for AggState {
    fn default() -> Self {
        Self::new(1000)
    }
}

pub struct Aggregator {
    state: RwLock<AggState>,
    store: Arc<SnapshotStore>,
    resolver: Arc<RuntimeResolver>,
    supervisor: Arc<MemorySupervisor>,
    thresholds: AlertThresholds,
    host_memory_bytes: u64,
    throttle: LogThrottle,
}

impl Aggregator {
    pub fn new(
        store: Arc<SnapshotStore>,
        resolver: Arc<RuntimeResolver>,
        supervisor: Arc<MemorySupervisor>,
        thresholds: AlertThresholds,
        max_containers: usize,
    ) -> Self {
        let host_memory_bytes = host_total_memory().unwrap_or_else(|| {
            warn!("cannot read MemTotal from /proc/meminfo, assuming 8 GiB");
            FALLBACK_TOTAL_MEMORY
        });
        Self {
            state: RwLock::new(AggState::new(max_containers)),
            store,
            resolver,
            supervisor,
            thresholds,
            host_memory_bytes,
            throttle: LogThrottle::per_minute(),
        }
    }

    /// Incremental update from the pump. Takes the writer only briefly.
    pub fn handle_event(&self, event: Event) {
        let mut state = self.state.write().expect("aggregator lock poisoned");
        state.apply_event(event);
    }

    pub fn container_count(&self) -> usize {
        self.state
            .read()
            .expect("aggregator lock poisoned")
            .container_count()
    }

    /// Reaper entry point: drop stale aggregation entries.
    pub fn prune(&self, horizon: Duration) -> Vec<u64> {
        let mut state = self.state.write().expect("aggregator lock poisoned");
        state.prune(horizon)
    }

    /// Periodic loop: poll kernel maps, reconcile, fold, publish.
    pub async fn run(
        self: Arc<Self>,
        maps: Arc<Mutex<KernelMaps>>,
        sampling_rate: Duration,
        mut cancel: watch::Receiver<bool>,
    ) {
        debug!(
            "aggregator started, sampling every {:?}, host memory {} bytes",
            sampling_rate, self.host_memory_bytes
        );
        let mut interval = tokio::time::interval(sampling_rate);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // The signal only ever flips to true.
                _ = cancel.changed() => break,
                _ = interval.tick() => {
                    self.poll_cycle(&maps);
                }
            }
        }
        debug!("aggregator stopped");
    }

    fn poll_cycle(&self, maps: &Mutex<KernelMaps>) {
        let mut containers = self.supervisor.pools.container_records.get();
        let mut flows = self.supervisor.pools.flow_stats.get();

        let kernel_maps;
        {
            let maps = maps.lock().expect("kernel maps lock poisoned");
            kernel_maps = maps.map_count();
            if let Err(e) = maps.containers(&mut containers) {
                // A failed iteration invalidates this cycle only.
                if self.throttle.allow("container_table") {
                    warn!("skipping aggregation cycle: {}", e);
                }
                self.release_scratch(containers, flows);
                return;
            }
            if let Err(e) = maps.flows(&mut flows) {
                if self.throttle.allow("flow_table") {
                    warn!("skipping flow fold this cycle: {}", e);
                }
                flows.clear();
            }
        }

        self.resolver.refresh_if_stale();

        let snapshot = {
            let mut state = self.state.write().expect("aggregator lock poisoned");
            state.begin_cycle();
            state.reconcile_containers(&containers, |pid| {
                self.resolver.lookup_pid(pid).map(|c| c.container_id)
            });
            state.fold_flows(&flows);
            state.build_snapshot(
                self.supervisor.current_bytes(),
                kernel_maps,
                self.host_memory_bytes,
            )
        };
        for alert in crate::alerts::evaluate(&snapshot, &self.thresholds) {
            let kind = match alert.kind {
                crate::alerts::AlertKind::CpuHigh => "alert_cpu",
                crate::alerts::AlertKind::MemoryHigh => "alert_memory",
                crate::alerts::AlertKind::NetworkLatencyHigh => "alert_latency",
            };
            if self.throttle.allow(kind) {
                warn!("{}", alert.message);
            }
        }

        // Publish outside the writer lock; readers never see a partial view.
        self.store.publish(snapshot);

        self.release_scratch(containers, flows);
    }

    fn release_scratch(
        &self,
        mut containers: Vec<(u64, ContainerInfo)>,
        mut flows: Vec<(FlowKey, FlowStats)>,
    ) {
        containers.clear();
        flows.clear();
        self.supervisor.pools.container_records.put(containers);
        self.supervisor.pools.flow_stats.put(flows);
    }
}

/// First 12 hex chars of the cgroup id, the fallback textual identity.
pub fn short_hex_id(cgroup_id: u64) -> String {
    let hex = format!("{:x}", cgroup_id);
    shorten_id(&hex)
}

fn shorten_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}

fn comm_to_string(comm: &[u8; 16]) -> String {
    let end = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
    String::from_utf8_lossy(&comm[..end]).into_owned()
}

/// MemTotal from /proc/meminfo, in bytes.
fn host_total_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use microradar_common::status;

    const CGROUP: u64 = 0xABCDEF00;

    fn kernel_container(cgroup_id: u64, pid: u32, status: u32) -> ContainerInfo {
        let mut info: ContainerInfo = unsafe { std::mem::zeroed() };
        info.cgroup_id = cgroup_id;
        info.pid = pid;
        info.ppid = pid;
        info.status = status;
        info.start_time_ns = crate::maps::kernel_clock_ns();
        info.comm[..3].copy_from_slice(b"web");
        info
    }

    fn flow_key(cgroup_id: u64) -> FlowKey {
        let mut key: FlowKey = unsafe { std::mem::zeroed() };
        key.src_ip = u32::from_be_bytes([10, 0, 0, 1]);
        key.dst_ip = u32::from_be_bytes([10, 0, 0, 2]);
        key.src_port = 5000u16.to_be();
        key.dst_port = 80u16.to_be();
        key.protocol = microradar_common::IPPROTO_TCP;
        key.cgroup_id = cgroup_id;
        key
    }

    fn flow_stats(packets: u64, bytes: u64) -> FlowStats {
        FlowStats {
            packets,
            bytes,
            flags: flow_flags::OUTBOUND,
            ..Default::default()
        }
    }

    #[test]
    fn container_startup_yields_one_snapshot_entry() {
        let mut state = AggState::new(1000);

        // Clone fires, then exec promotes to running before the next poll.
        let created = kernel_container(CGROUP, 4321, status::CREATED);
        state.apply_event(Event::ContainerStart(created));

        let running = kernel_container(CGROUP, 4321, status::RUNNING);
        state.reconcile_containers(&[(CGROUP, running)], |_| None);

        let snapshot = state.build_snapshot(0, 8, FALLBACK_TOTAL_MEMORY);
        assert_eq!(snapshot.containers.len(), 1);
        let container = &snapshot.containers[0];
        assert_eq!(container.container_id, "abcdef00");
        assert_eq!(container.status, ContainerStatus::Running);
        assert_eq!(container.pid, 4321);

        // No cpu/memory sample events arrived, so the rings stay empty.
        let agg = state.container_mut(CGROUP).unwrap();
        assert!(agg.cpu_samples.is_empty());
        assert!(agg.memory_samples.is_empty());
    }

    #[test]
    fn resolver_id_wins_over_kernel_hex() {
        let mut state = AggState::new(1000);
        let info = kernel_container(CGROUP, 4321, status::RUNNING);
        state.reconcile_containers(&[(CGROUP, info)], |pid| {
            assert_eq!(pid, 4321);
            Some("0123456789abcdef0123".to_string())
        });
        let snapshot = state.build_snapshot(0, 0, FALLBACK_TOTAL_MEMORY);
        assert_eq!(snapshot.containers[0].container_id, "0123456789ab");
    }

    #[test]
    fn flow_accumulation_folds_deltas() {
        let mut state = AggState::new(1000);
        let info = kernel_container(CGROUP, 1, status::RUNNING);
        state.reconcile_containers(&[(CGROUP, info)], |_| None);

        let key = flow_key(CGROUP);
        // Two egress packets of 60 and 100 bytes, observed over two polls.
        state.fold_flows(&[(key, flow_stats(1, 60))]);
        state.fold_flows(&[(key, flow_stats(2, 160))]);

        let network = state.network(CGROUP).unwrap();
        assert_eq!(network.packets_out, 2);
        assert_eq!(network.bytes_out, 160);
        assert_eq!(network.packets_in, 0);
    }

    #[test]
    fn latency_pairing_reports_mean_milliseconds() {
        let mut state = AggState::new(1000);
        let info = kernel_container(CGROUP, 1, status::RUNNING);
        state.reconcile_containers(&[(CGROUP, info)], |_| None);

        let key = flow_key(CGROUP);
        let mut stats = flow_stats(1, 60);
        stats.latency_sum_ns = 5_000_000;
        stats.latency_count = 1;
        state.fold_flows(&[(key, stats)]);

        let snapshot = state.build_snapshot(0, 0, FALLBACK_TOTAL_MEMORY);
        let latency = snapshot.containers[0].network_latency_ms;
        assert!((latency - 5.0).abs() < 1e-9);
    }

    #[test]
    fn retransmits_accumulate_per_container() {
        let mut state = AggState::new(1000);
        let info = kernel_container(0xDEAD, 1, status::RUNNING);
        state.reconcile_containers(&[(0xDEAD, info)], |_| None);

        let key = flow_key(0xDEAD);
        let mut stats = flow_stats(10, 600);
        stats.tcp_retransmits = 2;
        stats.flags |= flow_flags::RETRANSMIT;
        state.fold_flows(&[(key, stats)]);

        let snapshot = state.build_snapshot(0, 0, FALLBACK_TOTAL_MEMORY);
        assert_eq!(snapshot.containers[0].tcp_retransmits, 2);
    }

    #[test]
    fn eviction_rebaselines_without_negative_delta() {
        let mut state = AggState::new(1000);
        let info = kernel_container(CGROUP, 1, status::RUNNING);
        state.reconcile_containers(&[(CGROUP, info)], |_| None);

        let key = flow_key(CGROUP);
        let mut old = flow_stats(1_000_000, 60_000_000);
        old.latency_sum_ns = 4_000_000;
        old.latency_count = 2;
        state.fold_flows(&[(key, old)]);

        let packets_before = state.network(CGROUP).unwrap().packets_out;
        let latency_len_before = state.network(CGROUP).unwrap().latency_samples.len();

        // LRU eviction recreated the flow with a tiny count.
        state.begin_cycle();
        let mut evicted = flow_stats(12, 720);
        evicted.latency_count = 2;
        evicted.latency_sum_ns = 4_000_000;
        state.fold_flows(&[(key, evicted)]);

        let network = state.network(CGROUP).unwrap();
        assert_eq!(network.packets_out, packets_before);
        assert_eq!(network.latency_samples.len(), latency_len_before);
        let snapshot = state.build_snapshot(0, 0, FALLBACK_TOTAL_MEMORY);
        assert!(snapshot.containers[0].reseeded);

        // The next cycle folds from the fresh baseline.
        state.begin_cycle();
        state.fold_flows(&[(key, flow_stats(13, 780))]);
        assert_eq!(state.network(CGROUP).unwrap().packets_out, packets_before + 1);
        let snapshot = state.build_snapshot(0, 0, FALLBACK_TOTAL_MEMORY);
        assert!(!snapshot.containers[0].reseeded);
    }

    #[test]
    fn sample_windows_are_bounded() {
        let mut state = AggState::new(1000);
        let info = kernel_container(CGROUP, 1, status::RUNNING);
        state.reconcile_containers(&[(CGROUP, info)], |_| None);

        for i in 0..250 {
            state.apply_event(Event::CpuSample {
                cgroup_id: CGROUP,
                millipercent: i,
            });
            state.apply_event(Event::MemorySample {
                cgroup_id: CGROUP,
                bytes: i * 1024,
            });
        }

        let agg = state.container_mut(CGROUP).unwrap();
        assert_eq!(agg.cpu_samples.len(), MAX_SAMPLES);
        assert_eq!(agg.memory_samples.len(), MAX_SAMPLES);
        // Oldest dropped first: max survives in the trailing window.
        assert!((agg.cpu_samples.max() - 24.9).abs() < 1e-9);
    }

    #[test]
    fn zero_memory_sample_is_valid() {
        let mut state = AggState::new(1000);
        let mut info = kernel_container(CGROUP, 1, status::RUNNING);
        info.memory_bytes = 0;
        state.reconcile_containers(&[(CGROUP, info)], |_| None);
        state.apply_event(Event::MemorySample {
            cgroup_id: CGROUP,
            bytes: 0,
        });

        let snapshot = state.build_snapshot(0, 0, FALLBACK_TOTAL_MEMORY);
        assert_eq!(snapshot.containers[0].memory_percent, 0.0);
        assert_eq!(snapshot.containers[0].memory_bytes, 0);
    }

    #[test]
    fn unknown_cgroup_flows_are_ignored() {
        let mut state = AggState::new(1000);
        state.fold_flows(&[(flow_key(0x9999), flow_stats(5, 300))]);
        assert!(state.network(0x9999).is_none());
    }

    #[test]
    fn prune_drops_stale_entries_and_baselines() {
        let mut state = AggState::new(1000);
        let info = kernel_container(CGROUP, 1, status::RUNNING);
        state.reconcile_containers(&[(CGROUP, info)], |_| None);
        state.fold_flows(&[(flow_key(CGROUP), flow_stats(1, 60))]);

        // Age the record past the horizon.
        let stale = Instant::now() - Duration::from_secs(300);
        state.container_mut(CGROUP).unwrap().last_update = stale;
        state.networks.get_mut(&CGROUP).unwrap().last_update = stale;

        let dropped = state.prune(Duration::from_secs(120));
        assert_eq!(dropped, vec![CGROUP]);
        assert_eq!(state.container_count(), 0);
        assert!(state.baselines.is_empty());
    }

    #[test]
    fn snapshot_orders_containers_by_cgroup_id() {
        let mut state = AggState::new(1000);
        for cgroup_id in [500u64, 2, 77] {
            let info = kernel_container(cgroup_id, 1, status::RUNNING);
            state.reconcile_containers(&[(cgroup_id, info)], |_| None);
        }
        let snapshot = state.build_snapshot(0, 0, FALLBACK_TOTAL_MEMORY);
        let ids: Vec<u64> = snapshot.containers.iter().map(|c| c.cgroup_id).collect();
        assert_eq!(ids, vec![2, 77, 500]);
    }

    #[test]
    fn container_cap_holds_until_reaped() {
        let mut state = AggState::new(2);
        for cgroup_id in [10u64, 11, 12] {
            let info = kernel_container(cgroup_id, 1, status::RUNNING);
            state.reconcile_containers(&[(cgroup_id, info)], |_| None);
        }
        assert_eq!(state.container_count(), 2);

        // Known containers keep updating even at the cap.
        let refreshed = kernel_container(10, 99, status::RUNNING);
        state.reconcile_containers(&[(10, refreshed)], |_| None);
        assert_eq!(state.container_mut(10).unwrap().pid, 99);
    }

    #[test]
    fn short_hex_id_matches_kernel_rendering() {
        assert_eq!(short_hex_id(0xABCDEF00), "abcdef00");
        assert_eq!(short_hex_id(0x0123456789ABCDEF), "123456789abc");
    }
}
