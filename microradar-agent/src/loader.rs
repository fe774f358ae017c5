//! Probe loading, attachment and task supervision.
//!
//! The monitor owns both eBPF objects, every kernel attachment and all
//! long-lived tasks. Attach order is deterministic: lifecycle tracepoints
//! first, then kprobes, then tc classifiers. Lifecycle tracepoint failures
//! are fatal; anything else degrades the metric set with a warning. State
//! walks unloaded -> loaded -> attached -> running -> stopping -> unloaded,
//! and a failed transition unwinds back through the reverse path.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use aya::maps::RingBuf;
use aya::programs::{tc, KProbe, SchedClassifier, TcAttachType, TracePoint};
use aya::Ebpf;
use aya_log::EbpfLogger;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use microradar_common::counter;

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::maps::{map_capacities, KernelMaps};
use crate::memory::MemorySupervisor;
use crate::pump::{EventPump, PumpStats};
use crate::reaper::Reaper;
use crate::runtime::RuntimeResolver;
use crate::snapshot::SnapshotStore;

/// How long tasks get to finish after the cancel signal before the loader
/// force-closes the kernel attachments.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    Unloaded,
    Loaded,
    Attached,
    Running,
    Stopping,
}

impl fmt::Display for LoaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoaderState::Unloaded => "unloaded",
            LoaderState::Loaded => "loaded",
            LoaderState::Attached => "attached",
            LoaderState::Running => "running",
            LoaderState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Status view for the HTTP surface and the dashboard footer.
#[derive(Debug, Clone)]
pub struct MonitorStatus {
    pub state: LoaderState,
    pub map_count: usize,
    pub map_capacities: Vec<(&'static str, u64)>,
    pub events_handled: u64,
    pub decode_errors: u64,
    pub dropped_events: u64,
}

struct Inner {
    container_obj: Option<Ebpf>,
    network_obj: Option<Ebpf>,
    maps: Option<Arc<Mutex<KernelMaps>>>,
    cancel_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Monitor {
    config: Config,
    interfaces: Vec<String>,
    store: Arc<SnapshotStore>,
    resolver: Arc<RuntimeResolver>,
    supervisor: Arc<MemorySupervisor>,
    pump_stats: Arc<PumpStats>,
    state: Mutex<LoaderState>,
    started_at: Mutex<Option<Instant>>,
    inner: tokio::sync::Mutex<Inner>,
}

impl Monitor {
    /// `interfaces` may be empty: tc attachment is then skipped entirely.
    pub fn new(config: Config, interfaces: Vec<String>) -> Arc<Self> {
        let supervisor = Arc::new(MemorySupervisor::new(config.memory_limit_bytes()));
        Arc::new(Self {
            config,
            interfaces,
            store: Arc::new(SnapshotStore::new()),
            resolver: Arc::new(RuntimeResolver::new()),
            supervisor,
            pump_stats: Arc::new(PumpStats::default()),
            state: Mutex::new(LoaderState::Unloaded),
            started_at: Mutex::new(None),
            inner: tokio::sync::Mutex::new(Inner {
                container_obj: None,
                network_obj: None,
                maps: None,
                cancel_tx: None,
                tasks: Vec::new(),
            }),
        })
    }

    pub fn store(&self) -> Arc<SnapshotStore> {
        self.store.clone()
    }

    pub fn supervisor(&self) -> Arc<MemorySupervisor> {
        self.supervisor.clone()
    }

    pub fn state(&self) -> LoaderState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoaderState::Running
    }

    pub fn uptime(&self) -> Duration {
        self.started_at
            .lock()
            .expect("state lock poisoned")
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    pub async fn status(&self) -> MonitorStatus {
        use std::sync::atomic::Ordering;
        let inner = self.inner.lock().await;
        let (map_count, dropped) = match &inner.maps {
            Some(maps) => {
                let maps = maps.lock().expect("kernel maps lock poisoned");
                let dropped = maps.lifecycle_counter(counter::EVENTS_DROPPED)
                    + maps.network_counter(counter::NET_EVENTS_DROPPED);
                (maps.map_count(), dropped)
            }
            None => (0, 0),
        };
        MonitorStatus {
            state: self.state(),
            map_count,
            map_capacities: map_capacities(),
            events_handled: self.pump_stats.events_handled.load(Ordering::Relaxed),
            decode_errors: self.pump_stats.decode_errors.load(Ordering::Relaxed),
            dropped_events: dropped,
        }
    }

    /// Load, attach and start supervision. Erroring while already running
    /// leaves the running instance untouched.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let state = self.state.lock().expect("state lock poisoned");
            if *state != LoaderState::Unloaded {
                return Err(AgentError::AlreadyRunning);
            }
        }

        bump_memlock_rlimit()?;
        run_preflight_checks();

        let mut inner = self.inner.lock().await;

        let mut container_obj = load_object(
            "container_trace",
            aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/container_trace")),
        )?;
        let mut network_obj = load_object(
            "network_monitor",
            aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/network_monitor")),
        )?;
        self.set_state(LoaderState::Loaded);

        for obj in [&mut container_obj, &mut network_obj] {
            if let Err(e) = EbpfLogger::init(obj) {
                debug!("eBPF logger unavailable: {}", e);
            }
        }

        if let Err(e) = self.attach_all(&mut container_obj, &mut network_obj) {
            // Unwind: dropping the objects detaches whatever got attached.
            drop(container_obj);
            drop(network_obj);
            self.set_state(LoaderState::Unloaded);
            return Err(e);
        }
        self.set_state(LoaderState::Attached);

        let map_count = container_obj.maps().count() + network_obj.maps().count();
        let handles = (|| {
            let events_ring = take_ring(&mut container_obj, "EVENTS")?;
            let network_ring = take_ring(&mut network_obj, "NETWORK_EVENTS")?;
            let maps = KernelMaps::take(&mut container_obj, &mut network_obj, map_count)?;
            Ok::<_, AgentError>((events_ring, network_ring, maps))
        })();
        let (events_ring, network_ring, maps) = match handles {
            Ok(handles) => handles,
            Err(e) => {
                drop(container_obj);
                drop(network_obj);
                self.set_state(LoaderState::Unloaded);
                return Err(e);
            }
        };
        let maps = Arc::new(Mutex::new(maps));

        let aggregator = Arc::new(Aggregator::new(
            self.store.clone(),
            self.resolver.clone(),
            self.supervisor.clone(),
            self.config.monitoring.alert_thresholds.clone(),
            self.config.system.max_containers as usize,
        ));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let pump = EventPump::new(
            aggregator.clone(),
            self.supervisor.clone(),
            self.pump_stats.clone(),
        );
        tasks.push(tokio::spawn(pump.run(
            events_ring,
            "lifecycle events",
            cancel_rx.clone(),
        )));

        let pump = EventPump::new(
            aggregator.clone(),
            self.supervisor.clone(),
            self.pump_stats.clone(),
        );
        tasks.push(tokio::spawn(pump.run(
            network_ring,
            "network events",
            cancel_rx.clone(),
        )));

        tasks.push(tokio::spawn(aggregator.clone().run(
            maps.clone(),
            self.config.sampling_rate(),
            cancel_rx.clone(),
        )));

        let reaper = Reaper::new(aggregator, maps.clone(), self.supervisor.clone());
        tasks.push(tokio::spawn(reaper.run(cancel_rx.clone())));

        tasks.push(tokio::spawn(supervise_memory(
            self.supervisor.clone(),
            cancel_rx,
        )));

        inner.container_obj = Some(container_obj);
        inner.network_obj = Some(network_obj);
        inner.maps = Some(maps);
        inner.cancel_tx = Some(cancel_tx);
        inner.tasks = tasks;

        *self.started_at.lock().expect("state lock poisoned") = Some(Instant::now());
        self.set_state(LoaderState::Running);
        info!("monitor running");

        Ok(())
    }

    /// Cooperative shutdown. Stopping an already-stopped monitor succeeds.
    pub async fn stop(&self) -> Result<()> {
        {
            let state = self.state.lock().expect("state lock poisoned");
            if *state != LoaderState::Running {
                return Ok(());
            }
        }
        self.set_state(LoaderState::Stopping);

        let mut inner = self.inner.lock().await;
        if let Some(cancel_tx) = inner.cancel_tx.take() {
            let _ = cancel_tx.send(true);
        }

        for task in inner.tasks.drain(..) {
            let abort = task.abort_handle();
            if timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("task did not stop within {:?}, aborting", SHUTDOWN_GRACE);
                abort.abort();
            }
        }

        // Teardown in reverse: shared maps first, then the objects, which
        // detaches every program and releases every map.
        inner.maps = None;
        inner.network_obj = None;
        inner.container_obj = None;

        *self.started_at.lock().expect("state lock poisoned") = None;
        self.set_state(LoaderState::Unloaded);
        info!("monitor stopped, all probes detached");
        Ok(())
    }

    fn set_state(&self, next: LoaderState) {
        *self.state.lock().expect("state lock poisoned") = next;
    }

    fn attach_all(&self, container_obj: &mut Ebpf, network_obj: &mut Ebpf) -> Result<()> {
        // Lifecycle tracepoints carry the container table; losing any of
        // them leaves the agent blind, so they are fatal.
        attach_tracepoint(container_obj, "trace_container_start", "syscalls", "sys_enter_clone")?;
        attach_tracepoint(container_obj, "trace_container_stop", "syscalls", "sys_enter_exit")?;
        attach_tracepoint(container_obj, "trace_process_exec", "sched", "sched_process_exec")?;

        attach_kprobe_optional(container_obj, "cgroup_attach", "cgroup_attach_task");
        attach_kprobe_optional(network_obj, "tcp_retransmit", "tcp_retransmit_skb");

        if let Err(e) = attach_tracepoint(network_obj, "tcp_probe", "tcp", "tcp_probe") {
            warn!("{}; latency will be unavailable but flows still accumulate", e);
        }

        if self.interfaces.is_empty() {
            info!("no network interface configured; tc programs not attached");
        } else {
            self.attach_tc(network_obj);
        }

        Ok(())
    }

    fn attach_tc(&self, network_obj: &mut Ebpf) {
        for iface in &self.interfaces {
            if let Err(e) = tc::qdisc_add_clsact(iface) {
                debug!("clsact qdisc on {}: {} (may already exist)", iface, e);
            }
        }

        for (program, direction) in [
            ("tc_ingress", TcAttachType::Ingress),
            ("tc_egress", TcAttachType::Egress),
        ] {
            let classifier: &mut SchedClassifier = match network_obj
                .program_mut(program)
                .and_then(|p| p.try_into().ok())
            {
                Some(classifier) => classifier,
                None => {
                    warn!("{} program not found in eBPF object", program);
                    continue;
                }
            };
            if let Err(e) = classifier.load() {
                warn!("failed to load {}: {}", program, e);
                continue;
            }
            for iface in &self.interfaces {
                match classifier.attach(iface, direction) {
                    Ok(_) => info!("attached {} to {}", program, iface),
                    Err(e) => warn!("failed to attach {} to {}: {}", program, iface, e),
                }
            }
        }
    }
}

async fn supervise_memory(supervisor: Arc<MemorySupervisor>, mut cancel: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(SUPERVISOR_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            _ = interval.tick() => {
                supervisor.enforce();
            }
        }
    }
}

fn load_object(name: &str, bytes: &[u8]) -> Result<Ebpf> {
    Ebpf::load(bytes).map_err(|e| {
        let euid = unsafe { libc::geteuid() };
        if euid != 0 {
            AgentError::Permission(format!("loading {} failed with euid {}", name, euid))
        } else {
            AgentError::ProbeLoad(format!("{}: {}", name, e))
        }
    })
}

fn take_ring(obj: &mut Ebpf, name: &str) -> Result<RingBuf<aya::maps::MapData>> {
    let map = obj
        .take_map(name)
        .ok_or_else(|| AgentError::MapAccess(format!("{} map not found", name)))?;
    RingBuf::try_from(map).map_err(|e| AgentError::MapAccess(format!("{}: {}", name, e)))
}

fn attach_tracepoint(obj: &mut Ebpf, program: &str, category: &str, name: &str) -> Result<()> {
    let hook = format!("{}/{}", category, name);
    let tracepoint: &mut TracePoint = obj
        .program_mut(program)
        .ok_or_else(|| AgentError::ProbeAttach {
            hook: hook.clone(),
            reason: format!("{} program not found", program),
        })?
        .try_into()
        .map_err(|e: aya::programs::ProgramError| AgentError::ProbeAttach {
            hook: hook.clone(),
            reason: e.to_string(),
        })?;
    tracepoint.load().map_err(|e| AgentError::ProbeAttach {
        hook: hook.clone(),
        reason: e.to_string(),
    })?;
    tracepoint
        .attach(category, name)
        .map_err(|e| AgentError::ProbeAttach {
            hook: hook.clone(),
            reason: e.to_string(),
        })?;
    debug!("attached tracepoint {}", hook);
    Ok(())
}

fn attach_kprobe_optional(obj: &mut Ebpf, program: &str, symbol: &str) {
    let result = (|| -> Result<()> {
        let kprobe: &mut KProbe = obj
            .program_mut(program)
            .ok_or_else(|| AgentError::ProbeAttach {
                hook: symbol.to_string(),
                reason: format!("{} program not found", program),
            })?
            .try_into()
            .map_err(|e: aya::programs::ProgramError| AgentError::ProbeAttach {
                hook: symbol.to_string(),
                reason: e.to_string(),
            })?;
        kprobe.load().map_err(|e| AgentError::ProbeAttach {
            hook: symbol.to_string(),
            reason: e.to_string(),
        })?;
        kprobe.attach(symbol, 0).map_err(|e| AgentError::ProbeAttach {
            hook: symbol.to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    })();

    match result {
        Ok(()) => debug!("attached kprobe {}", symbol),
        Err(e) => warn!("{}; the related metrics degrade", e),
    }
}

/// Raise the locked-memory limit so map creation cannot fail with EPERM on
/// kernels that still account bpf maps against RLIMIT_MEMLOCK.
fn bump_memlock_rlimit() -> Result<()> {
    let limit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) };
    if ret != 0 {
        return Err(AgentError::Permission(
            "cannot raise RLIMIT_MEMLOCK".to_string(),
        ));
    }
    Ok(())
}

fn run_preflight_checks() {
    match kernel_release() {
        Some((major, minor)) if major > 5 || (major == 5 && minor >= 8) => {
            debug!("kernel {}.{} supported", major, minor);
        }
        Some((major, minor)) => {
            warn!("kernel {}.{} is older than 5.8; probe loading may fail", major, minor);
        }
        None => warn!("cannot determine kernel version"),
    }

    if !Path::new("/sys/kernel/btf/vmlinux").exists() {
        warn!("BTF not found at /sys/kernel/btf/vmlinux; CO-RE relocations may fail");
    }

    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        warn!(
            "not running as root (euid={}); CAP_BPF and CAP_NET_ADMIN are required",
            euid
        );
    }
}

fn kernel_release() -> Option<(u32, u32)> {
    let release = fs::read_to_string("/proc/sys/kernel/osrelease").ok()?;
    let mut parts = release.trim().split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor_raw = parts.next()?;
    let minor: u32 = minor_raw
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()?;
    Some((major, minor))
}

/// Discover interfaces worth monitoring: the default-route interface plus
/// the first container bridge found.
pub fn discover_interfaces() -> Vec<String> {
    let mut interfaces = Vec::new();

    if let Some(primary) = default_route_interface() {
        info!("discovered primary interface: {}", primary);
        interfaces.push(primary);
    }

    for bridge in ["cni0", "docker0", "cbr0"] {
        if interface_exists(bridge) {
            info!("discovered container bridge: {}", bridge);
            interfaces.push(bridge.to_string());
            break;
        }
    }

    if let Some(docker_bridge) = find_docker_bridge() {
        if !interfaces.contains(&docker_bridge) {
            info!("discovered Docker bridge: {}", docker_bridge);
            interfaces.push(docker_bridge);
        }
    }

    interfaces
}

fn interface_exists(name: &str) -> bool {
    Path::new(&format!("/sys/class/net/{}", name)).exists()
}

/// Interface holding the default route, from /proc/net/route.
fn default_route_interface() -> Option<String> {
    let route_content = fs::read_to_string("/proc/net/route").ok()?;
    for line in route_content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 2 && fields[1] == "00000000" && fields[0] != "lo" {
            return Some(fields[0].to_string());
        }
    }
    None
}

/// Docker-created bridges follow the br-* pattern.
fn find_docker_bridge() -> Option<String> {
    let entries = fs::read_dir("/sys/class/net").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("br-") {
            return Some(name);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_when_not_running_is_a_successful_noop() {
        let monitor = Monitor::new(Config::default(), Vec::new());
        assert_eq!(monitor.state(), LoaderState::Unloaded);
        monitor.stop().await.expect("stop on stopped monitor is Ok");
        assert_eq!(monitor.state(), LoaderState::Unloaded);
        // Idempotent: a second stop also succeeds.
        monitor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn status_reports_capacities_before_start() {
        let monitor = Monitor::new(Config::default(), Vec::new());
        let status = monitor.status().await;
        assert_eq!(status.state, LoaderState::Unloaded);
        assert_eq!(status.map_count, 0);
        assert!(status
            .map_capacities
            .iter()
            .any(|(name, cap)| *name == "FLOW_TABLE" && *cap == 10_240));
    }

    #[test]
    fn state_names_render_lowercase() {
        assert_eq!(LoaderState::Running.to_string(), "running");
        assert_eq!(LoaderState::Unloaded.to_string(), "unloaded");
    }

    #[test]
    fn uptime_is_zero_before_start() {
        let monitor = Monitor::new(Config::default(), Vec::new());
        assert_eq!(monitor.uptime(), Duration::ZERO);
    }
}
