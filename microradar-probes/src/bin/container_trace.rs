//! Container lifecycle tracing
//!
//! Watches clone/exit syscalls, cgroup attachment and exec to maintain the
//! kernel container table and emit lifecycle events to userspace.

#![no_std]
#![no_main]
#![feature(core_intrinsics)]

use aya_ebpf::{
    helpers::{bpf_get_current_cgroup_id, bpf_get_current_comm, bpf_ktime_get_ns},
    macros::{kprobe, map, tracepoint},
    maps::{Array, LruHashMap, RingBuf},
    programs::{ProbeContext, TracePointContext},
    EbpfContext,
};
use aya_log_ebpf::debug;
use microradar_common::{
    counter, event_kind, is_container_cgroup, status, ContainerInfo, EventData, COUNTER_SLOTS,
    EVENTS_RING_BYTES, MAX_CONTAINERS, MAX_PID_MAPPINGS,
};

// GPL is required for the kprobe and probe-read helpers.
#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";

#[map]
static CONTAINER_TABLE: LruHashMap<u64, ContainerInfo> =
    LruHashMap::with_max_entries(MAX_CONTAINERS, 0);

#[map]
static PID_TO_CGROUP: LruHashMap<u32, u64> = LruHashMap::with_max_entries(MAX_PID_MAPPINGS, 0);

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(EVENTS_RING_BYTES, 0);

#[map]
static COUNTERS: Array<u64> = Array::with_max_entries(COUNTER_SLOTS, 0);

/// Lock-free counter update. `core::sync::atomic` is unavailable on the bpf
/// target; the intrinsic lowers to a BPF_ATOMIC fetch-and-add.
#[inline(always)]
fn atomic_add_u64(slot: *mut u64, delta: u64) {
    unsafe {
        core::intrinsics::atomic_xadd_relaxed(slot, delta);
    }
}

#[inline]
fn bump_counter(index: u32, delta: u64) {
    if let Some(slot) = COUNTERS.get_ptr_mut(index) {
        atomic_add_u64(slot, delta);
    }
}

/// Reserve a fixed-size slot and submit; drops are counted, never retried.
#[inline]
fn push_event(event: &EventData) {
    match EVENTS.reserve::<EventData>(0) {
        Some(mut entry) => {
            entry.write(*event);
            entry.submit(0);
            bump_counter(counter::EVENTS_SENT, 1);
        }
        None => bump_counter(counter::EVENTS_DROPPED, 1),
    }
}

/// Render the cgroup id as 16 lowercase hex chars into the id buffer.
/// Userspace replaces this with the runtime-reported id when one resolves.
#[inline]
fn render_hex_id(cgroup_id: u64, out: &mut [u8; 64]) {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut v = cgroup_id;
    let mut i = 16usize;
    while i > 0 {
        i -= 1;
        out[i] = DIGITS[(v & 0xf) as usize];
        v >>= 4;
    }
}

#[inline]
fn lifecycle_event(kind: u32, cgroup_id: u64, pid: u32, info: &ContainerInfo) -> EventData {
    let mut event: EventData = unsafe { core::mem::zeroed() };
    event.kind = kind;
    event.pid = pid;
    event.timestamp_ns = unsafe { bpf_ktime_get_ns() };
    event.cgroup_id = cgroup_id;
    event.payload.container = *info;
    event
}

#[tracepoint]
pub fn trace_container_start(ctx: TracePointContext) -> u32 {
    match try_container_start(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_container_start(ctx: &TracePointContext) -> Result<u32, i64> {
    let cgroup_id = unsafe { bpf_get_current_cgroup_id() };
    if !is_container_cgroup(cgroup_id) {
        return Ok(0);
    }

    let pid = ctx.pid();
    PID_TO_CGROUP.insert(&pid, &cgroup_id, 0)?;

    // Racing creators are harmless: counters are additive and the last
    // writer of the scalar state wins.
    if unsafe { CONTAINER_TABLE.get(&cgroup_id) }.is_some() {
        return Ok(0);
    }

    let mut info: ContainerInfo = unsafe { core::mem::zeroed() };
    info.cgroup_id = cgroup_id;
    info.pid = pid;
    info.ppid = pid;
    info.start_time_ns = unsafe { bpf_ktime_get_ns() };
    info.status = status::CREATED;
    if let Ok(comm) = bpf_get_current_comm() {
        info.comm = comm;
    }
    render_hex_id(cgroup_id, &mut info.container_id);

    CONTAINER_TABLE.insert(&cgroup_id, &info, 0)?;
    debug!(ctx, "new container: cgroup_id={} pid={}", cgroup_id, pid);

    push_event(&lifecycle_event(event_kind::CONTAINER_START, cgroup_id, pid, &info));
    bump_counter(counter::CONTAINERS_CREATED, 1);

    Ok(0)
}

#[tracepoint]
pub fn trace_container_stop(ctx: TracePointContext) -> u32 {
    match try_container_stop(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_container_stop(ctx: &TracePointContext) -> Result<u32, i64> {
    let cgroup_id = unsafe { bpf_get_current_cgroup_id() };
    if !is_container_cgroup(cgroup_id) {
        return Ok(0);
    }

    let pid = ctx.pid();

    let info = match CONTAINER_TABLE.get_ptr_mut(&cgroup_id) {
        Some(ptr) => ptr,
        None => return Ok(0),
    };

    // Only the primary pid exiting stops the container.
    if unsafe { (*info).pid } != pid {
        return Ok(0);
    }

    unsafe { (*info).status = status::STOPPED };

    let snapshot = unsafe { *info };
    push_event(&lifecycle_event(event_kind::CONTAINER_STOP, cgroup_id, pid, &snapshot));
    bump_counter(counter::CONTAINERS_STOPPED, 1);

    let _ = CONTAINER_TABLE.remove(&cgroup_id);
    let _ = PID_TO_CGROUP.remove(&pid);

    Ok(0)
}

#[kprobe]
pub fn cgroup_attach(ctx: ProbeContext) -> u32 {
    match try_cgroup_attach(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_cgroup_attach(ctx: &ProbeContext) -> Result<u32, i64> {
    let cgroup_id = unsafe { bpf_get_current_cgroup_id() };
    if !is_container_cgroup(cgroup_id) {
        return Ok(0);
    }

    let pid = ctx.pid();
    PID_TO_CGROUP.insert(&pid, &cgroup_id, 0)?;

    if let Some(info) = CONTAINER_TABLE.get_ptr_mut(&cgroup_id) {
        if unsafe { (*info).status } == status::CREATED {
            unsafe { (*info).status = status::RUNNING };
            let snapshot = unsafe { *info };
            push_event(&lifecycle_event(event_kind::CONTAINER_START, cgroup_id, pid, &snapshot));
        }
    }

    Ok(0)
}

#[tracepoint]
pub fn trace_process_exec(ctx: TracePointContext) -> u32 {
    match try_process_exec(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_process_exec(_ctx: &TracePointContext) -> Result<u32, i64> {
    let cgroup_id = unsafe { bpf_get_current_cgroup_id() };
    if !is_container_cgroup(cgroup_id) {
        return Ok(0);
    }

    if let Some(info) = CONTAINER_TABLE.get_ptr_mut(&cgroup_id) {
        if let Ok(comm) = bpf_get_current_comm() {
            unsafe { (*info).comm = comm };
        }
        if unsafe { (*info).status } == status::CREATED {
            unsafe { (*info).status = status::RUNNING };
        }
    }

    Ok(0)
}

#[cfg(not(test))]
#[cfg(target_arch = "bpf")]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
