//! Per-flow network telemetry
//!
//! tc classifiers count packets and bytes per (5-tuple, cgroup id) key and
//! stamp egress timestamps for RTT pairing. A kprobe on tcp_retransmit_skb
//! and the tcp_probe tracepoint complete the latency/retransmit picture.
//!
//! IPv4 only; IPv6 parsing is future work and such packets pass untouched.

#![no_std]
#![no_main]
#![feature(core_intrinsics)]

use aya_ebpf::{
    bindings::TC_ACT_OK,
    helpers::{bpf_get_current_cgroup_id, bpf_ktime_get_ns, bpf_probe_read_kernel},
    macros::{classifier, kprobe, map, tracepoint},
    maps::{Array, LruHashMap, RingBuf},
    programs::{ProbeContext, TcContext, TracePointContext},
    EbpfContext,
};
use microradar_common::{
    counter, event_kind, flow_flags, is_container_cgroup, EventData, FlowKey, FlowStats,
    COUNTER_SLOTS, IPPROTO_TCP, IPPROTO_UDP, MAX_NETWORK_FLOWS, NETWORK_EVENTS_RING_BYTES,
};

// GPL is required for the kprobe and probe-read helpers.
#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";

#[map]
static FLOW_TABLE: LruHashMap<FlowKey, FlowStats> =
    LruHashMap::with_max_entries(MAX_NETWORK_FLOWS, 0);

#[map]
static LATENCY_PENDING: LruHashMap<FlowKey, u64> =
    LruHashMap::with_max_entries(MAX_NETWORK_FLOWS, 0);

#[map]
static NETWORK_EVENTS: RingBuf = RingBuf::with_byte_size(NETWORK_EVENTS_RING_BYTES, 0);

#[map]
static COUNTERS: Array<u64> = Array::with_max_entries(COUNTER_SLOTS, 0);

const ETH_P_IP: u16 = 0x0800;
const ETH_HDR_LEN: usize = 14;
const AF_INET: u16 = 2;

// struct sock_common field offsets (stable since well before 5.8).
const SKC_DADDR: usize = 0;
const SKC_RCV_SADDR: usize = 4;
const SKC_DPORT: usize = 12;
const SKC_NUM: usize = 14;

// tcp:tcp_probe format: 8-byte common header, then two sockaddr_in6-sized
// address blocks. Within a sockaddr_in: family @0, port @2, addr @4.
const TP_SADDR: usize = 8;
const TP_DADDR: usize = 36;

/// Lock-free counter updates. `core::sync::atomic` is unavailable on the
/// bpf target; the intrinsics lower to BPF_ATOMIC fetch-and-add.
#[inline(always)]
fn atomic_add_u64(field: *mut u64, delta: u64) {
    unsafe {
        core::intrinsics::atomic_xadd_relaxed(field, delta);
    }
}

#[inline(always)]
fn atomic_add_u32(field: *mut u32, delta: u32) {
    unsafe {
        core::intrinsics::atomic_xadd_relaxed(field, delta);
    }
}

#[inline]
fn bump_counter(index: u32, delta: u64) {
    if let Some(slot) = COUNTERS.get_ptr_mut(index) {
        atomic_add_u64(slot, delta);
    }
}

/// Parse Ethernet + IPv4 and fill the 5-tuple. Every load is bounds-checked
/// against the packet end by TcContext::load. Returns the IP total length.
#[inline]
fn parse_packet(ctx: &TcContext, key: &mut FlowKey) -> Result<u32, ()> {
    let eth_proto: u16 = ctx.load(12).map_err(|_| ())?;
    if u16::from_be(eth_proto) != ETH_P_IP {
        return Err(());
    }

    let version_ihl: u8 = ctx.load(ETH_HDR_LEN).map_err(|_| ())?;
    if version_ihl >> 4 != 4 {
        return Err(());
    }
    let ihl = ((version_ihl & 0x0f) as usize) * 4;
    if ihl < 20 {
        return Err(());
    }

    let protocol: u8 = ctx.load(ETH_HDR_LEN + 9).map_err(|_| ())?;
    if protocol != IPPROTO_TCP && protocol != IPPROTO_UDP {
        return Err(());
    }

    let tot_len: u16 = ctx.load(ETH_HDR_LEN + 2).map_err(|_| ())?;
    // Addresses and ports are kept in network byte order end to end.
    key.src_ip = ctx.load(ETH_HDR_LEN + 12).map_err(|_| ())?;
    key.dst_ip = ctx.load(ETH_HDR_LEN + 16).map_err(|_| ())?;

    let l4_offset = ETH_HDR_LEN + ihl;
    key.src_port = ctx.load(l4_offset).map_err(|_| ())?;
    key.dst_port = ctx.load(l4_offset + 2).map_err(|_| ())?;
    key.protocol = protocol;

    Ok(u16::from_be(tot_len) as u32)
}

/// Upsert-and-count for one observed packet. Creation races are harmless:
/// counters are additive and the last writer of scalar state wins.
#[inline]
fn record_packet(key: &FlowKey, packet_size: u32, direction_flag: u32, now: u64) {
    if unsafe { FLOW_TABLE.get(key) }.is_none() {
        let mut fresh: FlowStats = unsafe { core::mem::zeroed() };
        fresh.last_seen_ns = now;
        fresh.flags = direction_flag;
        let _ = FLOW_TABLE.insert(key, &fresh, 0);
    }

    if let Some(stats) = FLOW_TABLE.get_ptr_mut(key) {
        unsafe {
            atomic_add_u64(&mut (*stats).packets, 1);
            atomic_add_u64(&mut (*stats).bytes, packet_size as u64);
            (*stats).last_seen_ns = now;
            (*stats).flags |= direction_flag;
        }
    }
}

#[classifier]
pub fn tc_ingress(ctx: TcContext) -> i32 {
    match try_tc(&ctx, flow_flags::INBOUND) {
        Ok(ret) => ret,
        Err(_) => TC_ACT_OK,
    }
}

#[classifier]
pub fn tc_egress(ctx: TcContext) -> i32 {
    match try_tc(&ctx, flow_flags::OUTBOUND) {
        Ok(ret) => ret,
        Err(_) => TC_ACT_OK,
    }
}

fn try_tc(ctx: &TcContext, direction_flag: u32) -> Result<i32, ()> {
    let mut key: FlowKey = unsafe { core::mem::zeroed() };

    let packet_size = match parse_packet(ctx, &mut key) {
        Ok(size) => size,
        // Non-IPv4 and non-TCP/UDP pass untouched.
        Err(()) => return Ok(TC_ACT_OK),
    };

    key.cgroup_id = unsafe { bpf_get_current_cgroup_id() };
    if !is_container_cgroup(key.cgroup_id) {
        return Ok(TC_ACT_OK);
    }

    let now = unsafe { bpf_ktime_get_ns() };

    if direction_flag == flow_flags::OUTBOUND {
        // Stamp for RTT pairing; tcp_probe consumes and deletes the entry.
        let _ = LATENCY_PENDING.insert(&key, &now, 0);
    }

    record_packet(&key, packet_size, direction_flag, now);

    if direction_flag == flow_flags::INBOUND {
        bump_counter(counter::PACKETS_IN, 1);
        bump_counter(counter::BYTES_IN, packet_size as u64);
    } else {
        bump_counter(counter::PACKETS_OUT, 1);
        bump_counter(counter::BYTES_OUT, packet_size as u64);
    }
    if key.protocol == IPPROTO_UDP {
        bump_counter(counter::UDP_PACKETS, 1);
    }

    Ok(TC_ACT_OK)
}

#[kprobe]
pub fn tcp_retransmit(ctx: ProbeContext) -> u32 {
    match try_tcp_retransmit(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_tcp_retransmit(ctx: &ProbeContext) -> Result<u32, i64> {
    let sk: *const u8 = ctx.arg(0).ok_or(-1i64)?;
    if sk.is_null() {
        return Ok(0);
    }

    let mut key: FlowKey = unsafe { core::mem::zeroed() };
    key.cgroup_id = unsafe { bpf_get_current_cgroup_id() };
    if !is_container_cgroup(key.cgroup_id) {
        return Ok(0);
    }

    // Rebuild the egress-oriented key from sock_common. skc_num is the local
    // port in host order; everything in the key is network order.
    unsafe {
        key.src_ip = bpf_probe_read_kernel(sk.add(SKC_RCV_SADDR) as *const u32)?;
        key.dst_ip = bpf_probe_read_kernel(sk.add(SKC_DADDR) as *const u32)?;
        let local_port: u16 = bpf_probe_read_kernel(sk.add(SKC_NUM) as *const u16)?;
        key.src_port = local_port.to_be();
        key.dst_port = bpf_probe_read_kernel(sk.add(SKC_DPORT) as *const u16)?;
    }
    key.protocol = IPPROTO_TCP;

    let mut stats_snapshot: FlowStats = unsafe { core::mem::zeroed() };
    if let Some(stats) = FLOW_TABLE.get_ptr_mut(&key) {
        unsafe {
            atomic_add_u32(&mut (*stats).tcp_retransmits, 1);
            (*stats).flags |= flow_flags::RETRANSMIT;
            stats_snapshot = *stats;
        }
    }

    bump_counter(counter::TCP_RETRANSMITS, 1);

    match NETWORK_EVENTS.reserve::<EventData>(0) {
        Some(mut entry) => {
            let mut event: EventData = unsafe { core::mem::zeroed() };
            event.kind = event_kind::NETWORK_PACKET;
            event.pid = ctx.pid();
            event.timestamp_ns = unsafe { bpf_ktime_get_ns() };
            event.cgroup_id = key.cgroup_id;
            event.payload.flow = stats_snapshot;
            entry.write(event);
            entry.submit(0);
        }
        None => bump_counter(counter::NET_EVENTS_DROPPED, 1),
    }

    Ok(0)
}

#[tracepoint]
pub fn tcp_probe(ctx: TracePointContext) -> u32 {
    match try_tcp_probe(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_tcp_probe(ctx: &TracePointContext) -> Result<u32, i64> {
    let mut key: FlowKey = unsafe { core::mem::zeroed() };
    key.cgroup_id = unsafe { bpf_get_current_cgroup_id() };
    if !is_container_cgroup(key.cgroup_id) {
        return Ok(0);
    }

    unsafe {
        let family: u16 = ctx.read_at(TP_SADDR)?;
        if family != AF_INET {
            // IPv6 pairing is future work.
            return Ok(0);
        }
        key.src_port = ctx.read_at(TP_SADDR + 2)?;
        key.src_ip = ctx.read_at(TP_SADDR + 4)?;
        key.dst_port = ctx.read_at(TP_DADDR + 2)?;
        key.dst_ip = ctx.read_at(TP_DADDR + 4)?;
    }
    key.protocol = IPPROTO_TCP;

    let sent_at = match unsafe { LATENCY_PENDING.get(&key) } {
        Some(ts) => *ts,
        None => return Ok(0),
    };

    let now = unsafe { bpf_ktime_get_ns() };
    if now > sent_at {
        let rtt = now - sent_at;
        if let Some(stats) = FLOW_TABLE.get_ptr_mut(&key) {
            unsafe {
                atomic_add_u64(&mut (*stats).latency_sum_ns, rtt);
                atomic_add_u32(&mut (*stats).latency_count, 1);
            }
            bump_counter(counter::LATENCY_SAMPLES, 1);
        }
    }

    let _ = LATENCY_PENDING.remove(&key);

    Ok(0)
}

#[cfg(not(test))]
#[cfg(target_arch = "bpf")]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
