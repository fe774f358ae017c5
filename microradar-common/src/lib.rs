//! Shared types between eBPF (kernel) and userspace
//!
//! This crate defines the map value structures and event records that must be:
//! - `#[repr(C)]` for stable memory layout
//! - `no_std` compatible for eBPF
//! - Free of pointers, so they can cross the kernel/user boundary as plain bytes
//!
//! Userspace enables the `user` feature to get `aya::Pod` impls for map access.

#![cfg_attr(not(feature = "user"), no_std)]

/// Map capacities. These bound the static kernel-side memory footprint.
pub const MAX_CONTAINERS: u32 = 1_000;
pub const MAX_PID_MAPPINGS: u32 = 10_000;
pub const MAX_NETWORK_FLOWS: u32 = 10_240;

/// Lifecycle ring buffer: 256 KiB. Network ring buffer is larger because a
/// retransmit storm produces far more records than container churn.
pub const EVENTS_RING_BYTES: u32 = 256 * 1024;
pub const NETWORK_EVENTS_RING_BYTES: u32 = 512 * 1024;

/// Slots in the per-object counter array. The index space is split between
/// the two probe objects so userspace reads disjoint ranges.
pub const COUNTER_SLOTS: u32 = 30;

pub const MAX_COMM_LEN: usize = 16;
pub const MAX_CONTAINER_ID_LEN: usize = 64;

/// Counter indices, lifecycle object (slots 0-9).
pub mod counter {
    pub const CONTAINERS_CREATED: u32 = 0;
    pub const CONTAINERS_STOPPED: u32 = 1;
    pub const EVENTS_SENT: u32 = 2;
    pub const EVENTS_DROPPED: u32 = 3;

    // Network object (slots 10-19).
    pub const PACKETS_IN: u32 = 10;
    pub const PACKETS_OUT: u32 = 11;
    pub const BYTES_IN: u32 = 12;
    pub const BYTES_OUT: u32 = 13;
    pub const TCP_RETRANSMITS: u32 = 14;
    pub const UDP_PACKETS: u32 = 15;
    pub const LATENCY_SAMPLES: u32 = 16;
    pub const NET_EVENTS_DROPPED: u32 = 17;
}

/// Container status values stored in `ContainerInfo::status`.
pub mod status {
    pub const UNKNOWN: u32 = 0;
    pub const CREATED: u32 = 1;
    pub const RUNNING: u32 = 2;
    pub const PAUSED: u32 = 3;
    pub const STOPPED: u32 = 4;
    pub const EXITED: u32 = 5;
}

/// Direction and retransmit bits in `FlowStats::flags`.
pub mod flow_flags {
    pub const INBOUND: u32 = 0x01;
    pub const OUTBOUND: u32 = 0x02;
    pub const RETRANSMIT: u32 = 0x04;
}

/// Event tags carried in `EventData::kind`.
pub mod event_kind {
    pub const CONTAINER_START: u32 = 1;
    pub const CONTAINER_STOP: u32 = 2;
    pub const NETWORK_PACKET: u32 = 3;
    pub const CPU_SAMPLE: u32 = 4;
    pub const MEMORY_SAMPLE: u32 = 5;
}

/// Cgroup ids 0 and 1 denote the root/init cgroup and are never containers.
#[inline]
pub fn is_container_cgroup(cgroup_id: u64) -> bool {
    cgroup_id > 1
}

/// Per-container record in the kernel container table, keyed by cgroup id.
#[repr(C)]
#[derive(Clone, Copy)]
#[cfg_attr(feature = "user", derive(Debug))]
pub struct ContainerInfo {
    pub cgroup_id: u64,
    pub pid: u32,
    pub ppid: u32,
    /// Hex rendering of the cgroup id (16 chars) until a runtime-reported id
    /// is resolved in userspace. NUL padded.
    pub container_id: [u8; MAX_CONTAINER_ID_LEN],
    pub comm: [u8; MAX_COMM_LEN],
    pub start_time_ns: u64,
    /// CPU usage in millipercent (1000 = 100%).
    pub cpu_millipercent: u32,
    pub status: u32,
    pub memory_bytes: u64,
}

/// Flow identity: the 5-tuple plus the owning cgroup id. Addresses and ports
/// stay in network byte order as observed on the wire.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(Debug))]
pub struct FlowKey {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub _pad: [u8; 3],
    pub cgroup_id: u64,
}

/// Per-flow counters. All counter fields are monotonically non-decreasing
/// between LRU evictions; userspace diffs successive reads.
#[repr(C)]
#[derive(Clone, Copy)]
#[cfg_attr(feature = "user", derive(Debug, Default))]
pub struct FlowStats {
    pub packets: u64,
    pub bytes: u64,
    pub latency_sum_ns: u64,
    pub latency_count: u32,
    pub tcp_retransmits: u32,
    pub last_seen_ns: u64,
    pub flags: u32,
    pub _pad: u32,
}

/// Fixed-size payload union. The active variant is named by `EventData::kind`.
#[repr(C)]
#[derive(Clone, Copy)]
pub union EventPayload {
    pub container: ContainerInfo,
    pub flow: FlowStats,
    pub value: u64,
}

/// Ring buffer record. Fixed size so kernel programs can reserve a slot
/// without a secondary allocator.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EventData {
    pub kind: u32,
    pub pid: u32,
    pub timestamp_ns: u64,
    pub cgroup_id: u64,
    pub payload: EventPayload,
}

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

#[cfg(feature = "user")]
mod user {
    use super::*;

    unsafe impl aya::Pod for ContainerInfo {}
    unsafe impl aya::Pod for FlowKey {}
    unsafe impl aya::Pod for FlowStats {}
    unsafe impl aya::Pod for EventData {}

    // Layout must match the kernel objects byte for byte.
    const _: () = {
        assert!(core::mem::size_of::<ContainerInfo>() == 120);
        assert!(core::mem::align_of::<ContainerInfo>() == 8);
        assert!(core::mem::size_of::<FlowKey>() == 24);
        assert!(core::mem::size_of::<FlowStats>() == 48);
        assert!(core::mem::size_of::<EventData>() == 144);
        assert!(core::mem::align_of::<EventData>() == 8);
    };
}

#[cfg(all(test, feature = "user"))]
mod tests {
    use super::*;

    #[test]
    fn root_and_init_cgroups_are_not_containers() {
        assert!(!is_container_cgroup(0));
        assert!(!is_container_cgroup(1));
        assert!(is_container_cgroup(2));
        assert!(is_container_cgroup(0xABCDEF00));
    }

    #[test]
    fn event_payload_is_large_enough_for_every_variant() {
        assert!(core::mem::size_of::<EventPayload>() >= core::mem::size_of::<ContainerInfo>());
        assert!(core::mem::size_of::<EventPayload>() >= core::mem::size_of::<FlowStats>());
    }
}
