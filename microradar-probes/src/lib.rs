//! eBPF probes for microradar
//!
//! Two kernel objects, built for the bpfel-unknown-none target by the
//! agent's build.rs:
//! - `container_trace`: container lifecycle via syscall tracepoints and the
//!   cgroup_attach_task kprobe
//! - `network_monitor`: per-flow traffic, RTT pairing and TCP retransmits
//!   via tc classifiers, a kprobe and the tcp_probe tracepoint
//!
//! Probes key everything by cgroup id so userspace can join flows and
//! lifecycle events to containers.

#![no_std]
#![no_main]

#[cfg(not(test))]
#[cfg(target_arch = "bpf")]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
