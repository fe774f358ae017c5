//! microradar - lightweight container observability agent
//!
//! Loads eBPF probes that watch container lifecycle syscalls and per-flow
//! network traffic, aggregates the event stream into per-container metrics,
//! and serves them through a terminal dashboard and a Prometheus endpoint.
//!
//! Linux only: probe loading, tc attachment and the procfs scans all assume
//! a Linux kernel (5.8+ with BTF recommended).

pub mod aggregator;
pub mod alerts;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod http;
pub mod loader;
pub mod maps;
pub mod memory;
pub mod process;
pub mod prometheus;
pub mod pump;
pub mod reaper;
pub mod runtime;
pub mod snapshot;

pub use error::{AgentError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
