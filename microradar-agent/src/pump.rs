//! Ring buffer event pump.
//!
//! One pump task per ring buffer polls on a fixed tick, decodes fixed-size
//! records into a closed event type and hands them to the aggregator.
//! Under sustained overflow the kernel side drops and its drop counter
//! rises; the pump never retries and never blocks mid-record on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aya::maps::{MapData, RingBuf};
use log::{debug, warn};
use tokio::sync::watch;

use microradar_common::{event_kind, ContainerInfo, EventData, FlowStats};

use crate::aggregator::Aggregator;
use crate::error::{AgentError, LogThrottle, Result};
use crate::memory::MemorySupervisor;

/// Records consumed per buffer per tick before yielding to the next tick.
pub const TICK_BUDGET: usize = 256;

/// Default pump tick.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Decoded kernel event. Exactly one handler per variant; dispatch is
/// exhaustive at the type level.
#[derive(Debug, Clone, Copy)]
pub enum Event {
    ContainerStart(ContainerInfo),
    ContainerStop(ContainerInfo),
    NetworkPacket { cgroup_id: u64, stats: FlowStats },
    CpuSample { cgroup_id: u64, millipercent: u64 },
    MemorySample { cgroup_id: u64, bytes: u64 },
}

impl Event {
    /// Decode a raw ring buffer record. The record must be exactly one
    /// `EventData` and carry a known tag.
    pub fn decode(bytes: &[u8]) -> Result<Event> {
        let expected = std::mem::size_of::<EventData>();
        if bytes.len() != expected {
            return Err(AgentError::Decode(format!(
                "record is {} bytes, expected {}",
                bytes.len(),
                expected
            )));
        }

        let raw: EventData = unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const EventData) };

        // The tag names the active union variant.
        let event = match raw.kind {
            event_kind::CONTAINER_START => Event::ContainerStart(unsafe { raw.payload.container }),
            event_kind::CONTAINER_STOP => Event::ContainerStop(unsafe { raw.payload.container }),
            event_kind::NETWORK_PACKET => Event::NetworkPacket {
                cgroup_id: raw.cgroup_id,
                stats: unsafe { raw.payload.flow },
            },
            event_kind::CPU_SAMPLE => Event::CpuSample {
                cgroup_id: raw.cgroup_id,
                millipercent: unsafe { raw.payload.value },
            },
            event_kind::MEMORY_SAMPLE => Event::MemorySample {
                cgroup_id: raw.cgroup_id,
                bytes: unsafe { raw.payload.value },
            },
            other => {
                return Err(AgentError::Decode(format!("unknown event tag {}", other)));
            }
        };

        Ok(event)
    }
}

/// Shared pump counters for the status inspector.
#[derive(Default)]
pub struct PumpStats {
    pub events_handled: AtomicU64,
    pub decode_errors: AtomicU64,
}

pub struct EventPump {
    aggregator: Arc<Aggregator>,
    supervisor: Arc<MemorySupervisor>,
    stats: Arc<PumpStats>,
    throttle: LogThrottle,
    tick: Duration,
    budget: usize,
}

impl EventPump {
    pub fn new(
        aggregator: Arc<Aggregator>,
        supervisor: Arc<MemorySupervisor>,
        stats: Arc<PumpStats>,
    ) -> Self {
        Self {
            aggregator,
            supervisor,
            stats,
            throttle: LogThrottle::per_minute(),
            tick: TICK_INTERVAL,
            budget: TICK_BUDGET,
        }
    }

    /// Drain `ring` until cancelled. Cancellation is observed between
    /// records, never mid-record.
    pub async fn run(
        self,
        mut ring: RingBuf<MapData>,
        label: &'static str,
        mut cancel: watch::Receiver<bool>,
    ) {
        debug!("event pump for {} started", label);
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Separate handle for mid-drain checks; `cancel` itself is parked
        // in the select.
        let probe = cancel.clone();

        loop {
            tokio::select! {
                // The signal only ever flips to true.
                _ = cancel.changed() => break,
                _ = interval.tick() => {
                    self.drain_tick(&mut ring, &probe);
                }
            }
        }
        debug!("event pump for {} stopped", label);
    }

    fn drain_tick(&self, ring: &mut RingBuf<MapData>, cancel: &watch::Receiver<bool>) {
        let mut batch = self.supervisor.pools.event_batches.get();
        batch.clear();

        let mut consumed = 0;
        while consumed < self.budget {
            if *cancel.borrow() {
                break;
            }
            let item = match ring.next() {
                Some(item) => item,
                // Drained; the next tick resumes where we left off.
                None => break,
            };
            consumed += 1;

            match Event::decode(&item) {
                Ok(event) => batch.push(event),
                Err(e) => {
                    // A single bad record is dropped; the pump continues.
                    self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    if self.throttle.allow("decode") {
                        warn!("dropping undecodable ring buffer record: {}", e);
                    }
                }
            }
        }

        for event in batch.drain(..) {
            self.aggregator.handle_event(event);
            self.stats.events_handled.fetch_add(1, Ordering::Relaxed);
        }

        self.supervisor.pools.event_batches.put(batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_bytes(event: &EventData) -> Vec<u8> {
        unsafe {
            std::slice::from_raw_parts(
                (event as *const EventData) as *const u8,
                std::mem::size_of::<EventData>(),
            )
        }
        .to_vec()
    }

    fn blank_event(kind: u32, cgroup_id: u64) -> EventData {
        let mut event: EventData = unsafe { std::mem::zeroed() };
        event.kind = kind;
        event.cgroup_id = cgroup_id;
        event
    }

    #[test]
    fn decodes_container_start() {
        let mut raw = blank_event(event_kind::CONTAINER_START, 0xABCDEF00);
        let mut info: ContainerInfo = unsafe { std::mem::zeroed() };
        info.cgroup_id = 0xABCDEF00;
        info.pid = 4321;
        raw.payload.container = info;

        match Event::decode(&raw_bytes(&raw)).unwrap() {
            Event::ContainerStart(decoded) => {
                assert_eq!(decoded.cgroup_id, 0xABCDEF00);
                assert_eq!(decoded.pid, 4321);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn decodes_scalar_samples() {
        let mut raw = blank_event(event_kind::CPU_SAMPLE, 7);
        raw.payload.value = 325;
        match Event::decode(&raw_bytes(&raw)).unwrap() {
            Event::CpuSample {
                cgroup_id,
                millipercent,
            } => {
                assert_eq!(cgroup_id, 7);
                assert_eq!(millipercent, 325);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn rejects_short_records() {
        let err = Event::decode(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, AgentError::Decode(_)));
    }

    #[test]
    fn rejects_unknown_tags() {
        let raw = blank_event(42, 1);
        let err = Event::decode(&raw_bytes(&raw)).unwrap_err();
        assert!(matches!(err, AgentError::Decode(_)));
    }
}
