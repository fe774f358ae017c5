use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("failed to load eBPF object: {0}")]
    ProbeLoad(String),

    #[error("failed to attach {hook}: {reason}")]
    ProbeAttach { hook: String, reason: String },

    #[error("kernel map access failed: {0}")]
    MapAccess(String),

    #[error("undecodable ring buffer record: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("insufficient privileges: {0}. Run as root or grant CAP_BPF and CAP_NET_ADMIN")]
    Permission(String),

    #[error("memory budget exceeded: {used} of {cap} bytes in use after sweep")]
    BudgetExceeded { used: u64, cap: u64 },

    #[error("monitor is already running")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Rate limiter for task-level error logging: one message per unique kind
/// per minute, so a wedged map or a flood of bad records cannot storm the log.
pub struct LogThrottle {
    interval: Duration,
    last: Mutex<HashMap<&'static str, Instant>>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_minute() -> Self {
        Self::new(Duration::from_secs(60))
    }

    /// Returns true when a message of this kind may be logged now.
    pub fn allow(&self, kind: &'static str) -> bool {
        let mut last = self.last.lock().expect("throttle lock poisoned");
        let now = Instant::now();
        match last.get(kind) {
            Some(at) if now.duration_since(*at) < self.interval => false,
            _ => {
                last.insert(kind, now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_allows_first_and_blocks_repeat() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        assert!(throttle.allow("decode"));
        assert!(!throttle.allow("decode"));
        // A different kind has its own window.
        assert!(throttle.allow("map_access"));
    }

    #[test]
    fn throttle_reopens_after_interval() {
        let throttle = LogThrottle::new(Duration::from_millis(0));
        assert!(throttle.allow("decode"));
        assert!(throttle.allow("decode"));
    }

    #[test]
    fn error_messages_name_the_hook() {
        let err = AgentError::ProbeAttach {
            hook: "tcp/tcp_probe".to_string(),
            reason: "tracepoint not found".to_string(),
        };
        assert!(err.to_string().contains("tcp/tcp_probe"));
    }

    #[test]
    fn permission_error_is_actionable() {
        let err = AgentError::Permission("EPERM loading container_trace".to_string());
        let msg = err.to_string();
        assert!(msg.contains("CAP_BPF"));
        assert!(msg.contains("root"));
    }
}
