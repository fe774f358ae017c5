//! Container kill delegation.
//!
//! The agent never owns the container lifecycle: kills go through the
//! runtime CLI that claims the container (docker, ctr, crictl), with a
//! direct SIGTERM/SIGKILL on the primary pid as the last resort.

use std::process::Command;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{AgentError, Result};
use crate::runtime::RuntimeKind;
use crate::snapshot::ContainerMetrics;

const GRACEFUL_STOP_SECS: &str = "10";

#[derive(Debug, Clone, Copy, Default)]
pub struct KillOptions {
    pub force: bool,
}

pub struct ProcessManager;

impl ProcessManager {
    pub fn new() -> Self {
        Self
    }

    pub fn kill_container(&self, container: &ContainerMetrics, options: KillOptions) -> Result<()> {
        info!(
            "kill requested for container {} (pid {}, force: {})",
            container.container_id, container.pid, options.force
        );

        match self.detect_runtime(&container.container_id) {
            Some(RuntimeKind::Docker) => self.kill_docker(&container.container_id, options),
            Some(RuntimeKind::Containerd) => self.kill_containerd(&container.container_id, options),
            Some(RuntimeKind::Crio) => self.kill_crio(&container.container_id, options),
            None => self.kill_pid(container.pid, options),
        }
    }

    /// Ask each runtime CLI whether it knows this container id.
    fn detect_runtime(&self, container_id: &str) -> Option<RuntimeKind> {
        if cli_succeeds("docker", &["inspect", container_id]) {
            return Some(RuntimeKind::Docker);
        }
        if cli_succeeds("ctr", &["container", "info", container_id]) {
            return Some(RuntimeKind::Containerd);
        }
        if cli_succeeds("crictl", &["inspect", container_id]) {
            return Some(RuntimeKind::Crio);
        }
        None
    }

    fn kill_docker(&self, container_id: &str, options: KillOptions) -> Result<()> {
        if !options.force && cli_succeeds("docker", &["stop", "--time", GRACEFUL_STOP_SECS, container_id]) {
            return Ok(());
        }
        run_cli("docker", &["kill", container_id])
    }

    fn kill_containerd(&self, container_id: &str, options: KillOptions) -> Result<()> {
        if !options.force
            && cli_succeeds("ctr", &["task", "kill", "--signal", "SIGTERM", container_id])
        {
            return Ok(());
        }
        run_cli("ctr", &["task", "kill", "--signal", "SIGKILL", container_id])
    }

    fn kill_crio(&self, container_id: &str, options: KillOptions) -> Result<()> {
        let timeout = if options.force { "0" } else { GRACEFUL_STOP_SECS };
        run_cli("crictl", &["stop", "--timeout", timeout, container_id])
    }

    /// Direct signal fallback when no runtime claims the container.
    fn kill_pid(&self, pid: u32, options: KillOptions) -> Result<()> {
        // Never signal init or the process group.
        if pid <= 1 {
            return Err(AgentError::Config(format!("refusing to signal pid {}", pid)));
        }

        let signal = if options.force {
            libc::SIGKILL
        } else {
            libc::SIGTERM
        };
        let ret = unsafe { libc::kill(pid as i32, signal) };
        if ret != 0 {
            return Err(AgentError::Io(std::io::Error::last_os_error()));
        }

        if !options.force {
            // Escalate if the process ignores SIGTERM.
            std::thread::sleep(Duration::from_millis(500));
            let alive = unsafe { libc::kill(pid as i32, 0) } == 0;
            if alive {
                debug!("pid {} survived SIGTERM, sending SIGKILL", pid);
                unsafe { libc::kill(pid as i32, libc::SIGKILL) };
            }
        }
        Ok(())
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

fn cli_succeeds(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn run_cli(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program).args(args).output().map_err(|e| {
        AgentError::Config(format!("{} not available: {}", program, e))
    })?;
    if !output.status.success() {
        warn!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return Err(AgentError::Config(format!(
            "{} exited with {}",
            program, output.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_to_signal_init_or_zero() {
        let manager = ProcessManager::new();
        assert!(manager.kill_pid(0, KillOptions::default()).is_err());
        assert!(manager.kill_pid(1, KillOptions::default()).is_err());
    }

    #[test]
    fn unknown_cli_is_an_error_not_a_panic() {
        let err = run_cli("definitely-not-a-real-cli", &["x"]).unwrap_err();
        assert!(err.to_string().contains("not available"));
    }

    #[test]
    fn absent_runtimes_yield_no_detection() {
        // The container id is nonsense, so even present CLIs reject it.
        let manager = ProcessManager::new();
        let detected = manager.detect_runtime("not-a-container-id-000");
        assert!(detected.is_none());
    }
}
