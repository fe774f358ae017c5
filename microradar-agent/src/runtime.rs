//! Container runtime detection and cgroup-to-container resolution.
//!
//! A runtime counts as present when its well-known UNIX socket exists or a
//! process with the daemon's name is running. Container identities come from
//! scanning `/proc/<pid>/cgroup` lines for runtime-specific path signatures.
//! Scans are cached for 30 seconds.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::debug;

/// Supported container runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    Docker,
    Containerd,
    Crio,
}

impl RuntimeKind {
    pub const ALL: [RuntimeKind; 3] = [
        RuntimeKind::Docker,
        RuntimeKind::Containerd,
        RuntimeKind::Crio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Containerd => "containerd",
            RuntimeKind::Crio => "cri-o",
        }
    }

    /// Name of the daemon process to look for in /proc/*/cmdline.
    fn daemon_name(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "dockerd",
            RuntimeKind::Containerd => "containerd",
            RuntimeKind::Crio => "crio",
        }
    }

    fn socket_paths(&self) -> &'static [&'static str] {
        match self {
            RuntimeKind::Docker => &["/var/run/docker.sock", "/run/docker.sock"],
            RuntimeKind::Containerd => &[
                "/run/containerd/containerd.sock",
                "/var/run/containerd/containerd.sock",
            ],
            RuntimeKind::Crio => &["/var/run/crio/crio.sock", "/run/crio/crio.sock"],
        }
    }
}

/// A detected runtime daemon.
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub kind: RuntimeKind,
    /// Runtime version is not derivable from procfs alone.
    pub version: String,
    pub socket_path: Option<PathBuf>,
    pub pid: Option<u32>,
}

/// One container discovered from a pid's cgroup file.
#[derive(Debug, Clone)]
pub struct DiscoveredContainer {
    pub pid: u32,
    pub runtime: RuntimeKind,
    pub container_id: String,
    pub status: String,
    pub labels: HashMap<String, String>,
}

/// Classify a single cgroup line by runtime path signature and extract the
/// container id after the signature. Unrecognized lines return None.
pub fn classify_cgroup_line(line: &str) -> Option<(RuntimeKind, String)> {
    const SIGNATURES: &[(RuntimeKind, &str)] = &[
        (RuntimeKind::Docker, "/docker/"),
        (RuntimeKind::Docker, "/docker-"),
        (RuntimeKind::Containerd, "/containerd/"),
        (RuntimeKind::Containerd, "/k8s.io/"),
        (RuntimeKind::Crio, "/crio-"),
        (RuntimeKind::Crio, "/crio/"),
    ];

    for (kind, signature) in SIGNATURES {
        if let Some(idx) = line.find(signature) {
            let rest = &line[idx + signature.len()..];
            let id = rest
                .split('/')
                .next()
                .unwrap_or("")
                .trim()
                .trim_end_matches(".scope");
            if !id.is_empty() {
                return Some((*kind, id.to_string()));
            }
        }
    }
    None
}

pub struct RuntimeResolver {
    proc_root: PathBuf,
    scan_ttl: Duration,
    by_pid: DashMap<u32, DiscoveredContainer>,
    runtimes: Mutex<Vec<RuntimeInfo>>,
    last_scan: Mutex<Option<Instant>>,
}

impl RuntimeResolver {
    pub fn new() -> Self {
        Self::with_proc_root(PathBuf::from("/proc"))
    }

    /// Custom proc root, for testing against a synthetic tree.
    pub fn with_proc_root(proc_root: PathBuf) -> Self {
        Self {
            proc_root,
            scan_ttl: Duration::from_secs(30),
            by_pid: DashMap::new(),
            runtimes: Mutex::new(Vec::new()),
            last_scan: Mutex::new(None),
        }
    }

    /// Detected runtimes from the most recent scan.
    pub fn runtimes(&self) -> Vec<RuntimeInfo> {
        self.refresh_if_stale();
        self.runtimes.lock().expect("resolver lock poisoned").clone()
    }

    /// Runtime-reported container id for a pid, if the scan found one.
    pub fn lookup_pid(&self, pid: u32) -> Option<DiscoveredContainer> {
        self.refresh_if_stale();
        self.by_pid.get(&pid).map(|entry| entry.clone())
    }

    pub fn refresh_if_stale(&self) {
        let mut last = self.last_scan.lock().expect("resolver lock poisoned");
        let stale = match *last {
            Some(at) => at.elapsed() >= self.scan_ttl,
            None => true,
        };
        if !stale {
            return;
        }
        *last = Some(Instant::now());
        drop(last);

        self.scan();
    }

    fn scan(&self) {
        let runtimes = self.detect_runtimes();
        debug!(
            "runtime scan: {} runtime(s) present",
            runtimes.len()
        );
        *self.runtimes.lock().expect("resolver lock poisoned") = runtimes;

        self.by_pid.clear();
        for (pid, container) in self.scan_proc_cgroups() {
            self.by_pid.insert(pid, container);
        }
    }

    fn detect_runtimes(&self) -> Vec<RuntimeInfo> {
        let mut found = Vec::new();
        for kind in RuntimeKind::ALL {
            let socket_path = kind
                .socket_paths()
                .iter()
                .map(Path::new)
                .find(|p| is_socket(p))
                .map(Path::to_path_buf);

            let pid = self.find_process_by_name(kind.daemon_name());

            // Absence is not an error; the runtime is simply not present.
            if socket_path.is_some() || pid.is_some() {
                found.push(RuntimeInfo {
                    kind,
                    version: "unknown".to_string(),
                    socket_path,
                    pid,
                });
            }
        }
        found
    }

    fn find_process_by_name(&self, name: &str) -> Option<u32> {
        let entries = fs::read_dir(&self.proc_root).ok()?;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let pid: u32 = match file_name.to_string_lossy().parse() {
                Ok(pid) => pid,
                Err(_) => continue,
            };
            let cmdline_path = entry.path().join("cmdline");
            let cmdline = match fs::read(&cmdline_path) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            if String::from_utf8_lossy(&cmdline).contains(name) {
                return Some(pid);
            }
        }
        None
    }

    /// One record per (pid, detected runtime); unparseable lines are skipped.
    fn scan_proc_cgroups(&self) -> Vec<(u32, DiscoveredContainer)> {
        let mut discovered = Vec::new();
        let entries = match fs::read_dir(&self.proc_root) {
            Ok(entries) => entries,
            Err(_) => return discovered,
        };

        for entry in entries.flatten() {
            let pid: u32 = match entry.file_name().to_string_lossy().parse() {
                Ok(pid) => pid,
                Err(_) => continue,
            };
            let cgroup_path = entry.path().join("cgroup");
            let content = match fs::read_to_string(&cgroup_path) {
                Ok(content) => content,
                Err(_) => continue,
            };
            for line in content.lines() {
                if let Some((runtime, container_id)) = classify_cgroup_line(line) {
                    discovered.push((
                        pid,
                        DiscoveredContainer {
                            pid,
                            runtime,
                            container_id,
                            // The pid exists, so the container is live.
                            status: "running".to_string(),
                            labels: HashMap::new(),
                        },
                    ));
                    break;
                }
            }
        }
        discovered
    }
}

impl Default for RuntimeResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn is_socket(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn classifies_docker_cgroup_paths() {
        let (kind, id) =
            classify_cgroup_line("12:memory:/docker/0123456789abcdef0123456789abcdef").unwrap();
        assert_eq!(kind, RuntimeKind::Docker);
        assert_eq!(id, "0123456789abcdef0123456789abcdef");

        let (kind, id) =
            classify_cgroup_line("0::/system.slice/docker-deadbeef.scope").unwrap();
        assert_eq!(kind, RuntimeKind::Docker);
        assert_eq!(id, "deadbeef");
    }

    #[test]
    fn classifies_containerd_and_crio_paths() {
        let (kind, id) = classify_cgroup_line("0::/k8s.io/abc123").unwrap();
        assert_eq!(kind, RuntimeKind::Containerd);
        assert_eq!(id, "abc123");

        let (kind, id) = classify_cgroup_line("0::/machine.slice/crio-fedcba.scope").unwrap();
        assert_eq!(kind, RuntimeKind::Crio);
        assert_eq!(id, "fedcba");
    }

    #[test]
    fn skips_unrecognized_lines() {
        assert!(classify_cgroup_line("0::/init.scope").is_none());
        assert!(classify_cgroup_line("garbage").is_none());
        assert!(classify_cgroup_line("0::/docker/").is_none());
    }

    #[test]
    fn scans_synthetic_proc_tree() {
        let proc_root = tempfile::tempdir().unwrap();

        let pid_dir = proc_root.path().join("4321");
        fs::create_dir(&pid_dir).unwrap();
        let mut cgroup = File::create(pid_dir.join("cgroup")).unwrap();
        writeln!(cgroup, "0::/docker/0011223344556677").unwrap();

        // Non-numeric directories are ignored.
        fs::create_dir(proc_root.path().join("self")).unwrap();

        let resolver = RuntimeResolver::with_proc_root(proc_root.path().to_path_buf());
        let found = resolver.lookup_pid(4321).expect("pid should resolve");
        assert_eq!(found.runtime, RuntimeKind::Docker);
        assert_eq!(found.container_id, "0011223344556677");
        assert!(resolver.lookup_pid(9999).is_none());
    }

    #[test]
    fn scan_results_are_cached() {
        let proc_root = tempfile::tempdir().unwrap();
        let resolver = RuntimeResolver::with_proc_root(proc_root.path().to_path_buf());
        assert!(resolver.lookup_pid(1).is_none());

        // A pid appearing after the scan is invisible until the TTL expires.
        let pid_dir = proc_root.path().join("777");
        fs::create_dir(&pid_dir).unwrap();
        let mut cgroup = File::create(pid_dir.join("cgroup")).unwrap();
        writeln!(cgroup, "0::/crio-cafebabe.scope").unwrap();
        assert!(resolver.lookup_pid(777).is_none());
    }
}
