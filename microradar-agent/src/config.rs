//! YAML configuration: monitoring targets, display and system limits.
//!
//! Durations accept humantime strings ("2s", "100ms"); `memory_limit` takes
//! a size string ("48MB"). Unset fields fall back to documented defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

pub const SUPPORTED_RUNTIMES: &[&str] = &["docker", "containerd", "cri-o"];
pub const SUPPORTED_METRICS: &[&str] = &[
    "cpu",
    "memory",
    "network_latency",
    "tcp_retransmits",
    "disk_io",
    "network_io",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub system: SystemConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_targets")]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub alert_thresholds: AlertThresholds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub runtime: String,
    #[serde(default = "default_metrics")]
    pub metrics: Vec<String>,
    #[serde(default = "default_sampling_rate", with = "humantime_serde")]
    pub sampling_rate: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    #[serde(default = "default_cpu_threshold")]
    pub cpu: f64,
    #[serde(default = "default_memory_threshold")]
    pub memory: f64,
    #[serde(default = "default_latency_threshold")]
    pub network_latency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_refresh_rate", with = "humantime_serde")]
    pub refresh_rate: Duration,
    #[serde(default = "default_theme")]
    pub theme: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_max_containers")]
    pub max_containers: u32,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_targets() -> Vec<TargetConfig> {
    vec![TargetConfig {
        name: "default".to_string(),
        runtime: "docker".to_string(),
        metrics: default_metrics(),
        sampling_rate: default_sampling_rate(),
    }]
}

fn default_metrics() -> Vec<String> {
    ["cpu", "memory", "network_latency", "tcp_retransmits"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_sampling_rate() -> Duration {
    Duration::from_secs(2)
}

fn default_refresh_rate() -> Duration {
    Duration::from_millis(100)
}

fn default_theme() -> String {
    "default".to_string()
}

fn default_cpu_threshold() -> f64 {
    70.0
}

fn default_memory_threshold() -> f64 {
    80.0
}

fn default_latency_threshold() -> f64 {
    10.0
}

fn default_max_containers() -> u32 {
    1000
}

fn default_memory_limit() -> String {
    "48MB".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitoring: MonitoringConfig::default(),
            display: DisplayConfig::default(),
            system: SystemConfig::default(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            targets: default_targets(),
            alert_thresholds: AlertThresholds::default(),
        }
    }
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu: default_cpu_threshold(),
            memory: default_memory_threshold(),
            network_latency: default_latency_threshold(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            refresh_rate: default_refresh_rate(),
            theme: default_theme(),
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            max_containers: default_max_containers(),
            memory_limit: default_memory_limit(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!(
                "cannot read {} ({}); run with --init to generate one",
                path.display(),
                e
            ))
        })?;
        let config: Config = serde_yaml::from_str(&data)
            .map_err(|e| AgentError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitoring.targets.is_empty() {
            return Err(AgentError::Config(
                "at least one monitoring target is required".to_string(),
            ));
        }

        for (i, target) in self.monitoring.targets.iter().enumerate() {
            if target.name.is_empty() {
                return Err(AgentError::Config(format!("target[{}]: name is empty", i)));
            }
            if !SUPPORTED_RUNTIMES.contains(&target.runtime.as_str()) {
                return Err(AgentError::Config(format!(
                    "target[{}]: unsupported runtime '{}'",
                    i, target.runtime
                )));
            }
            for metric in &target.metrics {
                if !SUPPORTED_METRICS.contains(&metric.as_str()) {
                    return Err(AgentError::Config(format!(
                        "target[{}]: unsupported metric '{}'",
                        i, metric
                    )));
                }
            }
            if target.sampling_rate < Duration::from_secs(1) {
                return Err(AgentError::Config(format!(
                    "target[{}]: sampling_rate must be at least 1s",
                    i
                )));
            }
        }

        let thresholds = &self.monitoring.alert_thresholds;
        if thresholds.cpu <= 0.0 || thresholds.cpu > 100.0 {
            return Err(AgentError::Config(
                "alert_thresholds.cpu must be in (0, 100]".to_string(),
            ));
        }
        if thresholds.memory <= 0.0 || thresholds.memory > 100.0 {
            return Err(AgentError::Config(
                "alert_thresholds.memory must be in (0, 100]".to_string(),
            ));
        }
        if thresholds.network_latency <= 0.0 {
            return Err(AgentError::Config(
                "alert_thresholds.network_latency must be positive".to_string(),
            ));
        }

        match self.system.log_level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(AgentError::Config(format!(
                    "log_level '{}' is not one of debug|info|warn|error",
                    other
                )))
            }
        }

        parse_size(&self.system.memory_limit)?;

        Ok(())
    }

    /// Sampling rate of the fastest configured target.
    pub fn sampling_rate(&self) -> Duration {
        self.monitoring
            .targets
            .iter()
            .map(|t| t.sampling_rate)
            .min()
            .unwrap_or_else(default_sampling_rate)
    }

    /// Soft memory cap in bytes.
    pub fn memory_limit_bytes(&self) -> u64 {
        parse_size(&self.system.memory_limit).unwrap_or(48 * 1024 * 1024)
    }
}

/// Parse a size string like "48MB", "512KB", "1GB" or a raw byte count.
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| AgentError::Config(format!("invalid size '{}'", input)))?;

    let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" | "K" | "KIB" => 1024,
        "MB" | "M" | "MIB" => 1024 * 1024,
        "GB" | "G" | "GIB" => 1024 * 1024 * 1024,
        other => {
            return Err(AgentError::Config(format!(
                "unknown size unit '{}' in '{}'",
                other, input
            )))
        }
    };

    Ok(value * multiplier)
}

/// Default configuration written by `--init`.
pub fn default_yaml() -> &'static str {
    r#"monitoring:
  targets:
    - name: default
      runtime: docker
      metrics: [cpu, memory, network_latency, tcp_retransmits]
      sampling_rate: 2s
  alert_thresholds:
    cpu: 70
    memory: 80
    network_latency: 10

display:
  refresh_rate: 100ms
  theme: default

system:
  max_containers: 1000
  memory_limit: 48MB
  log_level: info
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.sampling_rate(), Duration::from_secs(2));
        assert_eq!(config.display.refresh_rate, Duration::from_millis(100));
        assert_eq!(config.system.max_containers, 1000);
        assert_eq!(config.memory_limit_bytes(), 48 * 1024 * 1024);
        assert_eq!(config.monitoring.alert_thresholds.cpu, 70.0);
        assert_eq!(config.monitoring.alert_thresholds.memory, 80.0);
        assert_eq!(config.monitoring.alert_thresholds.network_latency, 10.0);
        config.validate().expect("defaults must validate");
    }

    #[test]
    fn default_yaml_parses_to_default_config() {
        let parsed: Config = serde_yaml::from_str(default_yaml()).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn roundtrip_preserves_semantics() {
        let config = Config::default();
        let serialized = serde_yaml::to_string(&config).unwrap();
        let reparsed: Config = serde_yaml::from_str(&serialized).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn rejects_unknown_runtime() {
        let yaml = r#"
monitoring:
  targets:
    - name: web
      runtime: podman
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_sub_second_sampling() {
        let yaml = r#"
monitoring:
  targets:
    - name: web
      runtime: docker
      sampling_rate: 500ms
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let yaml = r#"
monitoring:
  alert_thresholds:
    cpu: 120
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_size_strings() {
        assert_eq!(parse_size("48MB").unwrap(), 48 * 1024 * 1024);
        assert_eq!(parse_size("512KB").unwrap(), 512 * 1024);
        assert_eq!(parse_size("1GB").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert!(parse_size("48Q").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn fastest_target_wins_sampling_rate() {
        let yaml = r#"
monitoring:
  targets:
    - name: slow
      runtime: docker
      sampling_rate: 5s
    - name: fast
      runtime: containerd
      sampling_rate: 1s
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.sampling_rate(), Duration::from_secs(1));
    }
}
