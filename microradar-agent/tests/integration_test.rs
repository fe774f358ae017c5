use std::time::Duration;

use microradar_agent::config::Config;
use microradar_agent::error::AgentError;
use microradar_agent::prometheus;
use microradar_agent::snapshot::SnapshotStore;

#[test]
fn error_types_carry_context() {
    let err = AgentError::ProbeAttach {
        hook: "syscalls/sys_enter_clone".to_string(),
        reason: "tracefs not mounted".to_string(),
    };
    assert!(err.to_string().contains("sys_enter_clone"));
    assert!(err.to_string().contains("tracefs not mounted"));
}

#[test]
fn version_const_is_set() {
    assert!(!microradar_agent::VERSION.is_empty());
}

#[test]
fn config_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, microradar_agent::config::default_yaml()).unwrap();

    let loaded = Config::load(&path).unwrap();
    let reserialized = serde_yaml::to_string(&loaded).unwrap();
    let reparsed: Config = serde_yaml::from_str(&reserialized).unwrap();
    assert_eq!(loaded, reparsed);
}

#[test]
fn missing_config_file_names_init() {
    let err = Config::load(std::path::Path::new("/nonexistent/config.yaml")).unwrap_err();
    assert!(err.to_string().contains("--init"));
}

#[test]
fn empty_store_renders_service_down() {
    let store = SnapshotStore::new();
    let text = prometheus::render(store.current().as_deref(), Duration::from_secs(0));
    assert_eq!(
        text,
        "# HELP microradar_up MicroRadar service status\n\
         # TYPE microradar_up gauge\n\
         microradar_up 0\n"
    );
}
