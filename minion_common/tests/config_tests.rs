//! Topology configuration loading tests.

use minion_common::config::{ConfigError, ConfigLoader, LockMode, TopologyConfig};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_topology(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{content}").unwrap();
    file.flush().unwrap();
    file
}

const BENCH: &str = r#"
[shared]
service_name = "optics-bench"
log_level = "debug"

[defaults]
refresh_interval_ms = 20

[logger]
name = "logger"
log_dir = "/tmp/optics-logs"

[[minion]]
name = "camera"
reporter_of = "logger"

[minion.config]
refresh_interval_ms = 5
state_size = 131072

[minion.config.lock]
mode = "read_write"
timeout = 2000

[[minion]]
name = "viewer"
reporter_of = "logger"

[[connection]]
a = "camera"
b = "viewer"
"#;

#[test]
fn test_load_full_topology() {
    let file = write_topology(BENCH);
    let topology = TopologyConfig::load(file.path()).unwrap();
    topology.validate().unwrap();

    assert_eq!(topology.shared.service_name, "optics-bench");
    assert_eq!(topology.minions.len(), 2);
    assert_eq!(topology.connections.len(), 1);

    let camera = &topology.minions[0];
    let camera_config = topology.config_for(camera);
    assert_eq!(camera_config.refresh_interval_ms, 5);
    assert_eq!(camera_config.lock.mode, LockMode::ReadWrite);
    assert_eq!(camera_config.lock.timeout, 2000);

    let viewer_config = topology.config_for(&topology.minions[1]);
    assert_eq!(viewer_config.refresh_interval_ms, 20);
    assert_eq!(viewer_config.lock.mode, LockMode::Exclusive);

    let logger = topology.logger.as_ref().unwrap();
    assert_eq!(logger.name, "logger");
    assert_eq!(logger.record_timeout_ms, 100);
    assert_eq!(logger.reporter_grace(), Duration::from_millis(2000));
}

#[test]
fn test_unknown_top_level_field_rejected() {
    let file = write_topology(
        r#"
[shared]
service_name = "bench"

[[minions]]
name = "typo"
"#,
    );
    assert!(matches!(
        TopologyConfig::load(file.path()),
        Err(ConfigError::ParseError(_))
    ));
}

#[test]
fn test_duplicate_names_rejected() {
    let topology = TopologyConfig::from_toml(
        r#"
[shared]
service_name = "bench"

[[minion]]
name = "stage"

[[minion]]
name = "stage"
"#,
    )
    .unwrap();
    assert!(matches!(
        topology.validate(),
        Err(ConfigError::ValidationError(_))
    ));
}

#[test]
fn test_connection_to_unknown_minion_rejected() {
    let topology = TopologyConfig::from_toml(
        r#"
[shared]
service_name = "bench"

[[minion]]
name = "stage"

[[connection]]
a = "stage"
b = "ghost"
"#,
    )
    .unwrap();
    let err = topology.validate().unwrap_err();
    assert!(err.to_string().contains("ghost"));
}

#[test]
fn test_reporter_without_logger_rejected() {
    let topology = TopologyConfig::from_toml(
        r#"
[shared]
service_name = "bench"

[[minion]]
name = "stage"
reporter_of = "logger"
"#,
    )
    .unwrap();
    assert!(topology.validate().is_err());
}

#[test]
fn test_self_connection_rejected() {
    let topology = TopologyConfig::from_toml(
        r#"
[shared]
service_name = "bench"

[[minion]]
name = "stage"

[[connection]]
a = "stage"
b = "stage"
"#,
    )
    .unwrap();
    assert!(topology.validate().is_err());
}
