// tests/config_tests.rs
use std::time::Duration;

use taskmesh::engine::{ConfigError, EngineConfig, TaskKind, WorkerSpec};

#[test]
fn test_defaults_are_valid() {
    let config = EngineConfig::default();
    config.validate().unwrap();

    let total: usize = config.pool.iter().map(|s| s.count).sum();
    assert_eq!(total, 7);
    assert!(config.pool.iter().any(|s| s.kind == TaskKind::GpuCompute && s.gpu));
    assert_eq!(config.default_timeout(), Duration::from_secs(30));
    assert_eq!(config.get_logging_level(), "info");
}

#[test]
fn test_yaml_config_with_partial_fields() {
    let yaml = r#"
pool:
  - kind: compute
    count: 4
  - kind: gpu-compute
    count: 1
    gpu: true
tick_ms: 50
logging_level: DEBUG
"#;
    let config = EngineConfig::from_yaml_str(yaml).unwrap();

    assert_eq!(
        config.pool,
        vec![
            WorkerSpec::new(TaskKind::Compute, 4),
            WorkerSpec::new(TaskKind::GpuCompute, 1).gpu(),
        ]
    );
    assert_eq!(config.tick_ms, 50);
    assert_eq!(config.get_logging_level(), "debug");
    assert_eq!(config.max_queue_size, 10_000);
    assert_eq!(config.scheduler_config().tick, Duration::from_millis(50));
}

#[test]
fn test_toml_config() {
    let toml = r#"
tick_ms = 100
retention_secs = 60
latency_smoothing = 0.5
metrics_enabled = true
metrics_port = 9100

[[pool]]
kind = "crypto"
count = 2
"#;
    let config = EngineConfig::from_toml_str(toml).unwrap();
    assert_eq!(config.pool, vec![WorkerSpec::new(TaskKind::Crypto, 2)]);
    assert_eq!(config.scheduler_config().retention, Duration::from_secs(60));
    assert!(config.metrics_enabled);
}

#[test]
fn test_unknown_kind_is_a_parse_error() {
    let yaml = "pool:\n  - kind: quantum\n    count: 1\n";
    assert!(matches!(EngineConfig::from_yaml_str(yaml), Err(ConfigError::ParseError(_))));
}

#[test]
fn test_validation_rejects_bad_values() {
    let cases: [fn(&mut EngineConfig); 9] = [
        |c| c.tick_ms = 0,
        |c| c.max_queue_size = 0,
        |c| c.default_timeout_ms = 0,
        |c| c.event_buffer = 0,
        |c| c.latency_smoothing = 0.0,
        |c| c.latency_smoothing = 1.5,
        |c| {
            c.metrics_enabled = true;
            c.metrics_port = 0;
        },
        |c| c.logging_level = Some("verbose".into()),
        |c| c.pool.push(WorkerSpec::new(TaskKind::Compute, 1)),
    ];

    for (i, mutate) in cases.iter().enumerate() {
        let mut config = EngineConfig::default();
        mutate(&mut config);
        assert!(
            matches!(config.validate(), Err(ConfigError::ValidationError(_))),
            "case {} should fail validation",
            i
        );
    }
}

#[test]
fn test_missing_file_is_io_error() {
    assert!(matches!(
        EngineConfig::from_yaml("/nonexistent/taskmesh.yaml"),
        Err(ConfigError::IoError(_))
    ));
}
