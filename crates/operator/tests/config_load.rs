use std::io::Write;

use aether_operator::config::{OperatorConfig, ENV_DEFAULT_PORT, ENV_METRICS_ADDR, ENV_NAMESPACE};
use serial_test::serial;

fn clear_env() {
    for var in [ENV_NAMESPACE, ENV_DEFAULT_PORT, ENV_METRICS_ADDR] {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn file_values_then_env_overrides() {
    clear_env();
    let mut f = tempfile::NamedTempFile::new().unwrap();
    writeln!(f, "namespace = \"workers\"\nretry_max_seconds = 60\n[mesh]\ndefault_port = 7000\nservice_suffix = \"-headless\"").unwrap();

    let cfg = OperatorConfig::load(Some(f.path())).unwrap();
    assert_eq!(cfg.namespace.as_deref(), Some("workers"));
    assert_eq!(cfg.mesh.default_port, 7000);
    assert_eq!(cfg.mesh.service_suffix, "-headless");
    assert_eq!(cfg.retry_max_seconds, 60);

    std::env::set_var(ENV_DEFAULT_PORT, "7100");
    std::env::set_var(ENV_NAMESPACE, "");
    std::env::set_var(ENV_METRICS_ADDR, "127.0.0.1:9090");
    let cfg = OperatorConfig::load(Some(f.path())).unwrap();
    assert_eq!(cfg.mesh.default_port, 7100);
    assert!(cfg.namespace.is_none(), "empty namespace means all namespaces");
    assert_eq!(cfg.metrics_addr.to_string(), "127.0.0.1:9090");
    clear_env();
}

#[test]
#[serial]
fn invalid_env_port_is_an_error() {
    clear_env();
    std::env::set_var(ENV_DEFAULT_PORT, "not-a-port");
    let err = OperatorConfig::load(None).unwrap_err();
    assert!(err.to_string().contains(ENV_DEFAULT_PORT), "got {err}");
    clear_env();
}

#[test]
#[serial]
fn missing_file_is_an_error() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    assert!(OperatorConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
}

#[test]
#[serial]
fn no_file_gives_defaults() {
    clear_env();
    assert_eq!(OperatorConfig::load(None).unwrap(), OperatorConfig::default());
}
