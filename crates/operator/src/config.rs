use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, net::SocketAddr, path::Path, time::Duration};
use tracing::debug;

pub const ENV_CONFIG_PATH: &str = "AETHER_OPERATOR_CONFIG";
pub const ENV_NAMESPACE: &str = "AETHER_OPERATOR_NAMESPACE";
pub const ENV_DEFAULT_PORT: &str = "AETHER_OPERATOR_DEFAULT_PORT";
pub const ENV_METRICS_ADDR: &str = "AETHER_OPERATOR_METRICS_ADDR";

/// Naming and labeling of the objects owned by a WorkerMesh.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MeshConfig {
    /// Label key whose value is the owning WorkerMesh name.
    pub mesh_label_key: String,
    pub app_label_key: String,
    pub app_label_value: String,
    /// Port used when a WorkerMesh leaves `spec.port` at 0.
    pub default_port: i32,
    /// Appended to the WorkerMesh name to form the headless Service name.
    pub service_suffix: String,
    pub port_name: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            mesh_label_key: "aether.dev/mesh-name".into(),
            app_label_key: "app.kubernetes.io/name".into(),
            app_label_value: "aether-worker".into(),
            default_port: 26600,
            service_suffix: "-svc".into(),
            port_name: "mesh".into(),
        }
    }
}

impl MeshConfig {
    /// `key=value` selector matching every object the operator owns.
    pub fn app_selector(&self) -> String { format!("{}={}", self.app_label_key, self.app_label_value) }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    pub mesh: MeshConfig,
    /// Watch a single namespace; all namespaces when unset.
    pub namespace: Option<String>,
    pub metrics_addr: SocketAddr,
    pub field_manager: String,
    /// 0 leaves reconcile concurrency unbounded.
    pub max_concurrent_reconciles: u16,
    pub retry_base_millis: u64,
    pub retry_max_seconds: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            mesh: MeshConfig::default(),
            namespace: None,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            field_manager: "aether-operator".into(),
            max_concurrent_reconciles: 0,
            retry_base_millis: 500,
            retry_max_seconds: 300,
        }
    }
}

impl OperatorConfig {
    /// Defaults, then the TOML file at `path` (if given), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env()?;
        debug!(?cfg, "config.loaded");
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("read config {path:?}"))?;
        let cfg: Self = toml::from_str(&content).with_context(|| format!("failed to parse config {path:?}"))?;
        debug!(path=?path, "config.parse.success");
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(ns) = std::env::var(ENV_NAMESPACE) {
            self.namespace = if ns.trim().is_empty() { None } else { Some(ns.trim().to_string()) };
        }
        if let Ok(port) = std::env::var(ENV_DEFAULT_PORT) {
            self.mesh.default_port = port.trim().parse().with_context(|| format!("invalid {ENV_DEFAULT_PORT}={port}"))?;
        }
        if let Ok(addr) = std::env::var(ENV_METRICS_ADDR) {
            self.metrics_addr = addr.trim().parse().with_context(|| format!("invalid {ENV_METRICS_ADDR}={addr}"))?;
        }
        Ok(())
    }

    pub fn retry_base(&self) -> Duration { Duration::from_millis(self.retry_base_millis.max(1)) }
    pub fn retry_max(&self) -> Duration { Duration::from_secs(self.retry_max_seconds.max(1)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_worker_conventions() {
        let cfg = OperatorConfig::default();
        assert_eq!(cfg.mesh.default_port, 26600);
        assert_eq!(cfg.mesh.service_suffix, "-svc");
        assert_eq!(cfg.mesh.app_selector(), "app.kubernetes.io/name=aether-worker");
        assert!(cfg.namespace.is_none());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: OperatorConfig = toml::from_str("namespace = \"workers\"\n[mesh]\ndefault_port = 7000\n").unwrap();
        assert_eq!(cfg.namespace.as_deref(), Some("workers"));
        assert_eq!(cfg.mesh.default_port, 7000);
        assert_eq!(cfg.mesh.port_name, "mesh");
        assert_eq!(cfg.field_manager, "aether-operator");
    }

    #[test]
    fn retry_bounds_never_zero() {
        let cfg = OperatorConfig { retry_base_millis: 0, retry_max_seconds: 0, ..Default::default() };
        assert_eq!(cfg.retry_base(), Duration::from_millis(1));
        assert_eq!(cfg.retry_max(), Duration::from_secs(1));
    }
}
