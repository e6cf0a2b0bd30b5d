use std::net::SocketAddr;
use std::path::PathBuf;

use aether_operator::config::{OperatorConfig, ENV_CONFIG_PATH};
use aether_operator::logging::{init_logging, LogFormat};
use aether_operator::{controller, telemetry};
use anyhow::Context;
use clap::Parser;
use kube::Client;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "aether-operator", version, about = "Reconciles WorkerMesh resources")]
struct Cli {
    /// TOML config file
    #[arg(long, env = ENV_CONFIG_PATH)]
    config: Option<PathBuf>,
    /// Only watch this namespace (default: all namespaces)
    #[arg(long)]
    namespace: Option<String>,
    /// Address for /healthz, /readyz and /metrics
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
    #[arg(long, env = "AETHER_LOG", default_value = "info")]
    log_level: String,
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format)?;

    let mut cfg = OperatorConfig::load(cli.config.as_deref())?;
    if let Some(ns) = cli.namespace {
        cfg.namespace = Some(ns);
    }
    if let Some(addr) = cli.metrics_addr {
        cfg.metrics_addr = addr;
    }

    telemetry::init_metrics();
    let client = Client::try_default().await.context("build kubernetes client")?;
    info!(namespace=?cfg.namespace, metrics_addr=%cfg.metrics_addr, "operator starting");

    let listener = telemetry::bind_probes(cfg.metrics_addr).await?;
    let (stop_probes, stopped) = tokio::sync::oneshot::channel::<()>();
    let mut probes = tokio::spawn(telemetry::serve_probes(listener, async move {
        let _ = stopped.await;
    }));

    let result = tokio::select! {
        res = controller::run(client, cfg) => res,
        res = &mut probes => return Err(probe_exit(res)),
    };
    let _ = stop_probes.send(());
    match probes.await {
        Ok(Err(e)) => error!(error=%e, "probe server failed"),
        Err(e) => error!(error=%e, "probe server task panicked"),
        Ok(Ok(())) => {}
    }
    result
}

/// The probe server stopped while the controller was still running.
fn probe_exit(res: Result<anyhow::Result<()>, tokio::task::JoinError>) -> anyhow::Error {
    let err = match res {
        Ok(Ok(())) => anyhow::anyhow!("probe server exited"),
        Ok(Err(e)) => e.context("probe server failed"),
        Err(e) => anyhow::Error::new(e).context("probe server task panicked"),
    };
    error!(error=%format!("{err:#}"), "operator stopping");
    err
}
