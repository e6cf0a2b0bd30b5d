use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use once_cell::sync::Lazy;
use prometheus::{opts, histogram_opts, Encoder, HistogramVec, IntCounterVec, Registry, TextEncoder};
use anyhow::Context;
use std::{future::Future, net::SocketAddr};
use tokio::net::TcpListener;
use tracing::info;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static RECONCILE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("aether_operator_reconcile_total", "WorkerMesh reconcile passes by outcome"), &["outcome"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RECONCILE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let h = HistogramVec::new(histogram_opts!("aether_operator_reconcile_duration_seconds", "WorkerMesh reconcile latency"), &["outcome"]).unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

pub static OWNED_WRITES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("aether_operator_owned_writes_total", "Writes to WorkerMesh-owned objects"), &["kind", "op"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Touch every metric so /metrics lists them before the first reconcile.
pub fn init_metrics() {
    Lazy::force(&RECONCILE_TOTAL);
    Lazy::force(&RECONCILE_DURATION);
    Lazy::force(&OWNED_WRITES);
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() { return StatusCode::INTERNAL_SERVER_ERROR.into_response(); }
    ([("Content-Type", "text/plain; version=0.0.4")], buf).into_response()
}

async fn ok() -> &'static str { "ok" }

pub fn probe_router() -> Router {
    Router::new()
        .route("/healthz", get(ok))
        .route("/readyz", get(ok))
        .route("/metrics", get(metrics_handler))
}

/// Bind the probe port up front so a taken port fails startup instead of a background task.
pub async fn bind_probes(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await.with_context(|| format!("bind probe listener on {addr}"))?;
    info!(%addr, "probes listening");
    Ok(listener)
}

/// Serve health probes and metrics until `shutdown` resolves.
pub async fn serve_probes(listener: TcpListener, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
    axum::serve(listener, probe_router()).with_graceful_shutdown(shutdown).await?;
    Ok(())
}
