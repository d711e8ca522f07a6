//! Metrics and health HTTP surface, carried as ambient stack even though
//! the core spec treats metrics as out of scope for its own logic (spec
//! Non-goals bind functionality, not the ambient serving surface).
//!
//! Grounded on the teacher's own `metrics::mod`, slimmed to the gauges and
//! counters this system's components actually produce.

use anyhow::Result;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::task::JoinHandle;
use tracing::info;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref CACHE_HITS: IntCounter =
        IntCounter::new("kube_image_deployer_cache_hits_total", "TTL cache hits").unwrap();
    pub static ref CACHE_MISSES: IntCounter =
        IntCounter::new("kube_image_deployer_cache_misses_total", "TTL cache misses (compute invoked)").unwrap();

    pub static ref REGISTRY_RESOLVE_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("kube_image_deployer_registry_resolve_errors_total", "Registry resolve failures by kind"),
        &["kind"]
    )
    .unwrap();

    pub static ref WATCH_ENTRIES: IntGauge =
        IntGauge::new("kube_image_deployer_watch_entries", "Active entries in the image watch registry").unwrap();

    pub static ref RECONCILES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("kube_image_deployer_reconciles_total", "Reconcile attempts by controller and outcome"),
        &["controller", "outcome"]
    )
    .unwrap();

    pub static ref PATCHES_APPLIED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("kube_image_deployer_patches_applied_total", "Strategic-merge patches applied by controller"),
        &["controller"]
    )
    .unwrap();

    pub static ref PATCH_TICK_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("kube_image_deployer_patch_tick_errors_total", "Patch tick failures by controller"),
        &["controller"]
    )
    .unwrap();
}

pub fn register_metrics() {
    REGISTRY.register(Box::new(CACHE_HITS.clone())).ok();
    REGISTRY.register(Box::new(CACHE_MISSES.clone())).ok();
    REGISTRY.register(Box::new(REGISTRY_RESOLVE_ERRORS.clone())).ok();
    REGISTRY.register(Box::new(WATCH_ENTRIES.clone())).ok();
    REGISTRY.register(Box::new(RECONCILES_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(PATCHES_APPLIED_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(PATCH_TICK_ERRORS_TOTAL.clone())).ok();
    info!("metrics registered");
}

pub async fn start_metrics_server(addr: &str) -> Result<JoinHandle<()>> {
    register_metrics();

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(health_check));

    let addr = addr.to_string();
    info!(%addr, "starting metrics server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("metrics server failed");
    });

    Ok(handle)
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to encode metrics: {e}")).into_response();
    }

    (StatusCode::OK, [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], buffer).into_response()
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
