//! Metrics & liveness.
//!
//! A small `axum` router, bound the same way the rest of this codebase binds
//! its HTTP listeners, exposing `/healthz` (ready once the service account
//! index's initial list has completed and the bus connection is live) and
//! `/metrics` (Prometheus text exposition).

use std::sync::{atomic::AtomicBool, Arc};

use axum::{extract::State, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub expired_token_total: prometheus::IntCounter,
    pub invalid_signature_total: prometheus::IntCounter,
    pub invalid_claims_total: prometheus::IntCounter,
    pub missing_kubernetes_claims_total: prometheus::IntCounter,
    pub unknown_service_account_total: prometheus::IntCounter,
    pub jwks_refresh_total: IntCounterVec,
    pub callout_requests_total: IntCounterVec,
    pub service_account_index_size: IntGauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        Self::build(registry)
    }

    /// A fresh, un-shared registry suitable for unit tests that construct
    /// several `Metrics` instances in the same process.
    pub fn new_for_test() -> Self {
        Self::new().expect("metric registration never fails with fixed, non-duplicate names")
    }

    fn build(registry: Registry) -> anyhow::Result<Self> {
        let expired_token_total =
            prometheus::IntCounter::new("expired_token_total", "tokens rejected for time-window violations")?;
        let invalid_signature_total = prometheus::IntCounter::new(
            "invalid_signature_total",
            "tokens rejected for a bad or unsupported signature",
        )?;
        let invalid_claims_total =
            prometheus::IntCounter::new("invalid_claims_total", "tokens rejected for malformed registered claims")?;
        let missing_kubernetes_claims_total = prometheus::IntCounter::new(
            "missing_kubernetes_claims_total",
            "tokens rejected for a missing kubernetes.io/serviceaccount claim",
        )?;
        let unknown_service_account_total = prometheus::IntCounter::new(
            "unknown_service_account_total",
            "authorizations denied because the service account was not found in the index",
        )?;
        let jwks_refresh_total = IntCounterVec::new(
            Opts::new("jwks_refresh_total", "jwks refresh attempts by outcome"),
            &["outcome"],
        )?;
        let callout_requests_total = IntCounterVec::new(
            Opts::new("callout_requests_total", "auth-callout requests handled by decision"),
            &["decision"],
        )?;
        let service_account_index_size = IntGauge::new(
            "service_account_index_size",
            "number of service accounts currently cached in the index",
        )?;

        registry.register(Box::new(expired_token_total.clone()))?;
        registry.register(Box::new(invalid_signature_total.clone()))?;
        registry.register(Box::new(invalid_claims_total.clone()))?;
        registry.register(Box::new(missing_kubernetes_claims_total.clone()))?;
        registry.register(Box::new(unknown_service_account_total.clone()))?;
        registry.register(Box::new(jwks_refresh_total.clone()))?;
        registry.register(Box::new(callout_requests_total.clone()))?;
        registry.register(Box::new(service_account_index_size.clone()))?;

        Ok(Self {
            registry,
            expired_token_total,
            invalid_signature_total,
            invalid_claims_total,
            missing_kubernetes_claims_total,
            unknown_service_account_total,
            jwks_refresh_total,
            callout_requests_total,
            service_account_index_size,
        })
    }
}

#[derive(Clone)]
struct AppState {
    metrics: Metrics,
    ready: Arc<AtomicBool>,
}

pub fn router(metrics: Metrics, ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .with_state(AppState { metrics, ready })
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    if state.ready.load(std::sync::atomic::Ordering::Acquire) {
        (axum::http::StatusCode::OK, "ok")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry.gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (axum::http::StatusCode::OK, buffer),
        Err(err) => {
            tracing::error!(?err, "failed to encode metrics");
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn metrics_registers_without_duplicate_name_collisions() {
        let _a = Metrics::new_for_test();
        let _b = Metrics::new_for_test();
    }
}
