//! HTTP surface
//!
//! One axum router on the configured port: the human status page, the
//! charger and backend WebSocket upgrades, the session query/export
//! endpoints, the override toggle, health and Prometheus metrics. The REST
//! group carries a per-IP rate limit.

pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::GovernorLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::application::arbitration::ArbiterHandle;
use crate::application::charger::SharedChargerManager;
use crate::application::registry::SharedBackendRegistry;
use crate::config::AppConfig;
use crate::infrastructure::outbound::SharedOutboundSupervisor;
use crate::infrastructure::sessionlog::SessionLogHandle;
use crate::interfaces::ws::{backend_ws_handler, charger_ws_handler, charger_ws_handler_versioned};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub charger: SharedChargerManager,
    pub registry: SharedBackendRegistry,
    pub arbiter: ArbiterHandle,
    pub log: SessionLogHandle,
    pub outbound: SharedOutboundSupervisor,
    pub prometheus: PrometheusHandle,
}

/// Assemble the full router.
pub fn create_router(state: AppState) -> Router {
    let rpm = state.config.server.api_requests_per_minute.max(1) as u64;
    let replenish_secs = (60 / rpm).max(1);
    let governor_config = GovernorConfigBuilder::default()
        .per_second(replenish_secs)
        .burst_size(rpm as u32)
        .use_headers()
        .finish()
        .expect("failed to build rate limiter config");
    info!(requests_per_minute = rpm, "REST rate limit configured");

    let rest = Router::new()
        .route("/status", get(handlers::status))
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions.csv", get(handlers::export_sessions_csv))
        .route("/sessions/{id}", get(handlers::get_session))
        .route("/override", post(handlers::set_override))
        .layer(GovernorLayer::new(governor_config));

    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/charger", get(charger_ws_handler))
        .route("/charger/{version}", get(charger_ws_handler_versioned))
        .route("/backend", get(backend_ws_handler))
        .merge(rest)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
