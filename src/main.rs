//! OCPP proxy entry point
//!
//! Wires the actors together: session log, event bus, charger session
//! manager, arbitration engine, event pump, outbound clients, HTTP edge.
//! Exits 0 on clean shutdown (SIGTERM/SIGINT), non-zero on a configuration
//! or startup error.

use std::net::SocketAddr;
use std::sync::Arc;

use sea_orm_migration::MigratorTrait;
use tracing::{error, info};

use ocpp_proxy::application::arbitration::spawn_arbiter;
use ocpp_proxy::application::pump::spawn_event_pump;
use ocpp_proxy::application::{create_event_bus, BackendRegistry, ChargerManager};
use ocpp_proxy::config::AppConfig;
use ocpp_proxy::infrastructure::homeassistant::{
    spawn_override_poller, spawn_presence_poller, FixedFlag, HomeAssistantSource, OverrideSource,
    PresenceSource,
};
use ocpp_proxy::infrastructure::outbound::spawn_outbound_clients;
use ocpp_proxy::infrastructure::sessionlog::migrator::Migrator;
use ocpp_proxy::infrastructure::{init_database, spawn_session_log};
use ocpp_proxy::interfaces::http::{create_router, AppState};
use ocpp_proxy::support::shutdown::{listen_for_shutdown_signals, ShutdownSignal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Configuration (invalid config is fatal) ────────────
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            // logging is not up yet
            eprintln!("configuration error: {e}");
            return Err(e.into());
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();
    info!(version = env!("CARGO_PKG_VERSION"), "starting ocpp-proxy");

    // ── Prometheus recorder (before any metrics calls) ─────
    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus metrics recorder");

    // ── Session log ────────────────────────────────────────
    let db_url = config.db_url();
    info!(db_url = db_url.as_str(), "opening session log");
    let db = init_database(&db_url).await?;
    Migrator::up(&db, None).await?;
    let log = spawn_session_log(db.clone());

    // ── Shutdown plumbing ──────────────────────────────────
    let shutdown = ShutdownSignal::new();
    tokio::spawn(listen_for_shutdown_signals(shutdown.clone()));

    // ── Core actors ────────────────────────────────────────
    let event_bus = create_event_bus();
    let charger = ChargerManager::new(event_bus.clone(), config.charger.heartbeat_interval_seconds);
    let registry = BackendRegistry::shared();

    let presence_source: Arc<dyn PresenceSource> = match (
        &config.presence_sensor,
        &config.home_assistant.url,
        &config.home_assistant.token,
    ) {
        (Some(entity), Some(url), Some(token)) => {
            info!(entity = entity.as_str(), "presence gate bound to Home Assistant");
            Arc::new(HomeAssistantSource::new(url, token, entity))
        }
        _ => Arc::new(FixedFlag(false)),
    };
    let presence = spawn_presence_poller(presence_source, shutdown.clone());

    let arbiter = spawn_arbiter(
        config.control_policy(),
        registry.clone(),
        charger.clone(),
        presence.handle(),
    );

    let override_source: Arc<dyn OverrideSource> = match (
        &config.override_input_boolean,
        &config.home_assistant.url,
        &config.home_assistant.token,
    ) {
        (Some(entity), Some(url), Some(token)) => {
            info!(entity = entity.as_str(), "override bound to Home Assistant");
            Arc::new(HomeAssistantSource::new(url, token, entity))
        }
        _ => Arc::new(FixedFlag(false)),
    };
    spawn_override_poller(override_source, arbiter.clone(), shutdown.clone());

    let pump = spawn_event_pump(
        event_bus.clone(),
        log.clone(),
        arbiter.clone(),
        registry.clone(),
        shutdown.clone(),
    );

    // ── Outbound OCPP clients ──────────────────────────────
    let outbound = spawn_outbound_clients(
        config.ocpp_services.clone(),
        registry.clone(),
        arbiter.clone(),
        shutdown.clone(),
    );

    // ── HTTP/WebSocket edge ────────────────────────────────
    let state = AppState {
        config: Arc::new(config.clone()),
        charger,
        registry,
        arbiter,
        log,
        outbound,
        prometheus,
    };
    let router = create_router(state);

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        error!(addr = addr.as_str(), error = %e, "failed to bind");
        e
    })?;
    info!(addr = addr.as_str(), "listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { serve_shutdown.wait().await })
    .await?;

    // ── Cleanup ────────────────────────────────────────────
    pump.abort();
    if let Err(e) = db.close().await {
        error!(error = %e, "error closing session log database");
    }
    info!("shutdown complete");
    Ok(())
}
