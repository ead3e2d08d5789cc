//! # OCPP Proxy
//!
//! Protocol-aware proxy between a single EVSE speaking OCPP (1.6 or 2.0.1
//! over WebSocket) and a set of competing backend consumers. Telemetry is
//! fanned out to every subscribed backend; an arbitration engine grants
//! exactly one backend the right to command the charger at any moment.
//!
//! ## Architecture
//!
//! - **support**: cross-cutting utilities (errors, OCPP-J framing, shutdown,
//!   backoff)
//! - **domain**: version tag, unified status, internal event/command
//!   vocabulary, session record
//! - **protocol**: pure per-version codecs behind one adapter interface
//! - **application**: event bus and pump, charger session manager,
//!   arbitration engine, backend registry
//! - **infrastructure**: session log (SeaORM/SQLite), home-automation
//!   sources, outbound OCPP clients
//! - **interfaces**: axum HTTP surface and the two WebSocket endpoints
//! - **config**: TOML configuration with environment overrides

pub mod application;
pub mod backends;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interfaces;
pub mod protocol;
pub mod support;

// Re-export commonly used types at crate root
pub use application::{create_event_bus, ArbiterHandle, BackendRegistry, ChargerManager};
pub use config::{default_config_path, AppConfig};
pub use domain::{ChargerCommand, ChargerEvent, ChargerStatus, OcppVersion};
pub use infrastructure::{init_database, spawn_session_log};
pub use interfaces::http::{create_router, AppState};
pub use support::{ProxyError, ShutdownSignal};
