//! Core domain types shared by every subsystem: the protocol version tag,
//! the unified charger status, the internal event/command vocabulary, and
//! the charging-session record.

pub mod backend;
pub mod commands;
pub mod events;
pub mod session;
pub mod status;
pub mod version;

pub use backend::{BackendKind, BackendSnapshot, BackendState};
pub use commands::{AvailabilityKind, ChargerCommand, ResetKind};
pub use events::ChargerEvent;
pub use session::{ChargingSession, SessionFilter, CSV_HEADER};
pub use status::ChargerStatus;
pub use version::OcppVersion;
