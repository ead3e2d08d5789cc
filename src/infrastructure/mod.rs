//! External concerns: the persistent session log, the home-automation
//! presence/override sources, and the outbound OCPP client supervisor.

pub mod homeassistant;
pub mod outbound;
pub mod sessionlog;

pub use homeassistant::{
    CachedFlag, FixedFlag, HomeAssistantSource, OverrideSource, PresenceSource,
};
pub use sessionlog::{init_database, spawn_session_log, SessionLogHandle, SessionStore};
