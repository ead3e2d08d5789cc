//! Backend descriptors shared between the registry and the status surface.

use serde::{Deserialize, Serialize};

/// How the backend is attached to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Remote client connected to `/backend?id=...`.
    Inbound,
    /// Proxy-initiated client to a configured OCPP service.
    Outbound,
}

/// Connection state of a backend entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Read-only view of one backend, as reported by `GET /status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSnapshot {
    pub id: String,
    pub kind: BackendKind,
    pub state: BackendState,
    pub subscribed: bool,
    /// Events dropped for this backend because its send queue was full.
    pub dropped_frames: u64,
}
