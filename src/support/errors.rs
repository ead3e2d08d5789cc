//! Proxy error taxonomy
//!
//! Every error the proxy surfaces to a peer carries one of the stable code
//! strings below. Codes travel verbatim in backend `error` frames, OCPP
//! CallError frames and REST error bodies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    // ── Transport ──────────────────────────────────────────
    #[error("connection lost")]
    ConnectionLost,

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    // ── Protocol ───────────────────────────────────────────
    #[error("action not implemented: {0}")]
    NotImplemented(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("protocol version mismatch: {0}")]
    VersionMismatch(String),

    // ── Arbitration ────────────────────────────────────────
    #[error("control lock is held by another backend")]
    AlreadyHeld,

    #[error("backend does not hold the control lock")]
    NotLockHolder,

    #[error("control request rate limit exceeded")]
    RateLimited,

    #[error("provider is on the block list")]
    ProviderBlocked,

    #[error("provider is not on the allow list")]
    ProviderNotAllowed,

    #[error("control blocked while presence sensor reports home")]
    PresenceBlocked,

    #[error("administrative override is active")]
    UserOverride,

    #[error("charger is in a faulted state")]
    ChargerFaulted,

    // ── Operation ──────────────────────────────────────────
    #[error("call timed out")]
    CallTimeout,

    #[error("command preempted by lock transfer")]
    Preempted,

    #[error("charger is not connected")]
    ChargerUnavailable,

    // ── Registry ───────────────────────────────────────────
    #[error("backend id already registered: {0}")]
    DuplicateBackend(String),

    #[error("session not found: {0}")]
    SessionNotFound(i64),

    // ── System ─────────────────────────────────────────────
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("session log write failed: {0}")]
    LogWriteFailed(String),
}

impl ProxyError {
    /// Stable machine-readable code, surfaced verbatim to peers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionLost => "ConnectionLost",
            Self::InvalidFrame(_) => "InvalidFrame",
            Self::HandshakeFailed(_) => "HandshakeFailed",
            Self::NotImplemented(_) => "NotImplemented",
            Self::MalformedPayload(_) => "MalformedPayload",
            Self::VersionMismatch(_) => "VersionMismatch",
            Self::AlreadyHeld => "AlreadyHeld",
            Self::NotLockHolder => "NotLockHolder",
            Self::RateLimited => "RateLimited",
            Self::ProviderBlocked => "ProviderBlocked",
            Self::ProviderNotAllowed => "ProviderNotAllowed",
            Self::PresenceBlocked => "PresenceBlocked",
            Self::UserOverride => "UserOverride",
            Self::ChargerFaulted => "ChargerFaulted",
            Self::CallTimeout => "CallTimeout",
            Self::Preempted => "Preempted",
            Self::ChargerUnavailable => "ChargerUnavailable",
            Self::DuplicateBackend(_) => "DuplicateBackend",
            Self::SessionNotFound(_) => "SessionNotFound",
            Self::ConfigInvalid(_) => "ConfigInvalid",
            Self::LogWriteFailed(_) => "LogWriteFailed",
        }
    }

    /// HTTP status for REST surfaces.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::InvalidFrame(_)
            | Self::MalformedPayload(_)
            | Self::VersionMismatch(_)
            | Self::HandshakeFailed(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::DuplicateBackend(_) => StatusCode::CONFLICT,
            Self::ChargerUnavailable | Self::ConnectionLost => StatusCode::SERVICE_UNAVAILABLE,
            Self::CallTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::AlreadyHeld
            | Self::NotLockHolder
            | Self::RateLimited
            | Self::ProviderBlocked
            | Self::ProviderNotAllowed
            | Self::PresenceBlocked
            | Self::UserOverride
            | Self::ChargerFaulted
            | Self::Preempted => StatusCode::CONFLICT,
            Self::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Self::ConfigInvalid(_) | Self::LogWriteFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": { "code": self.code(), "message": self.to_string() }
        });
        (self.http_status(), Json(body)).into_response()
    }
}
