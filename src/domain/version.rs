//! OCPP protocol version
//!
//! The proxy speaks two wire dialects behind one internal model. The version
//! is fixed per connection at handshake time.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Supported OCPP protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OcppVersion {
    /// OCPP 1.6 (JSON / OCPP-J)
    #[serde(rename = "1.6")]
    V16,
    /// OCPP 2.0.1
    #[serde(rename = "2.0.1")]
    V201,
}

impl OcppVersion {
    /// WebSocket subprotocol identifier, as used in `Sec-WebSocket-Protocol`.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            Self::V16 => "ocpp1.6",
            Self::V201 => "ocpp2.0.1",
        }
    }

    pub fn from_subprotocol(s: &str) -> Option<Self> {
        match s.trim() {
            "ocpp1.6" => Some(Self::V16),
            "ocpp2.0.1" => Some(Self::V201),
            _ => None,
        }
    }

    /// Parse a bare version string as it appears in config, the
    /// `X-OCPP-Version` header or the `version` query parameter.
    pub fn from_version_str(s: &str) -> Option<Self> {
        match s.trim() {
            "1.6" | "ocpp1.6" | "v1.6" => Some(Self::V16),
            "2.0.1" | "ocpp2.0.1" | "v2.0.1" => Some(Self::V201),
            _ => None,
        }
    }

    /// Supported versions, newest first (negotiation preference order).
    pub const ALL: &'static [OcppVersion] = &[Self::V201, Self::V16];

    pub fn version_string(&self) -> &'static str {
        match self {
            Self::V16 => "1.6",
            Self::V201 => "2.0.1",
        }
    }
}

impl fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OCPP {}", self.version_string())
    }
}
