//! Backend control protocol
//!
//! JSON frames exchanged with backends, independent of OCPP framing.
//! Client frames carry an `op` tag, proxy frames a `type` tag. A backend's
//! `request_id` is opaque and echoed verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::application::arbitration::ControlStatus;
use crate::domain::{ChargerCommand, ChargerEvent};

// ── Client → proxy ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe,
    Unsubscribe,
    RequestControl {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
    },
    ReleaseControl {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
    },
    Command {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
        command: ChargerCommand,
    },
}

// ── Proxy → client ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlWireStatus {
    Granted,
    Revoked,
    Denied,
}

impl From<ControlStatus> for ControlWireStatus {
    fn from(status: ControlStatus) -> Self {
        match status {
            ControlStatus::Granted => Self::Granted,
            ControlStatus::Revoked => Self::Revoked,
            ControlStatus::Denied => Self::Denied,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Event {
        event: ChargerEvent,
    },
    Control {
        status: ControlWireStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
        result: Value,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
    },
}

impl ServerFrame {
    pub fn control(status: impl Into<ControlWireStatus>, reason: Option<&str>) -> Self {
        Self::Control {
            status: status.into(),
            reason: reason.map(str::to_string),
        }
    }

    pub fn error(code: &str, message: impl Into<String>, request_id: Option<Value>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
            request_id,
        }
    }

    pub fn serialize(&self) -> String {
        // serializing a ServerFrame cannot fail
        serde_json::to_string(self).unwrap()
    }
}
