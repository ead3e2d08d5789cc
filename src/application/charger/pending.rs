//! Pending-call table
//!
//! Every outbound Call on the charger socket gets an entry keyed by message
//! id; the matching CallResult or CallError completes it. Timeouts and
//! connection loss flush entries with the corresponding failure.

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::support::ProxyError;

/// Why a call did not produce a CallResult.
#[derive(Debug, Clone)]
pub enum CallFailure {
    /// The charger answered with a CallError.
    Remote { code: String, description: String },
    Timeout,
    ConnectionLost,
    /// The call never reached the wire (encoding or authorization failure).
    Rejected(ProxyError),
}

impl CallFailure {
    /// Code surfaced to the submitting backend.
    pub fn code(&self) -> &str {
        match self {
            Self::Remote { code, .. } => code,
            Self::Timeout => "CallTimeout",
            Self::ConnectionLost => "ConnectionLost",
            Self::Rejected(e) => e.code(),
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Remote { description, .. } => description.clone(),
            Self::Timeout => ProxyError::CallTimeout.to_string(),
            Self::ConnectionLost => ProxyError::ConnectionLost.to_string(),
            Self::Rejected(e) => e.to_string(),
        }
    }
}

impl From<ProxyError> for CallFailure {
    fn from(e: ProxyError) -> Self {
        Self::Rejected(e)
    }
}

pub type CallOutcome = Result<Value, CallFailure>;

struct PendingEntry {
    action: String,
    reply: oneshot::Sender<CallOutcome>,
}

/// Table of in-flight proxy→charger calls.
#[derive(Default)]
pub struct PendingCalls {
    entries: DashMap<String, PendingEntry>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outbound call and receive its completion channel.
    pub fn register(&self, message_id: &str, action: &str) -> oneshot::Receiver<CallOutcome> {
        let (reply, rx) = oneshot::channel();
        self.entries.insert(
            message_id.to_string(),
            PendingEntry {
                action: action.to_string(),
                reply,
            },
        );
        rx
    }

    /// Complete an entry with the charger's CallResult payload.
    pub fn complete(&self, message_id: &str, payload: Value) {
        if let Some((_, entry)) = self.entries.remove(message_id) {
            info!(message_id, action = entry.action.as_str(), "call completed");
            let _ = entry.reply.send(Ok(payload));
        } else {
            warn!(message_id, "result for unknown call");
        }
    }

    /// Complete an entry with the charger's CallError.
    pub fn fail(&self, message_id: &str, code: &str, description: &str) {
        if let Some((_, entry)) = self.entries.remove(message_id) {
            warn!(
                message_id,
                action = entry.action.as_str(),
                code,
                description,
                "call failed"
            );
            let _ = entry.reply.send(Err(CallFailure::Remote {
                code: code.to_string(),
                description: description.to_string(),
            }));
        }
    }

    /// Drop a timed-out entry so a late result is not misdelivered.
    pub fn abandon(&self, message_id: &str) {
        self.entries.remove(message_id);
    }

    /// Flush every entry with `ConnectionLost` (charger socket gone).
    pub fn flush_connection_lost(&self) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                let _ = entry.reply.send(Err(CallFailure::ConnectionLost));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
