//! Protocol adaptation layer
//!
//! Translates between OCPP-over-WebSocket payloads and the internal
//! event/command vocabulary. One codec per wire version, selected at session
//! construction; callers see a single interface. The adapter is pure: its
//! only state is the version tag and a message-id counter.
//!
//! Inbound payloads are deserialized into `rust_ocpp` request types; replies
//! and forwarded events are emitted as raw JSON values.

pub mod v16;
pub mod v201;

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::{ChargerCommand, ChargerEvent, ChargerStatus, OcppVersion};
use crate::support::ProxyError;

// ── ChargerCall ────────────────────────────────────────────────

/// A decoded charger-initiated call, version differences already collapsed.
///
/// Every variant implies a CallResult reply, built by
/// [`ProtocolAdapter::encode_call_reply`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChargerCall {
    Boot {
        vendor: String,
        model: String,
    },
    Heartbeat,
    StatusChanged {
        connector_id: u32,
        status: ChargerStatus,
        timestamp: DateTime<Utc>,
    },
    TransactionStart {
        /// Charger-reported id; `None` for 1.6, where the proxy assigns one.
        transaction_id: Option<String>,
        connector_id: u32,
        id_tag: Option<String>,
        meter_start_wh: i64,
        timestamp: DateTime<Utc>,
    },
    MeterSample {
        transaction_id: Option<String>,
        /// `None` when the frame carried no energy-register sample.
        meter_wh: Option<i64>,
        timestamp: DateTime<Utc>,
    },
    TransactionStop {
        transaction_id: Option<String>,
        meter_stop_wh: i64,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Answered locally with an accepted id-tag info.
    Authorize { id_tag: String },
    /// Answered locally with status `Rejected` (no vendor extensions).
    DataTransfer,
}

impl ChargerCall {
    /// Convert into the broadcast event, if this call carries one.
    ///
    /// `assigned_tx_id` supplies the proxy-assigned transaction id for 1.6
    /// starts; `now` stamps calls whose wire form carries no timestamp.
    pub fn into_event(
        self,
        assigned_tx_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Option<ChargerEvent> {
        match self {
            Self::Boot { vendor, model } => Some(ChargerEvent::BootNotification {
                vendor,
                model,
                timestamp: now,
            }),
            Self::Heartbeat => Some(ChargerEvent::Heartbeat { timestamp: now }),
            Self::StatusChanged {
                connector_id,
                status,
                timestamp,
            } => Some(ChargerEvent::StatusChanged {
                connector_id,
                status,
                timestamp,
            }),
            Self::TransactionStart {
                transaction_id,
                connector_id,
                id_tag,
                meter_start_wh,
                timestamp,
            } => Some(ChargerEvent::TransactionStarted {
                transaction_id: transaction_id.or(assigned_tx_id)?,
                connector_id,
                id_tag,
                meter_start_wh,
                timestamp,
            }),
            Self::MeterSample {
                transaction_id,
                meter_wh,
                timestamp,
            } => Some(ChargerEvent::MeterSample {
                transaction_id,
                meter_wh: meter_wh?,
                timestamp,
            }),
            Self::TransactionStop {
                transaction_id,
                meter_stop_wh,
                reason,
                timestamp,
            } => Some(ChargerEvent::TransactionEnded {
                transaction_id: transaction_id.or(assigned_tx_id)?,
                meter_stop_wh,
                reason,
                timestamp,
            }),
            Self::Authorize { .. } | Self::DataTransfer => None,
        }
    }
}

// ── ProtocolAdapter ────────────────────────────────────────────

/// Version-tagged codec facade.
pub struct ProtocolAdapter {
    version: OcppVersion,
    next_id: AtomicU64,
}

impl ProtocolAdapter {
    pub fn new(version: OcppVersion) -> Self {
        Self {
            version,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn version(&self) -> OcppVersion {
        self.version
    }

    /// Monotonic per-connection message id, rendered as a decimal string.
    pub fn next_message_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Decode a charger-initiated Call. Unknown actions surface as
    /// `NotImplemented`, undecodable payloads as `MalformedPayload`.
    pub fn decode_charger_call(
        &self,
        action: &str,
        payload: &Value,
    ) -> Result<ChargerCall, ProxyError> {
        match self.version {
            OcppVersion::V16 => v16::decode_charger_call(action, payload),
            OcppVersion::V201 => v201::decode_charger_call(action, payload),
        }
    }

    /// Build the CallResult payload answering a decoded charger call.
    pub fn encode_call_reply(
        &self,
        call: &ChargerCall,
        assigned_tx_id: Option<i64>,
        boot_interval_secs: u32,
    ) -> Value {
        match self.version {
            OcppVersion::V16 => v16::encode_call_reply(call, assigned_tx_id, boot_interval_secs),
            OcppVersion::V201 => v201::encode_call_reply(call, boot_interval_secs),
        }
    }

    /// Encode an internal command as a `(action, payload)` Call for the
    /// charger (or for an outbound service's charger-facing leg).
    pub fn encode_command(&self, command: &ChargerCommand) -> Result<(String, Value), ProxyError> {
        match self.version {
            OcppVersion::V16 => v16::encode_command(command),
            OcppVersion::V201 => v201::encode_command(command),
        }
    }

    /// Decode a command-class call received from a remote OCPP service.
    pub fn decode_command(&self, action: &str, payload: &Value) -> Result<ChargerCommand, ProxyError> {
        match self.version {
            OcppVersion::V16 => v16::decode_command(action, payload),
            OcppVersion::V201 => v201::decode_command(action, payload),
        }
    }

    /// Encode an internal event as a `(action, payload)` Call on the
    /// outbound forward leg. Synthetic events have no wire form.
    pub fn encode_event(&self, event: &ChargerEvent) -> Option<(String, Value)> {
        match self.version {
            OcppVersion::V16 => v16::encode_event(event),
            OcppVersion::V201 => v201::encode_event(event),
        }
    }
}

/// Narrow a free-form stop reason to the version's reason enum vocabulary.
/// Unknown reasons become `Other`.
fn narrow_reason<'a>(reason: &str, allowed: &[&'a str]) -> &'a str {
    allowed
        .iter()
        .find(|r| **r == reason)
        .copied()
        .unwrap_or("Other")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_monotonic_decimal_strings() {
        let adapter = ProtocolAdapter::new(OcppVersion::V16);
        assert_eq!(adapter.next_message_id(), "1");
        assert_eq!(adapter.next_message_id(), "2");
        assert_eq!(adapter.next_message_id(), "3");
    }

    #[test]
    fn v16_start_call_needs_assigned_tx_id() {
        let call = ChargerCall::TransactionStart {
            transaction_id: None,
            connector_id: 1,
            id_tag: Some("ABC".into()),
            meter_start_wh: 1000,
            timestamp: Utc::now(),
        };
        let event = call.clone().into_event(Some("5".into()), Utc::now()).unwrap();
        match event {
            ChargerEvent::TransactionStarted { transaction_id, .. } => {
                assert_eq!(transaction_id, "5")
            }
            other => panic!("unexpected event {other:?}"),
        }
        // without an assigned id the call produces no event
        assert!(call.into_event(None, Utc::now()).is_none());
    }

    #[test]
    fn meter_sample_without_energy_reading_is_dropped() {
        let call = ChargerCall::MeterSample {
            transaction_id: Some("5".into()),
            meter_wh: None,
            timestamp: Utc::now(),
        };
        assert!(call.into_event(None, Utc::now()).is_none());
    }

    #[test]
    fn authorize_produces_no_event() {
        let call = ChargerCall::Authorize { id_tag: "ABC".into() };
        assert!(call.into_event(None, Utc::now()).is_none());
    }

    #[test]
    fn narrow_reason_defaults_to_other() {
        assert_eq!(narrow_reason("Remote", &["Remote", "Local"]), "Remote");
        assert_eq!(narrow_reason("Truncated", &["Remote", "Local"]), "Other");
    }
}
