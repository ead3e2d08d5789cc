//! Internal charger event vocabulary
//!
//! Everything the charger tells the proxy is normalized into this enum before
//! it reaches the session log, the arbitration engine or any backend. The two
//! connection events are synthesized by the proxy itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::ChargerStatus;
use super::version::OcppVersion;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChargerEvent {
    /// Synthetic: a charger session was established.
    ChargerConnected {
        charger_id: String,
        version: OcppVersion,
        timestamp: DateTime<Utc>,
    },
    /// Synthetic: the charger session ended (socket close or protocol error).
    ChargerDisconnected {
        charger_id: String,
        timestamp: DateTime<Utc>,
    },
    BootNotification {
        vendor: String,
        model: String,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    StatusChanged {
        connector_id: u32,
        status: ChargerStatus,
        timestamp: DateTime<Utc>,
    },
    TransactionStarted {
        /// Charger-reported transaction id (proxy-assigned for 1.6).
        transaction_id: String,
        connector_id: u32,
        id_tag: Option<String>,
        meter_start_wh: i64,
        timestamp: DateTime<Utc>,
    },
    MeterSample {
        transaction_id: Option<String>,
        meter_wh: i64,
        timestamp: DateTime<Utc>,
    },
    TransactionEnded {
        transaction_id: String,
        meter_stop_wh: i64,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl ChargerEvent {
    /// Snake-case discriminator, used for logging and metrics labels.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ChargerConnected { .. } => "charger_connected",
            Self::ChargerDisconnected { .. } => "charger_disconnected",
            Self::BootNotification { .. } => "boot_notification",
            Self::Heartbeat { .. } => "heartbeat",
            Self::StatusChanged { .. } => "status_changed",
            Self::TransactionStarted { .. } => "transaction_started",
            Self::MeterSample { .. } => "meter_sample",
            Self::TransactionEnded { .. } => "transaction_ended",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::ChargerConnected { timestamp, .. }
            | Self::ChargerDisconnected { timestamp, .. }
            | Self::BootNotification { timestamp, .. }
            | Self::Heartbeat { timestamp }
            | Self::StatusChanged { timestamp, .. }
            | Self::TransactionStarted { timestamp, .. }
            | Self::MeterSample { timestamp, .. }
            | Self::TransactionEnded { timestamp, .. } => *timestamp,
        }
    }
}
