//! Internal charger command vocabulary
//!
//! Version-agnostic commands a lock-holding backend may submit. The wire
//! shape (camelCase fields under a `type` tag) is part of the backend control
//! protocol contract.

use serde::{Deserialize, Serialize};

/// Reset kind, mapped per version: 1.6 `Soft`/`Hard`, 2.0.1 `OnIdle`/`Immediate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetKind {
    Soft,
    Hard,
}

/// Availability target, mapped per version: 1.6 `Operative`/`Inoperative`,
/// 2.0.1 operational status of the EVSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AvailabilityKind {
    Operative,
    Inoperative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChargerCommand {
    #[serde(rename_all = "camelCase")]
    RemoteStart {
        id_tag: String,
        connector_id: u32,
    },
    #[serde(rename_all = "camelCase")]
    RemoteStop {
        /// Charger-reported transaction id (decimal string for 1.6).
        transaction_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Reset { kind: ResetKind },
    #[serde(rename_all = "camelCase")]
    ChangeAvailability {
        connector_id: u32,
        kind: AvailabilityKind,
    },
}

impl ChargerCommand {
    /// Discriminator used for logging and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RemoteStart { .. } => "RemoteStart",
            Self::RemoteStop { .. } => "RemoteStop",
            Self::Reset { .. } => "Reset",
            Self::ChangeAvailability { .. } => "ChangeAvailability",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_matches_backend_protocol() {
        let cmd = ChargerCommand::RemoteStart {
            id_tag: "ABC".into(),
            connector_id: 1,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "RemoteStart", "idTag": "ABC", "connectorId": 1})
        );
    }

    #[test]
    fn parses_backend_command_frame_payload() {
        let cmd: ChargerCommand = serde_json::from_value(serde_json::json!({
            "type": "ChangeAvailability", "connectorId": 0, "kind": "Inoperative"
        }))
        .unwrap();
        assert_eq!(
            cmd,
            ChargerCommand::ChangeAvailability {
                connector_id: 0,
                kind: AvailabilityKind::Inoperative
            }
        );
    }

    #[test]
    fn reset_roundtrip() {
        let cmd = ChargerCommand::Reset { kind: ResetKind::Hard };
        let back: ChargerCommand =
            serde_json::from_str(&serde_json::to_string(&cmd).unwrap()).unwrap();
        assert_eq!(back, cmd);
    }
}
