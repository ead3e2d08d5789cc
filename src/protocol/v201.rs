//! OCPP 2.0.1 codec
//!
//! 2.0.1 folds the 1.6 transaction lifecycle into `TransactionEvent`; the
//! `event_type` field selects Started / Updated / Ended. Status enums are
//! narrower than 1.6: `Occupied` widens to `Preparing` on decode (the
//! charger session reports `Charging` while a transaction is open).

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_ocpp::v2_0_1::datatypes::evse_type::EVSEType;
use rust_ocpp::v2_0_1::datatypes::id_token_type::IdTokenType;
use rust_ocpp::v2_0_1::datatypes::meter_value_type::MeterValueType;
use rust_ocpp::v2_0_1::enumerations::connector_status_enum_type::ConnectorStatusEnumType;
use rust_ocpp::v2_0_1::enumerations::id_token_enum_type::IdTokenEnumType;
use rust_ocpp::v2_0_1::enumerations::measurand_enum_type::MeasurandEnumType;
use rust_ocpp::v2_0_1::enumerations::operational_status_enum_type::OperationalStatusEnumType;
use rust_ocpp::v2_0_1::enumerations::reset_enum_type::ResetEnumType;
use rust_ocpp::v2_0_1::enumerations::transaction_event_enum_type::TransactionEventEnumType;
use rust_ocpp::v2_0_1::messages::authorize::AuthorizeRequest;
use rust_ocpp::v2_0_1::messages::boot_notification::BootNotificationRequest;
use rust_ocpp::v2_0_1::messages::change_availability::ChangeAvailabilityRequest;
use rust_ocpp::v2_0_1::messages::meter_values::MeterValuesRequest;
use rust_ocpp::v2_0_1::messages::request_start_transaction::RequestStartTransactionRequest;
use rust_ocpp::v2_0_1::messages::request_stop_transaction::RequestStopTransactionRequest;
use rust_ocpp::v2_0_1::messages::reset::ResetRequest;
use rust_ocpp::v2_0_1::messages::status_notification::StatusNotificationRequest;
use rust_ocpp::v2_0_1::messages::transaction_event::TransactionEventRequest;
use serde_json::{json, Value};

use crate::domain::{AvailabilityKind, ChargerCommand, ChargerEvent, ChargerStatus, ResetKind};
use crate::support::ProxyError;

use super::{narrow_reason, ChargerCall};

/// Stop reasons expressible in the 2.0.1 `Reason` enum.
const REASONS: &[&str] = &[
    "DeAuthorized",
    "EmergencyStop",
    "EnergyLimitReached",
    "EVDisconnected",
    "GroundFault",
    "ImmediateReset",
    "Local",
    "LocalOutOfCredit",
    "MasterPass",
    "Other",
    "OvercurrentFault",
    "PowerLoss",
    "PowerQuality",
    "Reboot",
    "Remote",
    "SOCLimitReached",
    "StoppedByEV",
    "TimeLimitReached",
    "Timeout",
];

fn malformed(action: &str, e: impl std::fmt::Display) -> ProxyError {
    ProxyError::MalformedPayload(format!("{action}: {e}"))
}

// ── Decoding charger calls ─────────────────────────────────────

pub fn decode_charger_call(action: &str, payload: &Value) -> Result<ChargerCall, ProxyError> {
    match action {
        "BootNotification" => {
            // Some stations omit the mandatory `reason`; inject a default so
            // the message is not rejected.
            let mut patched = payload.clone();
            if let Some(obj) = patched.as_object_mut() {
                obj.entry("reason").or_insert(json!("PowerUp"));
            }
            let req: BootNotificationRequest =
                serde_json::from_value(patched).map_err(|e| malformed(action, e))?;
            Ok(ChargerCall::Boot {
                vendor: req.charging_station.vendor_name,
                model: req.charging_station.model,
            })
        }
        "Heartbeat" => Ok(ChargerCall::Heartbeat),
        "StatusNotification" => {
            let req: StatusNotificationRequest =
                serde_json::from_value(payload.clone()).map_err(|e| malformed(action, e))?;
            Ok(ChargerCall::StatusChanged {
                connector_id: req.evse_id as u32,
                status: map_status(&req.connector_status),
                timestamp: req.timestamp,
            })
        }
        "TransactionEvent" => {
            let req: TransactionEventRequest =
                serde_json::from_value(payload.clone()).map_err(|e| malformed(action, e))?;
            Ok(decode_transaction_event(req))
        }
        "MeterValues" => {
            let req: MeterValuesRequest =
                serde_json::from_value(payload.clone()).map_err(|e| malformed(action, e))?;
            let (meter_wh, ts) = extract_energy(Some(&req.meter_value));
            Ok(ChargerCall::MeterSample {
                transaction_id: None,
                meter_wh,
                timestamp: ts.unwrap_or_else(Utc::now),
            })
        }
        "Authorize" => {
            let req: AuthorizeRequest =
                serde_json::from_value(payload.clone()).map_err(|e| malformed(action, e))?;
            Ok(ChargerCall::Authorize {
                id_tag: req.id_token.id_token,
            })
        }
        "DataTransfer" => Ok(ChargerCall::DataTransfer),
        other => Err(ProxyError::NotImplemented(other.to_string())),
    }
}

fn decode_transaction_event(req: TransactionEventRequest) -> ChargerCall {
    let tx_id = Some(req.transaction_info.transaction_id.clone()).filter(|t| !t.is_empty());
    let connector_id = req.evse.as_ref().map(|e| e.id as u32).unwrap_or(1);
    let id_tag = req
        .id_token
        .as_ref()
        .map(|t| t.id_token.clone())
        .filter(|t| !t.is_empty());
    let (energy_wh, _) = extract_energy(req.meter_value.as_ref());

    match req.event_type {
        TransactionEventEnumType::Started => ChargerCall::TransactionStart {
            transaction_id: tx_id,
            connector_id,
            id_tag,
            meter_start_wh: energy_wh.unwrap_or(0),
            timestamp: req.timestamp,
        },
        TransactionEventEnumType::Updated => ChargerCall::MeterSample {
            transaction_id: tx_id,
            meter_wh: energy_wh,
            timestamp: req.timestamp,
        },
        TransactionEventEnumType::Ended => ChargerCall::TransactionStop {
            transaction_id: tx_id,
            meter_stop_wh: energy_wh.unwrap_or(0),
            reason: req
                .transaction_info
                .stopped_reason
                .as_ref()
                .map(|r| format!("{r:?}")),
            timestamp: req.timestamp,
        },
    }
}

fn map_status(status: &ConnectorStatusEnumType) -> ChargerStatus {
    match status {
        ConnectorStatusEnumType::Available => ChargerStatus::Available,
        // no transaction id has been reported within this message
        ConnectorStatusEnumType::Occupied => ChargerStatus::Preparing,
        ConnectorStatusEnumType::Reserved => ChargerStatus::Reserved,
        ConnectorStatusEnumType::Unavailable => ChargerStatus::Unavailable,
        ConnectorStatusEnumType::Faulted => ChargerStatus::Faulted,
    }
}

fn status_wire_name(status: ChargerStatus) -> &'static str {
    match status {
        ChargerStatus::Available => "Available",
        ChargerStatus::Preparing
        | ChargerStatus::Charging
        | ChargerStatus::SuspendedEV
        | ChargerStatus::SuspendedEVSE
        | ChargerStatus::Finishing => "Occupied",
        ChargerStatus::Reserved => "Reserved",
        ChargerStatus::Unavailable | ChargerStatus::Unknown => "Unavailable",
        ChargerStatus::Faulted => "Faulted",
    }
}

/// Latest `Energy.Active.Import.Register` sample, scaled to Wh.
fn extract_energy(
    meter_values: Option<&Vec<MeterValueType>>,
) -> (Option<i64>, Option<chrono::DateTime<Utc>>) {
    let mut energy = None;
    let mut ts = None;
    if let Some(meter_values) = meter_values {
        for mv in meter_values {
            for sampled in &mv.sampled_value {
                let measurand = sampled
                    .measurand
                    .clone()
                    .unwrap_or(MeasurandEnumType::EnergyActiveImportRegister);
                if !matches!(measurand, MeasurandEnumType::EnergyActiveImportRegister) {
                    continue;
                }
                let Some(value) = sampled.value.to_f64() else {
                    continue;
                };
                let is_kwh = sampled
                    .unit_of_measure
                    .as_ref()
                    .and_then(|u| u.unit.as_ref())
                    .map(|u| u.eq_ignore_ascii_case("kWh"))
                    .unwrap_or(false);
                energy = Some(if is_kwh { (value * 1000.0).round() as i64 } else { value.round() as i64 });
                ts = Some(mv.timestamp);
            }
        }
    }
    (energy, ts)
}

// ── Replies to charger calls ───────────────────────────────────

pub fn encode_call_reply(call: &ChargerCall, boot_interval_secs: u32) -> Value {
    match call {
        ChargerCall::Boot { .. } => json!({
            "currentTime": Utc::now(),
            "interval": boot_interval_secs,
            "status": "Accepted",
        }),
        ChargerCall::Heartbeat => json!({ "currentTime": Utc::now() }),
        ChargerCall::TransactionStart { id_tag, .. } if id_tag.is_some() => {
            json!({ "idTokenInfo": { "status": "Accepted" } })
        }
        ChargerCall::Authorize { .. } => json!({ "idTokenInfo": { "status": "Accepted" } }),
        ChargerCall::DataTransfer => json!({ "status": "Rejected" }),
        _ => json!({}),
    }
}

// ── Commands ───────────────────────────────────────────────────

pub fn encode_command(command: &ChargerCommand) -> Result<(String, Value), ProxyError> {
    let (action, payload) = match command {
        ChargerCommand::RemoteStart {
            id_tag,
            connector_id,
        } => {
            let req = RequestStartTransactionRequest {
                evse_id: Some(*connector_id as i32),
                remote_start_id: 1,
                id_token: IdTokenType {
                    id_token: id_tag.clone(),
                    kind: IdTokenEnumType::Central,
                    additional_info: None,
                },
                charging_profile: None,
                group_id_token: None,
            };
            ("RequestStartTransaction", to_value(&req)?)
        }
        ChargerCommand::RemoteStop { transaction_id } => {
            let req = RequestStopTransactionRequest {
                transaction_id: transaction_id.clone(),
            };
            ("RequestStopTransaction", to_value(&req)?)
        }
        ChargerCommand::Reset { kind } => {
            let req = ResetRequest {
                request_type: match kind {
                    // 1.6 Hard → 2.0.1 Immediate, Soft → OnIdle
                    ResetKind::Hard => ResetEnumType::Immediate,
                    ResetKind::Soft => ResetEnumType::OnIdle,
                },
                evse_id: None,
            };
            ("Reset", to_value(&req)?)
        }
        ChargerCommand::ChangeAvailability { connector_id, kind } => {
            let req = ChangeAvailabilityRequest {
                operational_status: match kind {
                    AvailabilityKind::Operative => OperationalStatusEnumType::Operative,
                    AvailabilityKind::Inoperative => OperationalStatusEnumType::Inoperative,
                },
                // evse_id 0 applies to the entire station
                evse: (*connector_id > 0).then(|| EVSEType {
                    id: *connector_id as i32,
                    connector_id: None,
                }),
            };
            ("ChangeAvailability", to_value(&req)?)
        }
    };
    Ok((action.to_string(), payload))
}

pub fn decode_command(action: &str, payload: &Value) -> Result<ChargerCommand, ProxyError> {
    match action {
        "RequestStartTransaction" => {
            let req: RequestStartTransactionRequest =
                serde_json::from_value(payload.clone()).map_err(|e| malformed(action, e))?;
            Ok(ChargerCommand::RemoteStart {
                id_tag: req.id_token.id_token,
                connector_id: req.evse_id.unwrap_or(1) as u32,
            })
        }
        "RequestStopTransaction" => {
            let req: RequestStopTransactionRequest =
                serde_json::from_value(payload.clone()).map_err(|e| malformed(action, e))?;
            Ok(ChargerCommand::RemoteStop {
                transaction_id: req.transaction_id,
            })
        }
        "Reset" => {
            let req: ResetRequest =
                serde_json::from_value(payload.clone()).map_err(|e| malformed(action, e))?;
            Ok(ChargerCommand::Reset {
                kind: match req.request_type {
                    ResetEnumType::Immediate => ResetKind::Hard,
                    ResetEnumType::OnIdle => ResetKind::Soft,
                },
            })
        }
        "ChangeAvailability" => {
            let req: ChangeAvailabilityRequest =
                serde_json::from_value(payload.clone()).map_err(|e| malformed(action, e))?;
            Ok(ChargerCommand::ChangeAvailability {
                connector_id: req.evse.map(|e| e.id as u32).unwrap_or(0),
                kind: match req.operational_status {
                    OperationalStatusEnumType::Operative => AvailabilityKind::Operative,
                    OperationalStatusEnumType::Inoperative => AvailabilityKind::Inoperative,
                },
            })
        }
        other => Err(ProxyError::NotImplemented(other.to_string())),
    }
}

fn to_value<T: serde::Serialize>(req: &T) -> Result<Value, ProxyError> {
    serde_json::to_value(req).map_err(|e| ProxyError::MalformedPayload(e.to_string()))
}

// ── Events (outbound forward leg) ──────────────────────────────

pub fn encode_event(event: &ChargerEvent) -> Option<(String, Value)> {
    let (action, payload) = match event {
        ChargerEvent::BootNotification { vendor, model, .. } => (
            "BootNotification",
            json!({
                "chargingStation": { "vendorName": vendor, "model": model },
                "reason": "PowerUp",
            }),
        ),
        ChargerEvent::Heartbeat { .. } => ("Heartbeat", json!({})),
        ChargerEvent::StatusChanged {
            connector_id,
            status,
            timestamp,
        } => (
            "StatusNotification",
            json!({
                "timestamp": timestamp,
                "connectorStatus": status_wire_name(*status),
                "evseId": connector_id,
                "connectorId": 1,
            }),
        ),
        ChargerEvent::TransactionStarted {
            transaction_id,
            connector_id,
            id_tag,
            meter_start_wh,
            timestamp,
        } => {
            let mut payload = transaction_event(
                "Started",
                "CablePluggedIn",
                transaction_id,
                *meter_start_wh,
                timestamp,
            );
            payload["evse"] = json!({ "id": connector_id });
            if let Some(tag) = id_tag {
                payload["idToken"] = json!({ "idToken": tag, "type": "Central" });
            }
            ("TransactionEvent", payload)
        }
        ChargerEvent::MeterSample {
            transaction_id,
            meter_wh,
            timestamp,
        } => (
            "TransactionEvent",
            transaction_event(
                "Updated",
                "MeterValuePeriodic",
                transaction_id.as_deref().unwrap_or_default(),
                *meter_wh,
                timestamp,
            ),
        ),
        ChargerEvent::TransactionEnded {
            transaction_id,
            meter_stop_wh,
            reason,
            timestamp,
        } => {
            let mut payload = transaction_event(
                "Ended",
                "EVDeparted",
                transaction_id,
                *meter_stop_wh,
                timestamp,
            );
            if let Some(reason) = reason {
                payload["transactionInfo"]["stoppedReason"] = json!(narrow_reason(reason, REASONS));
            }
            ("TransactionEvent", payload)
        }
        ChargerEvent::ChargerConnected { .. } | ChargerEvent::ChargerDisconnected { .. } => {
            return None
        }
    };
    Some((action.to_string(), payload))
}

fn transaction_event(
    event_type: &str,
    trigger: &str,
    transaction_id: &str,
    energy_wh: i64,
    timestamp: &chrono::DateTime<Utc>,
) -> Value {
    json!({
        "eventType": event_type,
        "timestamp": timestamp,
        "triggerReason": trigger,
        "seqNo": 0,
        "transactionInfo": { "transactionId": transaction_id },
        "meterValue": [{
            "timestamp": timestamp,
            "sampledValue": [{
                "value": energy_wh,
                "measurand": "Energy.Active.Import.Register",
                "unitOfMeasure": { "unit": "Wh" },
            }],
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn ts() -> DateTime<Utc> {
        "2024-05-01T10:00:00Z".parse().unwrap()
    }

    #[test]
    fn transaction_event_started_maps_to_transaction_start() {
        let call = decode_charger_call(
            "TransactionEvent",
            &json!({
                "eventType": "Started",
                "timestamp": "2024-05-01T10:00:00Z",
                "triggerReason": "CablePluggedIn",
                "seqNo": 1,
                "transactionInfo": { "transactionId": "tx-9" },
                "evse": { "id": 1 },
                "idToken": { "idToken": "ABC", "type": "ISO14443" },
                "meterValue": [{
                    "timestamp": "2024-05-01T10:00:00Z",
                    "sampledValue": [{ "value": 1000, "measurand": "Energy.Active.Import.Register" }],
                }],
            }),
        )
        .unwrap();
        assert_eq!(
            call,
            ChargerCall::TransactionStart {
                transaction_id: Some("tx-9".into()),
                connector_id: 1,
                id_tag: Some("ABC".into()),
                meter_start_wh: 1000,
                timestamp: ts(),
            }
        );
    }

    #[test]
    fn transaction_event_updated_maps_to_meter_sample() {
        let call = decode_charger_call(
            "TransactionEvent",
            &json!({
                "eventType": "Updated",
                "timestamp": "2024-05-01T10:05:00Z",
                "triggerReason": "MeterValuePeriodic",
                "seqNo": 2,
                "transactionInfo": { "transactionId": "tx-9" },
                "meterValue": [{
                    "timestamp": "2024-05-01T10:05:00Z",
                    "sampledValue": [{ "value": 2.5, "measurand": "Energy.Active.Import.Register",
                                       "unitOfMeasure": { "unit": "kWh" } }],
                }],
            }),
        )
        .unwrap();
        assert_eq!(
            call,
            ChargerCall::MeterSample {
                transaction_id: Some("tx-9".into()),
                meter_wh: Some(2500),
                timestamp: "2024-05-01T10:05:00Z".parse().unwrap(),
            }
        );
    }

    #[test]
    fn transaction_event_ended_maps_to_transaction_stop() {
        let call = decode_charger_call(
            "TransactionEvent",
            &json!({
                "eventType": "Ended",
                "timestamp": "2024-05-01T11:00:00Z",
                "triggerReason": "EVDeparted",
                "seqNo": 3,
                "transactionInfo": { "transactionId": "tx-9", "stoppedReason": "Remote" },
                "meterValue": [{
                    "timestamp": "2024-05-01T11:00:00Z",
                    "sampledValue": [{ "value": 3500, "measurand": "Energy.Active.Import.Register" }],
                }],
            }),
        )
        .unwrap();
        assert_eq!(
            call,
            ChargerCall::TransactionStop {
                transaction_id: Some("tx-9".into()),
                meter_stop_wh: 3500,
                reason: Some("Remote".into()),
                timestamp: "2024-05-01T11:00:00Z".parse().unwrap(),
            }
        );
    }

    #[test]
    fn occupied_widens_to_preparing() {
        let call = decode_charger_call(
            "StatusNotification",
            &json!({
                "timestamp": "2024-05-01T10:00:00Z",
                "connectorStatus": "Occupied",
                "evseId": 1,
                "connectorId": 1,
            }),
        )
        .unwrap();
        assert_eq!(
            call,
            ChargerCall::StatusChanged {
                connector_id: 1,
                status: ChargerStatus::Preparing,
                timestamp: ts(),
            }
        );
    }

    #[test]
    fn boot_without_reason_is_tolerated() {
        let call = decode_charger_call(
            "BootNotification",
            &json!({ "chargingStation": { "vendorName": "ACME", "model": "Two" } }),
        )
        .unwrap();
        assert_eq!(
            call,
            ChargerCall::Boot {
                vendor: "ACME".into(),
                model: "Two".into(),
            }
        );
    }

    #[test]
    fn unknown_action_is_not_implemented() {
        let err = decode_charger_call("GetBaseReport", &json!({})).unwrap_err();
        assert_eq!(err.code(), "NotImplemented");
    }

    #[test]
    fn started_reply_includes_id_token_info_only_with_tag() {
        let with_tag = ChargerCall::TransactionStart {
            transaction_id: Some("t".into()),
            connector_id: 1,
            id_tag: Some("ABC".into()),
            meter_start_wh: 0,
            timestamp: ts(),
        };
        assert_eq!(
            encode_call_reply(&with_tag, 300)["idTokenInfo"]["status"],
            "Accepted"
        );

        let without_tag = ChargerCall::TransactionStart {
            transaction_id: Some("t".into()),
            connector_id: 1,
            id_tag: None,
            meter_start_wh: 0,
            timestamp: ts(),
        };
        assert_eq!(encode_call_reply(&without_tag, 300), json!({}));
    }

    #[test]
    fn command_encode_decode_roundtrip() {
        let commands = [
            ChargerCommand::RemoteStart {
                id_tag: "ABC".into(),
                connector_id: 1,
            },
            ChargerCommand::RemoteStop {
                transaction_id: "tx-9".into(),
            },
            ChargerCommand::Reset {
                kind: ResetKind::Soft,
            },
            ChargerCommand::ChangeAvailability {
                connector_id: 2,
                kind: AvailabilityKind::Operative,
            },
            ChargerCommand::ChangeAvailability {
                connector_id: 0,
                kind: AvailabilityKind::Inoperative,
            },
        ];
        for cmd in commands {
            let (action, payload) = encode_command(&cmd).unwrap();
            let back = decode_command(&action, &payload).unwrap();
            assert_eq!(back, cmd);
        }
    }

    #[test]
    fn remote_start_encodes_request_start_transaction() {
        let (action, payload) = encode_command(&ChargerCommand::RemoteStart {
            id_tag: "ABC".into(),
            connector_id: 1,
        })
        .unwrap();
        assert_eq!(action, "RequestStartTransaction");
        assert_eq!(payload["idToken"]["idToken"], "ABC");
        assert_eq!(payload["evseId"], 1);
    }

    #[test]
    fn event_roundtrip_is_identity() {
        let events = [
            ChargerEvent::TransactionStarted {
                transaction_id: "tx-9".into(),
                connector_id: 1,
                id_tag: Some("ABC".into()),
                meter_start_wh: 1000,
                timestamp: ts(),
            },
            ChargerEvent::MeterSample {
                transaction_id: Some("tx-9".into()),
                meter_wh: 2200,
                timestamp: ts(),
            },
            ChargerEvent::TransactionEnded {
                transaction_id: "tx-9".into(),
                meter_stop_wh: 3500,
                reason: Some("Remote".into()),
                timestamp: ts(),
            },
            ChargerEvent::StatusChanged {
                connector_id: 1,
                status: ChargerStatus::Faulted,
                timestamp: ts(),
            },
        ];
        for event in events {
            let (action, payload) = encode_event(&event).unwrap();
            let call = decode_charger_call(&action, &payload).unwrap();
            let back = call.into_event(None, ts()).unwrap();
            assert_eq!(back, event);
        }
    }

    #[test]
    fn same_internal_event_from_both_wire_dialects() {
        // a 2.0.1 TransactionEvent Started and a 1.6 StartTransaction
        // normalize to the same internal event
        let v201_call = decode_charger_call(
            "TransactionEvent",
            &json!({
                "eventType": "Started",
                "timestamp": "2024-05-01T10:00:00Z",
                "triggerReason": "CablePluggedIn",
                "seqNo": 1,
                "transactionInfo": { "transactionId": "5" },
                "evse": { "id": 1 },
                "idToken": { "idToken": "ABC", "type": "Central" },
                "meterValue": [{
                    "timestamp": "2024-05-01T10:00:00Z",
                    "sampledValue": [{ "value": 1000 }],
                }],
            }),
        )
        .unwrap();
        let v16_call = super::super::v16::decode_charger_call(
            "StartTransaction",
            &json!({
                "connectorId": 1,
                "idTag": "ABC",
                "meterStart": 1000,
                "timestamp": "2024-05-01T10:00:00Z",
            }),
        )
        .unwrap();
        let from_v201 = v201_call.into_event(None, ts()).unwrap();
        let from_v16 = v16_call.into_event(Some("5".into()), ts()).unwrap();
        assert_eq!(from_v201, from_v16);
    }
}
