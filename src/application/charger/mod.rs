//! Charger session manager
//!
//! Owns the single live charger connection. At most one session exists at a
//! time; a second upgrade attempt is refused at the HTTP edge (409). All
//! writes to the charger socket go through one channel consumed by one
//! writer task, preserving OCPP-J ordering.

pub mod pending;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::application::events::SharedEventBus;
use crate::domain::{ChargerCommand, ChargerEvent, ChargerStatus, OcppVersion};
use crate::protocol::{ChargerCall, ProtocolAdapter};
use crate::support::frame::{FrameParseError, OcppFrame};

pub use pending::{CallFailure, CallOutcome, PendingCalls};

/// Deadline for every proxy→charger call.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

// ── Shared connection state ────────────────────────────────────

#[derive(Debug)]
struct DynState {
    status: ChargerStatus,
    vendor: Option<String>,
    model: Option<String>,
    last_seen: DateTime<Utc>,
    open_tx: Option<String>,
}

struct ChargerShared {
    charger_id: String,
    version: OcppVersion,
    dynamic: Mutex<DynState>,
}

impl ChargerShared {
    fn touch(&self) {
        self.dynamic.lock().unwrap().last_seen = Utc::now();
    }
}

/// Read-only view of the charger connection, served by `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct ChargerSnapshot {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charger_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<OcppVersion>,
    pub status: ChargerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_transaction_id: Option<String>,
}

// ── ChargerLink ────────────────────────────────────────────────

/// Cloneable handle for submitting calls on the live charger connection.
#[derive(Clone)]
pub struct ChargerLink {
    shared: Arc<ChargerShared>,
    adapter: Arc<ProtocolAdapter>,
    writer: mpsc::UnboundedSender<String>,
    pending: Arc<PendingCalls>,
}

impl ChargerLink {
    pub fn version(&self) -> OcppVersion {
        self.shared.version
    }

    pub fn charger_id(&self) -> &str {
        &self.shared.charger_id
    }

    /// Encode and transmit a command, then await the charger's answer.
    pub async fn call(&self, command: &ChargerCommand) -> CallOutcome {
        let (action, payload) = self.adapter.encode_command(command)?;
        let message_id = self.adapter.next_message_id();
        let rx = self.pending.register(&message_id, &action);

        let frame = OcppFrame::Call {
            unique_id: message_id.clone(),
            action: action.clone(),
            payload,
        };
        if self.writer.send(frame.serialize()).is_err() {
            self.pending.abandon(&message_id);
            return Err(CallFailure::ConnectionLost);
        }
        metrics::counter!("ocpp_proxy_commands_total", "action" => command.name()).increment(1);

        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CallFailure::ConnectionLost),
            Err(_) => {
                warn!(action, message_id, "charger call timed out");
                self.pending.abandon(&message_id);
                Err(CallFailure::Timeout)
            }
        }
    }
}

// ── ChargerManager ─────────────────────────────────────────────

enum Slot {
    Free,
    Claimed,
    Active(ChargerLink),
}

/// Process-wide gate and registry for the single charger connection.
pub struct ChargerManager {
    slot: Mutex<Slot>,
    event_bus: SharedEventBus,
    boot_interval_secs: u32,
    assigned_tx: AtomicI64,
}

pub type SharedChargerManager = Arc<ChargerManager>;

impl ChargerManager {
    pub fn new(event_bus: SharedEventBus, boot_interval_secs: u32) -> SharedChargerManager {
        Arc::new(Self {
            slot: Mutex::new(Slot::Free),
            event_bus,
            boot_interval_secs,
            // seeded from wall clock so 1.6 transaction ids stay unique
            // across proxy restarts
            assigned_tx: AtomicI64::new(Utc::now().timestamp()),
        })
    }

    /// Reserve the charger slot. `None` while another session is live.
    pub fn try_claim(self: &Arc<Self>) -> Option<ChargerClaim> {
        let mut slot = self.slot.lock().unwrap();
        match *slot {
            Slot::Free => {
                *slot = Slot::Claimed;
                Some(ChargerClaim {
                    manager: self.clone(),
                })
            }
            _ => None,
        }
    }

    /// Handle for submitting calls, when a charger is connected.
    pub fn link(&self) -> Option<ChargerLink> {
        match &*self.slot.lock().unwrap() {
            Slot::Active(link) => Some(link.clone()),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.slot.lock().unwrap(), Slot::Active(_))
    }

    pub fn snapshot(&self) -> ChargerSnapshot {
        match &*self.slot.lock().unwrap() {
            Slot::Active(link) => {
                let dynamic = link.shared.dynamic.lock().unwrap();
                // a Preparing connector with an open transaction is charging
                let status = match (dynamic.status, dynamic.open_tx.is_some()) {
                    (ChargerStatus::Preparing, true) => ChargerStatus::Charging,
                    (status, _) => status,
                };
                ChargerSnapshot {
                    connected: true,
                    charger_id: Some(link.shared.charger_id.clone()),
                    version: Some(link.shared.version),
                    status,
                    vendor: dynamic.vendor.clone(),
                    model: dynamic.model.clone(),
                    last_seen: Some(dynamic.last_seen),
                    open_transaction_id: dynamic.open_tx.clone(),
                }
            }
            _ => ChargerSnapshot {
                connected: false,
                charger_id: None,
                version: None,
                status: ChargerStatus::Unknown,
                vendor: None,
                model: None,
                last_seen: None,
                open_transaction_id: None,
            },
        }
    }

    fn next_assigned_tx(&self) -> i64 {
        self.assigned_tx.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn attach(&self, link: ChargerLink) {
        *self.slot.lock().unwrap() = Slot::Active(link);
    }
}

/// Exclusive claim on the charger slot, released on drop.
pub struct ChargerClaim {
    manager: SharedChargerManager,
}

impl Drop for ChargerClaim {
    fn drop(&mut self) {
        *self.manager.slot.lock().unwrap() = Slot::Free;
    }
}

// ── Session driver ─────────────────────────────────────────────

/// Drive one charger WebSocket session to completion.
pub async fn run_charger_session(
    socket: WebSocket,
    claim: ChargerClaim,
    charger_id: String,
    version: OcppVersion,
) {
    let manager = claim.manager.clone();
    let adapter = Arc::new(ProtocolAdapter::new(version));
    let pending = Arc::new(PendingCalls::new());
    let (writer, mut writer_rx) = mpsc::unbounded_channel::<String>();

    let shared = Arc::new(ChargerShared {
        charger_id: charger_id.clone(),
        version,
        dynamic: Mutex::new(DynState {
            status: ChargerStatus::Unknown,
            vendor: None,
            model: None,
            last_seen: Utc::now(),
            open_tx: None,
        }),
    });

    let link = ChargerLink {
        shared: shared.clone(),
        adapter: adapter.clone(),
        writer: writer.clone(),
        pending: pending.clone(),
    };
    manager.attach(link);

    info!(charger_id = charger_id.as_str(), %version, "charger connected");
    manager.event_bus.publish(ChargerEvent::ChargerConnected {
        charger_id: charger_id.clone(),
        version,
        timestamp: Utc::now(),
    });

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Writer task: the only place the charger socket is written.
    let writer_id = charger_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(text) = writer_rx.recv().await {
            if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                error!(charger_id = writer_id.as_str(), error = %e, "charger send failed");
                break;
            }
        }
    });

    // Reader loop.
    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                shared.touch();
                if !handle_frame(&manager, &adapter, &shared, &pending, &writer, text.as_str()) {
                    break;
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                shared.touch();
            }
            Ok(Message::Close(frame)) => {
                info!(charger_id = charger_id.as_str(), ?frame, "charger sent close");
                break;
            }
            Ok(Message::Binary(data)) => {
                warn!(charger_id = charger_id.as_str(), bytes = data.len(), "binary frame ignored");
            }
            Err(e) => {
                error!(charger_id = charger_id.as_str(), error = %e, "charger socket error");
                break;
            }
        }
    }

    // Teardown: fail pending calls, free the slot, announce the loss.
    pending.flush_connection_lost();
    send_task.abort();
    drop(claim);
    manager
        .event_bus
        .publish(ChargerEvent::ChargerDisconnected {
            charger_id: charger_id.clone(),
            timestamp: Utc::now(),
        });
    info!(charger_id = charger_id.as_str(), "charger disconnected");
}

/// Handle one text frame. Returns `false` when the connection must close.
fn handle_frame(
    manager: &ChargerManager,
    adapter: &ProtocolAdapter,
    shared: &ChargerShared,
    pending: &PendingCalls,
    writer: &mpsc::UnboundedSender<String>,
    text: &str,
) -> bool {
    let frame = match OcppFrame::parse(text) {
        Ok(frame) => frame,
        Err(FrameParseError {
            unique_id: Some(id),
            error,
        }) => {
            warn!(charger_id = shared.charger_id.as_str(), error = %error, "malformed frame");
            let reply = OcppFrame::error_response(id, "ProtocolError", error.to_string());
            let _ = writer.send(reply.serialize());
            return true;
        }
        Err(FrameParseError { unique_id: None, error }) => {
            error!(charger_id = shared.charger_id.as_str(), error = %error, "unrecoverable frame");
            return false;
        }
    };

    match frame {
        OcppFrame::Call {
            unique_id,
            action,
            payload,
        } => match adapter.decode_charger_call(&action, &payload) {
            Ok(call) => {
                let assigned = match &call {
                    ChargerCall::TransactionStart {
                        transaction_id: None,
                        ..
                    } => Some(manager.next_assigned_tx()),
                    _ => None,
                };
                let reply_payload =
                    adapter.encode_call_reply(&call, assigned, manager.boot_interval_secs);
                let reply = OcppFrame::CallResult {
                    unique_id,
                    payload: reply_payload,
                };
                let _ = writer.send(reply.serialize());

                apply_call(shared, &call, assigned);
                if let Some(event) = call.into_event(assigned.map(|id| id.to_string()), Utc::now())
                {
                    manager.event_bus.publish(event);
                }
                true
            }
            Err(error) => {
                let code = match &error {
                    crate::support::ProxyError::NotImplemented(_) => "NotImplemented",
                    _ => "FormationViolation",
                };
                warn!(
                    charger_id = shared.charger_id.as_str(),
                    action,
                    error = %error,
                    "rejecting charger call"
                );
                let reply = OcppFrame::error_response(unique_id, code, error.to_string());
                let _ = writer.send(reply.serialize());
                true
            }
        },
        OcppFrame::CallResult { unique_id, payload } => {
            pending.complete(&unique_id, payload);
            true
        }
        OcppFrame::CallError {
            unique_id,
            error_code,
            error_description,
            ..
        } => {
            pending.fail(&unique_id, &error_code, &error_description);
            true
        }
    }
}

/// Update connection state from a decoded call.
fn apply_call(shared: &ChargerShared, call: &ChargerCall, assigned: Option<i64>) {
    let mut dynamic = shared.dynamic.lock().unwrap();
    match call {
        ChargerCall::Boot { vendor, model } => {
            dynamic.vendor = Some(vendor.clone());
            dynamic.model = Some(model.clone());
        }
        ChargerCall::StatusChanged { status, .. } => {
            dynamic.status = *status;
        }
        ChargerCall::TransactionStart { transaction_id, .. } => {
            dynamic.open_tx = transaction_id
                .clone()
                .or_else(|| assigned.map(|id| id.to_string()));
        }
        ChargerCall::TransactionStop { .. } => {
            dynamic.open_tx = None;
        }
        _ => {}
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::events::EventBus;
    use serde_json::json;

    fn test_manager() -> SharedChargerManager {
        ChargerManager::new(Arc::new(EventBus::new()), 300)
    }

    fn test_parts(
        manager: &SharedChargerManager,
        version: OcppVersion,
    ) -> (
        Arc<ProtocolAdapter>,
        Arc<ChargerShared>,
        Arc<PendingCalls>,
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let adapter = Arc::new(ProtocolAdapter::new(version));
        let pending = Arc::new(PendingCalls::new());
        let (writer, writer_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ChargerShared {
            charger_id: "charger".into(),
            version,
            dynamic: Mutex::new(DynState {
                status: ChargerStatus::Unknown,
                vendor: None,
                model: None,
                last_seen: Utc::now(),
                open_tx: None,
            }),
        });
        let link = ChargerLink {
            shared: shared.clone(),
            adapter: adapter.clone(),
            writer: writer.clone(),
            pending: pending.clone(),
        };
        manager.attach(link);
        (adapter, shared, pending, writer, writer_rx)
    }

    #[test]
    fn claim_is_exclusive() {
        let manager = test_manager();
        let claim = manager.try_claim().expect("first claim");
        assert!(manager.try_claim().is_none());
        drop(claim);
        assert!(manager.try_claim().is_some());
    }

    #[test]
    fn snapshot_reflects_connection_state() {
        let manager = test_manager();
        assert!(!manager.snapshot().connected);

        let _claim = manager.try_claim().unwrap();
        let (_adapter, shared, _pending, _writer, _writer_rx) =
            test_parts(&manager, OcppVersion::V16);
        assert!(manager.is_connected());
        let snapshot = manager.snapshot();
        assert!(snapshot.connected);
        assert_eq!(snapshot.version, Some(OcppVersion::V16));

        // a Preparing connector with an open transaction reads as Charging
        {
            let mut dynamic = shared.dynamic.lock().unwrap();
            dynamic.status = ChargerStatus::Preparing;
            dynamic.open_tx = Some("5".into());
        }
        assert_eq!(manager.snapshot().status, ChargerStatus::Charging);
    }

    #[tokio::test]
    async fn heartbeat_call_gets_current_time_reply() {
        let manager = test_manager();
        let _claim = manager.try_claim().unwrap();
        let (adapter, shared, pending, writer, mut writer_rx) =
            test_parts(&manager, OcppVersion::V16);

        assert!(handle_frame(
            &manager,
            &adapter,
            &shared,
            &pending,
            &writer,
            r#"[2,"10","Heartbeat",{}]"#,
        ));
        let reply = writer_rx.recv().await.unwrap();
        match OcppFrame::parse(&reply).unwrap() {
            OcppFrame::CallResult { unique_id, payload } => {
                assert_eq!(unique_id, "10");
                assert!(payload["currentTime"].is_string());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_action_answers_not_implemented() {
        let manager = test_manager();
        let _claim = manager.try_claim().unwrap();
        let (adapter, shared, pending, writer, mut writer_rx) =
            test_parts(&manager, OcppVersion::V16);

        handle_frame(
            &manager,
            &adapter,
            &shared,
            &pending,
            &writer,
            r#"[2,"11","SignCertificate",{}]"#,
        );
        let reply = writer_rx.recv().await.unwrap();
        match OcppFrame::parse(&reply).unwrap() {
            OcppFrame::CallError { error_code, .. } => assert_eq!(error_code, "NotImplemented"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_transaction_assigns_id_and_publishes_event() {
        let bus = Arc::new(EventBus::new());
        let manager = ChargerManager::new(bus.clone(), 300);
        let _claim = manager.try_claim().unwrap();
        let (adapter, shared, pending, writer, mut writer_rx) =
            test_parts(&manager, OcppVersion::V16);
        let mut sub = bus.subscribe();

        handle_frame(
            &manager,
            &adapter,
            &shared,
            &pending,
            &writer,
            r#"[2,"12","StartTransaction",{"connectorId":1,"idTag":"ABC","meterStart":1000,"timestamp":"2024-05-01T10:00:00Z"}]"#,
        );

        let reply = writer_rx.recv().await.unwrap();
        let assigned = match OcppFrame::parse(&reply).unwrap() {
            OcppFrame::CallResult { payload, .. } => {
                assert_eq!(payload["idTagInfo"]["status"], "Accepted");
                payload["transactionId"].as_i64().unwrap()
            }
            other => panic!("unexpected {other:?}"),
        };
        assert!(assigned > 0);

        match sub.recv().await.unwrap() {
            ChargerEvent::TransactionStarted {
                transaction_id,
                meter_start_wh,
                ..
            } => {
                assert_eq!(transaction_id, assigned.to_string());
                assert_eq!(meter_start_wh, 1000);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            shared.dynamic.lock().unwrap().open_tx.as_deref(),
            Some(assigned.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn call_result_completes_pending_entry() {
        let manager = test_manager();
        let _claim = manager.try_claim().unwrap();
        let (adapter, shared, pending, writer, _writer_rx) =
            test_parts(&manager, OcppVersion::V16);

        let rx = pending.register("7", "Reset");
        handle_frame(
            &manager,
            &adapter,
            &shared,
            &pending,
            &writer,
            r#"[3,"7",{"status":"Accepted"}]"#,
        );
        assert_eq!(rx.await.unwrap().unwrap()["status"], "Accepted");
    }

    #[tokio::test]
    async fn malformed_frame_with_id_answers_protocol_error() {
        let manager = test_manager();
        let _claim = manager.try_claim().unwrap();
        let (adapter, shared, pending, writer, mut writer_rx) =
            test_parts(&manager, OcppVersion::V16);

        assert!(handle_frame(
            &manager,
            &adapter,
            &shared,
            &pending,
            &writer,
            r#"[9,"40","Nope",{}]"#,
        ));
        let reply = writer_rx.recv().await.unwrap();
        match OcppFrame::parse(&reply).unwrap() {
            OcppFrame::CallError { error_code, .. } => assert_eq!(error_code, "ProtocolError"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unrecoverable_frame_closes_connection() {
        let manager = test_manager();
        let _claim = manager.try_claim().unwrap();
        let (adapter, shared, pending, writer, _writer_rx) =
            test_parts(&manager, OcppVersion::V16);

        assert!(!handle_frame(
            &manager, &adapter, &shared, &pending, &writer, "{not json",
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn link_call_times_out() {
        let manager = test_manager();
        let _claim = manager.try_claim().unwrap();
        let (_adapter, _shared, _pending, _writer, _writer_rx) =
            test_parts(&manager, OcppVersion::V16);
        let link = manager.link().unwrap();

        let call = tokio::spawn(async move {
            link.call(&ChargerCommand::Reset {
                kind: crate::domain::ResetKind::Soft,
            })
            .await
        });
        // let the call register its timer before advancing the clock
        tokio::task::yield_now().await;
        tokio::time::advance(CALL_TIMEOUT + Duration::from_secs(1)).await;
        match call.await.unwrap() {
            Err(CallFailure::Timeout) => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
