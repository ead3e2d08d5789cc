//! Outbound OCPP client supervisor
//!
//! One long-lived WebSocket client per configured service. On its forward
//! leg the proxy plays the charge point: telemetry events are re-encoded as
//! OCPP calls for the remote CSMS. Toward the arbitration engine the client
//! is an ordinary backend: command calls arriving from the remote service
//! are decoded to internal commands, control is requested implicitly, and
//! outcomes are reported back as CallResult/CallError.
//!
//! Reconnection backs off exponentially from 1 s to 60 s with 20 % jitter.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::application::arbitration::ArbiterHandle;
use crate::application::charger::PendingCalls;
use crate::application::registry::{BackendRegistration, SharedBackendRegistry};
use crate::backends::ServerFrame;
use crate::config::{AuthType, OcppServiceConfig};
use crate::domain::{BackendKind, BackendSnapshot, BackendState, ChargerEvent};
use crate::protocol::ProtocolAdapter;
use crate::support::backoff::Backoff;
use crate::support::frame::OcppFrame;
use crate::support::{ProxyError, ShutdownSignal};

/// Connection states of configured services, merged into `GET /status` for
/// clients that are currently offline.
#[derive(Default)]
pub struct OutboundSupervisor {
    states: DashMap<String, BackendState>,
}

pub type SharedOutboundSupervisor = Arc<OutboundSupervisor>;

impl OutboundSupervisor {
    /// Snapshots for configured services without a live registration.
    pub fn offline_snapshots(
        &self,
        registry: &crate::application::registry::BackendRegistry,
    ) -> Vec<BackendSnapshot> {
        let mut snapshots: Vec<BackendSnapshot> = self
            .states
            .iter()
            .filter(|entry| !registry.contains(entry.key()))
            .map(|entry| BackendSnapshot {
                id: entry.key().clone(),
                kind: BackendKind::Outbound,
                state: *entry.value(),
                subscribed: false,
                dropped_frames: 0,
            })
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    fn set_state(&self, id: &str, state: BackendState) {
        self.states.insert(id.to_string(), state);
    }
}

/// Spawn one supervised client per enabled service.
pub fn spawn_outbound_clients(
    services: Vec<OcppServiceConfig>,
    registry: SharedBackendRegistry,
    arbiter: ArbiterHandle,
    shutdown: ShutdownSignal,
) -> SharedOutboundSupervisor {
    let supervisor = Arc::new(OutboundSupervisor::default());
    for service in services.into_iter().filter(|s| s.enabled) {
        supervisor.set_state(&service.id, BackendState::Connecting);
        tokio::spawn(client_loop(
            service,
            registry.clone(),
            arbiter.clone(),
            supervisor.clone(),
            shutdown.clone(),
        ));
    }
    supervisor
}

async fn client_loop(
    service: OcppServiceConfig,
    registry: SharedBackendRegistry,
    arbiter: ArbiterHandle,
    supervisor: SharedOutboundSupervisor,
    shutdown: ShutdownSignal,
) {
    let mut backoff = Backoff::default();
    loop {
        if shutdown.is_triggered() {
            break;
        }
        supervisor.set_state(&service.id, BackendState::Connecting);
        metrics::counter!("ocpp_proxy_outbound_connect_attempts_total",
            "service" => service.id.clone())
        .increment(1);

        match connect(&service).await {
            Ok(stream) => {
                info!(service_id = service.id.as_str(), url = service.url.as_str(), "connected");
                backoff.reset();
                supervisor.set_state(&service.id, BackendState::Connected);
                run_connection(stream, &service, &registry, &arbiter, &shutdown).await;
                supervisor.set_state(&service.id, BackendState::Disconnected);
                arbiter.backend_gone(&service.id).await;
            }
            Err(e) => {
                supervisor.set_state(&service.id, BackendState::Failed);
                warn!(service_id = service.id.as_str(), error = %e, "connect failed");
            }
        }

        if shutdown.is_triggered() {
            break;
        }
        let delay = backoff.next_delay();
        debug!(service_id = service.id.as_str(), ?delay, "reconnecting after backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.wait() => break,
        }
    }
    info!(service_id = service.id.as_str(), "outbound client stopped");
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(service: &OcppServiceConfig) -> Result<WsStream, ProxyError> {
    let request = build_request(service)?;
    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| ProxyError::HandshakeFailed(e.to_string()))?;
    Ok(stream)
}

/// Build the client handshake: subprotocol plus the configured auth scheme.
fn build_request(
    service: &OcppServiceConfig,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, ProxyError> {
    let mut request = service
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ProxyError::HandshakeFailed(e.to_string()))?;

    let headers = request.headers_mut();
    headers.insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(service.version.subprotocol()),
    );

    let authorization = match service.auth_type {
        AuthType::None => None,
        AuthType::Basic => {
            let (Some(username), Some(password)) = (&service.username, &service.password) else {
                return Err(ProxyError::ConfigInvalid(format!(
                    "service '{}': basic auth needs username and password",
                    service.id
                )));
            };
            Some(format!(
                "Basic {}",
                BASE64.encode(format!("{username}:{password}"))
            ))
        }
        AuthType::Token => {
            let Some(token) = &service.token else {
                return Err(ProxyError::ConfigInvalid(format!(
                    "service '{}': token auth needs a token",
                    service.id
                )));
            };
            Some(format!("Bearer {token}"))
        }
    };
    if let Some(value) = authorization {
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&value)
                .map_err(|e| ProxyError::HandshakeFailed(e.to_string()))?,
        );
    }
    Ok(request)
}

async fn run_connection(
    stream: WsStream,
    service: &OcppServiceConfig,
    registry: &SharedBackendRegistry,
    arbiter: &ArbiterHandle,
    shutdown: &ShutdownSignal,
) {
    // evict-and-replace: a half-dead previous registration must not strand
    // the service id
    let mut registration: BackendRegistration =
        match registry.register(&service.id, BackendKind::Outbound) {
            Ok(registration) => registration,
            Err(_) => {
                registry.evict(&service.id);
                arbiter.backend_gone(&service.id).await;
                match registry.register(&service.id, BackendKind::Outbound) {
                    Ok(registration) => registration,
                    Err(e) => {
                        warn!(service_id = service.id.as_str(), error = %e, "registration failed");
                        return;
                    }
                }
            }
        };

    let adapter = ProtocolAdapter::new(service.version);
    let pending = PendingCalls::new();
    let (mut sink, mut source) = stream.split();

    // Introduce the proxy to the remote CSMS before forwarding telemetry.
    let boot = ChargerEvent::BootNotification {
        vendor: "ocpp-proxy".to_string(),
        model: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    };
    if let Some(frame) = encode_forward(&adapter, &pending, &boot) {
        if sink.send(Message::Text(frame)).await.is_err() {
            registry.unregister(&service.id, registration.conn_id);
            return;
        }
    }

    loop {
        tokio::select! {
            // Proxy → service: fanned-out frames for this backend.
            frame = registration.frames.recv() => {
                let Some(frame) = frame else { break };
                match frame {
                    ServerFrame::Event { event } => {
                        if let Some(text) = encode_forward(&adapter, &pending, &event) {
                            if sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                    ServerFrame::Control { status, reason } => {
                        debug!(service_id = service.id.as_str(), ?status, ?reason, "control update");
                    }
                    // result/error frames are inbound-backend vocabulary
                    _ => {}
                }
            }

            // Service → proxy: commands and answers to forwarded calls.
            message = source.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_remote_text(
                            service, &adapter, &pending, arbiter, &text,
                        )
                        .await
                        {
                            if sink.send(Message::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(service_id = service.id.as_str(), error = %e, "socket error");
                        break;
                    }
                }
            }

            _ = shutdown.wait() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    pending.flush_connection_lost();
    registry.unregister(&service.id, registration.conn_id);
    info!(service_id = service.id.as_str(), "disconnected");
}

/// Encode an internal event as a Call on the forward leg. The result is
/// tracked in the pending table only to absorb the service's answer.
fn encode_forward(
    adapter: &ProtocolAdapter,
    pending: &PendingCalls,
    event: &ChargerEvent,
) -> Option<String> {
    let (action, payload) = adapter.encode_event(event)?;
    let message_id = adapter.next_message_id();
    // answer is informational; drop the receiver
    let _ = pending.register(&message_id, &action);
    Some(
        OcppFrame::Call {
            unique_id: message_id,
            action,
            payload,
        }
        .serialize(),
    )
}

/// Handle one frame from the remote service; returns the reply to send.
async fn handle_remote_text(
    service: &OcppServiceConfig,
    adapter: &ProtocolAdapter,
    pending: &PendingCalls,
    arbiter: &ArbiterHandle,
    text: &str,
) -> Option<String> {
    let frame = match OcppFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(service_id = service.id.as_str(), error = %e.error, "bad frame from service");
            return e.unique_id.map(|id| {
                OcppFrame::error_response(id, "ProtocolError", e.error.to_string()).serialize()
            });
        }
    };

    match frame {
        OcppFrame::Call {
            unique_id,
            action,
            payload,
        } => Some(
            remote_call_reply(service, adapter, arbiter, unique_id, &action, &payload)
                .await
                .serialize(),
        ),
        OcppFrame::CallResult { unique_id, payload } => {
            pending.complete(&unique_id, payload);
            None
        }
        OcppFrame::CallError {
            unique_id,
            error_code,
            error_description,
            ..
        } => {
            pending.fail(&unique_id, &error_code, &error_description);
            None
        }
    }
}

/// Decode a command-class call from the remote service, acquire control if
/// needed, run the command, and map the outcome back onto OCPP.
async fn remote_call_reply(
    service: &OcppServiceConfig,
    adapter: &ProtocolAdapter,
    arbiter: &ArbiterHandle,
    unique_id: String,
    action: &str,
    payload: &serde_json::Value,
) -> OcppFrame {
    let command = match adapter.decode_command(action, payload) {
        Ok(command) => command,
        Err(ProxyError::NotImplemented(action)) => {
            return OcppFrame::error_response(
                unique_id,
                "NotImplemented",
                format!("action '{action}' is not supported"),
            );
        }
        Err(e) => {
            return OcppFrame::error_response(unique_id, "FormationViolation", e.to_string());
        }
    };

    // an outbound client requests control implicitly on the service's behalf
    if arbiter.snapshot().holder.as_deref() != Some(service.id.as_str()) {
        if let Err(e) = arbiter.request_control(&service.id).await {
            info!(
                service_id = service.id.as_str(),
                command = command.name(),
                reason = e.code(),
                "command refused, control denied"
            );
            return OcppFrame::CallResult {
                unique_id,
                payload: json!({ "status": "Rejected" }),
            };
        }
    }

    match arbiter.submit_command(&service.id, command).await {
        Ok(result) => OcppFrame::CallResult {
            unique_id,
            payload: result,
        },
        Err(failure) => OcppFrame::error_response(unique_id, failure.code(), failure.message()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::arbitration::{spawn_arbiter, ControlPolicy};
    use crate::application::charger::ChargerManager;
    use crate::application::events::EventBus;
    use crate::application::registry::BackendRegistry;
    use std::sync::atomic::AtomicBool;

    fn service(auth_type: AuthType) -> OcppServiceConfig {
        OcppServiceConfig {
            id: "grid".into(),
            url: "wss://csms.example.com/ocpp".into(),
            version: crate::domain::OcppVersion::V16,
            auth_type,
            username: Some("user".into()),
            password: Some("pass".into()),
            token: Some("tok".into()),
            enabled: true,
        }
    }

    #[test]
    fn request_carries_subprotocol() {
        let request = build_request(&service(AuthType::None)).unwrap();
        assert_eq!(
            request.headers().get("Sec-WebSocket-Protocol").unwrap(),
            "ocpp1.6"
        );
        assert!(request.headers().get("Authorization").is_none());
    }

    #[test]
    fn basic_auth_header_is_encoded() {
        let request = build_request(&service(AuthType::Basic)).unwrap();
        let value = request.headers().get("Authorization").unwrap();
        // "user:pass" base64
        assert_eq!(value, "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn token_auth_uses_bearer() {
        let request = build_request(&service(AuthType::Token)).unwrap();
        assert_eq!(request.headers().get("Authorization").unwrap(), "Bearer tok");
    }

    #[test]
    fn missing_token_is_config_error() {
        let mut svc = service(AuthType::Token);
        svc.token = None;
        assert!(build_request(&svc).is_err());
    }

    #[tokio::test]
    async fn remote_command_without_charger_reports_rejection() {
        let registry = BackendRegistry::shared();
        let arbiter = spawn_arbiter(
            ControlPolicy {
                rate_limit_seconds: 0,
                ..Default::default()
            },
            registry.clone(),
            ChargerManager::new(Arc::new(EventBus::new()), 300),
            Arc::new(AtomicBool::new(false)),
        );
        let svc = service(AuthType::None);
        let _registration = registry.register(&svc.id, BackendKind::Outbound).unwrap();
        let adapter = ProtocolAdapter::new(svc.version);

        // control is granted implicitly, but with no charger connected the
        // command itself fails
        let reply = remote_call_reply(
            &svc,
            &adapter,
            &arbiter,
            "7".into(),
            "RemoteStartTransaction",
            &json!({"idTag": "ABC", "connectorId": 1}),
        )
        .await;
        match reply {
            OcppFrame::CallError {
                unique_id,
                error_code,
                ..
            } => {
                assert_eq!(unique_id, "7");
                assert_eq!(error_code, "ChargerUnavailable");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(arbiter.snapshot().holder.as_deref(), Some("grid"));
    }

    #[tokio::test]
    async fn denied_control_maps_to_rejected_call_result() {
        let registry = BackendRegistry::shared();
        let arbiter = spawn_arbiter(
            ControlPolicy {
                disallowed_providers: vec!["grid".into()],
                rate_limit_seconds: 0,
                ..Default::default()
            },
            registry.clone(),
            ChargerManager::new(Arc::new(EventBus::new()), 300),
            Arc::new(AtomicBool::new(false)),
        );
        let svc = service(AuthType::None);
        let _registration = registry.register(&svc.id, BackendKind::Outbound).unwrap();
        let adapter = ProtocolAdapter::new(svc.version);

        let reply = remote_call_reply(
            &svc,
            &adapter,
            &arbiter,
            "8".into(),
            "RemoteStopTransaction",
            &json!({"transactionId": 5}),
        )
        .await;
        match reply {
            OcppFrame::CallResult { payload, .. } => {
                assert_eq!(payload["status"], "Rejected");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_remote_action_is_not_implemented() {
        let registry = BackendRegistry::shared();
        let arbiter = spawn_arbiter(
            ControlPolicy::default(),
            registry.clone(),
            ChargerManager::new(Arc::new(EventBus::new()), 300),
            Arc::new(AtomicBool::new(false)),
        );
        let svc = service(AuthType::None);
        let adapter = ProtocolAdapter::new(svc.version);

        let reply = remote_call_reply(
            &svc,
            &adapter,
            &arbiter,
            "9".into(),
            "GetConfiguration",
            &json!({}),
        )
        .await;
        match reply {
            OcppFrame::CallError { error_code, .. } => assert_eq!(error_code, "NotImplemented"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn offline_snapshots_skip_registered_services() {
        let registry = BackendRegistry::shared();
        let supervisor = OutboundSupervisor::default();
        supervisor.set_state("grid", BackendState::Failed);
        supervisor.set_state("fleet", BackendState::Connected);
        let _registration = registry.register("fleet", BackendKind::Outbound).unwrap();

        let snapshots = supervisor.offline_snapshots(&registry);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, "grid");
        assert_eq!(snapshots[0].state, BackendState::Failed);
    }
}
