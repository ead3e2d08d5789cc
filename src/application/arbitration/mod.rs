//! Control arbitration engine
//!
//! A single actor owns the control lock: grants, revocations, preemption,
//! fault suspension and the administrative override all serialize through
//! its queue. Charger calls on behalf of a holder are dispatched to spawned
//! tasks so the actor never blocks on charger I/O.

pub mod policy;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::application::charger::{CallFailure, SharedChargerManager, CALL_TIMEOUT};
use crate::domain::{ChargerCommand, ChargerEvent};
use crate::support::ProxyError;

pub use policy::{ControlPolicy, Grant, LockState, RequestContext};

/// Scheduling margin on top of the charger call deadline for
/// backend-submitted commands.
const COMMAND_MARGIN: Duration = Duration::from_secs(1);

// ── Notification seam ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStatus {
    Granted,
    Revoked,
    Denied,
}

/// How the engine reaches backends: existence checks and control frames.
/// Implemented by the backend registry.
pub trait ControlNotifier: Send + Sync + 'static {
    fn backend_exists(&self, backend_id: &str) -> bool;
    fn notify_control(&self, backend_id: &str, status: ControlStatus, reason: Option<&str>);
}

// ── Public lock view ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockSnapshot {
    /// `"free"`, `"held"` or `"suspended"`.
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    pub override_active: bool,
}

impl LockSnapshot {
    fn from_state(lock: &LockState, override_active: bool) -> Self {
        match lock {
            LockState::Free => Self {
                state: "free",
                holder: None,
                since: None,
                override_active,
            },
            LockState::Held { backend_id, since } => Self {
                state: "held",
                holder: Some(backend_id.clone()),
                since: Some(*since),
                override_active,
            },
            LockState::Suspended { .. } => Self {
                state: "suspended",
                holder: None,
                since: None,
                override_active,
            },
        }
    }

    /// Effective holder as reported by `GET /status`; the override, when
    /// active, is the holder.
    pub fn control_holder(&self) -> Option<String> {
        if self.override_active {
            Some("override".to_string())
        } else {
            self.holder.clone()
        }
    }
}

// ── Messages & handle ──────────────────────────────────────────

enum ArbiterMsg {
    Request {
        backend_id: String,
        reply: oneshot::Sender<Result<(), ProxyError>>,
    },
    Release {
        backend_id: String,
        reply: oneshot::Sender<Result<(), ProxyError>>,
    },
    Command {
        backend_id: String,
        command: ChargerCommand,
        reply: oneshot::Sender<Result<Value, CallFailure>>,
    },
    Observe {
        event: ChargerEvent,
        done: oneshot::Sender<()>,
    },
    BackendGone {
        backend_id: String,
    },
    SetManualOverride {
        active: bool,
        done: oneshot::Sender<()>,
    },
    SetSourceOverride {
        active: bool,
    },
}

#[derive(Clone)]
pub struct ArbiterHandle {
    tx: mpsc::Sender<ArbiterMsg>,
    lock_rx: watch::Receiver<LockSnapshot>,
}

impl ArbiterHandle {
    pub async fn request_control(&self, backend_id: &str) -> Result<(), ProxyError> {
        let (reply, rx) = oneshot::channel();
        self.send(ArbiterMsg::Request {
            backend_id: backend_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ProxyError::ChargerUnavailable)?
    }

    pub async fn release_control(&self, backend_id: &str) -> Result<(), ProxyError> {
        let (reply, rx) = oneshot::channel();
        self.send(ArbiterMsg::Release {
            backend_id: backend_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ProxyError::ChargerUnavailable)?
    }

    /// Submit a command on behalf of `backend_id`; resolves with the
    /// charger's answer, a timeout, or a cancellation.
    pub async fn submit_command(
        &self,
        backend_id: &str,
        command: ChargerCommand,
    ) -> Result<Value, CallFailure> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(ArbiterMsg::Command {
                backend_id: backend_id.to_string(),
                command,
                reply,
            })
            .await
            .is_err()
        {
            return Err(CallFailure::ConnectionLost);
        }
        rx.await.unwrap_or(Err(CallFailure::ConnectionLost))
    }

    /// Feed one bus event; resolves after the engine has fully reacted
    /// (revocation frames enqueued). The pump relies on this ordering.
    pub async fn observe_event(&self, event: &ChargerEvent) {
        let (done, rx) = oneshot::channel();
        if self
            .tx
            .send(ArbiterMsg::Observe {
                event: event.clone(),
                done,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn backend_gone(&self, backend_id: &str) {
        let _ = self
            .tx
            .send(ArbiterMsg::BackendGone {
                backend_id: backend_id.to_string(),
            })
            .await;
    }

    /// Toggle the manual override (`POST /override`); resolves after any
    /// revocation has been enqueued.
    pub async fn set_manual_override(&self, active: bool) {
        let (done, rx) = oneshot::channel();
        if self
            .tx
            .send(ArbiterMsg::SetManualOverride { active, done })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Push the external override source state (1 Hz poller).
    pub async fn set_source_override(&self, active: bool) {
        let _ = self.tx.send(ArbiterMsg::SetSourceOverride { active }).await;
    }

    pub fn snapshot(&self) -> LockSnapshot {
        self.lock_rx.borrow().clone()
    }

    pub fn lock_watch(&self) -> watch::Receiver<LockSnapshot> {
        self.lock_rx.clone()
    }

    async fn send(&self, msg: ArbiterMsg) -> Result<(), ProxyError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ProxyError::ChargerUnavailable)
    }
}

// ── Actor ──────────────────────────────────────────────────────

struct Arbiter {
    policy: ControlPolicy,
    lock: LockState,
    manual_override: bool,
    source_override: bool,
    last_request: HashMap<String, DateTime<Utc>>,
    notifier: Arc<dyn ControlNotifier>,
    charger: SharedChargerManager,
    presence_home: Arc<AtomicBool>,
    /// Backend ids whose in-flight commands must abort.
    revoke_tx: broadcast::Sender<String>,
    lock_tx: watch::Sender<LockSnapshot>,
}

/// Spawn the arbitration actor.
pub fn spawn_arbiter(
    policy: ControlPolicy,
    notifier: Arc<dyn ControlNotifier>,
    charger: SharedChargerManager,
    presence_home: Arc<AtomicBool>,
) -> ArbiterHandle {
    let (tx, rx) = mpsc::channel(64);
    let (revoke_tx, _) = broadcast::channel(16);
    let (lock_tx, lock_rx) = watch::channel(LockSnapshot::from_state(&LockState::Free, false));

    let arbiter = Arbiter {
        policy,
        lock: LockState::Free,
        manual_override: false,
        source_override: false,
        last_request: HashMap::new(),
        notifier,
        charger,
        presence_home,
        revoke_tx,
        lock_tx,
    };
    tokio::spawn(arbiter.run(rx));

    ArbiterHandle { tx, lock_rx }
}

impl Arbiter {
    async fn run(mut self, mut rx: mpsc::Receiver<ArbiterMsg>) {
        info!("arbitration engine started");
        while let Some(msg) = rx.recv().await {
            match msg {
                ArbiterMsg::Request { backend_id, reply } => {
                    let _ = reply.send(self.handle_request(&backend_id));
                }
                ArbiterMsg::Release { backend_id, reply } => {
                    let _ = reply.send(self.handle_release(&backend_id));
                }
                ArbiterMsg::Command {
                    backend_id,
                    command,
                    reply,
                } => self.handle_command(backend_id, command, reply),
                ArbiterMsg::Observe { event, done } => {
                    self.observe(&event);
                    let _ = done.send(());
                }
                ArbiterMsg::BackendGone { backend_id } => self.handle_backend_gone(&backend_id),
                ArbiterMsg::SetManualOverride { active, done } => {
                    self.manual_override = active;
                    self.apply_override_edge();
                    let _ = done.send(());
                }
                ArbiterMsg::SetSourceOverride { active } => {
                    self.source_override = active;
                    self.apply_override_edge();
                }
            }
        }
        info!("arbitration engine stopped");
    }

    fn override_active(&self) -> bool {
        self.manual_override || self.source_override
    }

    fn publish_lock(&self) {
        let _ = self
            .lock_tx
            .send(LockSnapshot::from_state(&self.lock, self.override_active()));
    }

    fn handle_request(&mut self, backend_id: &str) -> Result<(), ProxyError> {
        // the lock may only ever reference a registered backend
        if !self.notifier.backend_exists(backend_id) {
            warn!(backend_id, "control request from unregistered backend");
            return Err(ProxyError::ProviderNotAllowed);
        }
        let now = Utc::now();
        let ctx = RequestContext {
            now,
            last_request: self.last_request.get(backend_id).copied(),
            override_active: self.override_active(),
            presence_home: self.presence_home.load(Ordering::Relaxed),
        };
        let outcome = policy::evaluate(&self.policy, &self.lock, backend_id, ctx);
        // the clock advances on acceptance and rejection alike
        self.last_request.insert(backend_id.to_string(), now);

        let label = match &outcome {
            Ok(Grant::Granted) => "granted",
            Ok(Grant::Preempted { .. }) => "preempted",
            Err(e) => e.code(),
        };
        metrics::counter!("ocpp_proxy_control_requests_total", "outcome" => label).increment(1);

        match outcome {
            Ok(Grant::Granted) => {
                // a re-request by the current holder keeps its grant time
                if self.lock.holder() != Some(backend_id) {
                    self.lock = LockState::Held {
                        backend_id: backend_id.to_string(),
                        since: now,
                    };
                    info!(backend_id, "control granted");
                    self.publish_lock();
                }
                self.notifier
                    .notify_control(backend_id, ControlStatus::Granted, None);
                Ok(())
            }
            Ok(Grant::Preempted { previous }) => {
                self.revoke(&previous, "Preempted");
                self.lock = LockState::Held {
                    backend_id: backend_id.to_string(),
                    since: now,
                };
                self.notifier
                    .notify_control(backend_id, ControlStatus::Granted, None);
                info!(backend_id, previous = previous.as_str(), "control granted by preemption");
                self.publish_lock();
                Ok(())
            }
            Err(e) => {
                info!(backend_id, reason = e.code(), "control denied");
                Err(e)
            }
        }
    }

    fn handle_release(&mut self, backend_id: &str) -> Result<(), ProxyError> {
        if self.lock.holder() == Some(backend_id) {
            self.lock = LockState::Free;
            info!(backend_id, "control released");
            self.publish_lock();
            Ok(())
        } else {
            Err(ProxyError::NotLockHolder)
        }
    }

    fn handle_command(
        &mut self,
        backend_id: String,
        command: ChargerCommand,
        reply: oneshot::Sender<Result<Value, CallFailure>>,
    ) {
        if self.override_active() {
            let _ = reply.send(Err(ProxyError::UserOverride.into()));
            return;
        }
        if self.lock.holder() != Some(backend_id.as_str()) {
            let _ = reply.send(Err(ProxyError::NotLockHolder.into()));
            return;
        }
        let Some(link) = self.charger.link() else {
            let _ = reply.send(Err(ProxyError::ChargerUnavailable.into()));
            return;
        };

        // Dispatch without holding the actor across charger I/O.
        let mut revoked = self.revoke_tx.subscribe();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = tokio::time::timeout(CALL_TIMEOUT + COMMAND_MARGIN, link.call(&command)) => {
                    match outcome {
                        Ok(outcome) => outcome,
                        Err(_) => Err(CallFailure::Timeout),
                    }
                }
                _ = wait_revoked(&mut revoked, &backend_id) => {
                    Err(ProxyError::Preempted.into())
                }
            };
            let _ = reply.send(outcome);
        });
    }

    fn observe(&mut self, event: &ChargerEvent) {
        match event {
            ChargerEvent::StatusChanged { status, .. } if status.is_faulted() => {
                if let Some(holder) = self.lock.holder().map(str::to_string) {
                    self.revoke(&holder, "ChargerFaulted");
                }
                if !matches!(self.lock, LockState::Suspended { .. }) {
                    warn!("charger faulted, control lock suspended");
                    self.lock = LockState::Suspended {
                        reason: "ChargerFaulted",
                    };
                    self.publish_lock();
                }
            }
            ChargerEvent::StatusChanged { .. } => {
                if matches!(self.lock, LockState::Suspended { .. }) {
                    info!("charger recovered, control lock free");
                    self.lock = LockState::Free;
                    self.publish_lock();
                }
            }
            ChargerEvent::ChargerDisconnected { .. } => {
                if let Some(holder) = self.lock.holder().map(str::to_string) {
                    self.revoke(&holder, "ChargerUnavailable");
                }
                if self.lock != LockState::Free {
                    self.lock = LockState::Free;
                    self.publish_lock();
                }
            }
            _ => {}
        }
    }

    fn handle_backend_gone(&mut self, backend_id: &str) {
        self.last_request.remove(backend_id);
        // loss of the holder releases the lock
        if self.lock.holder() == Some(backend_id) {
            info!(backend_id, "lock holder disconnected, lock released");
            let _ = self.revoke_tx.send(backend_id.to_string());
            self.lock = LockState::Free;
            self.publish_lock();
        }
    }

    fn apply_override_edge(&mut self) {
        if self.override_active() {
            if let Some(holder) = self.lock.holder().map(str::to_string) {
                self.revoke(&holder, "UserOverride");
                self.lock = LockState::Free;
            }
        }
        self.publish_lock();
    }

    /// Send a revoked frame and cancel the backend's in-flight commands.
    fn revoke(&self, backend_id: &str, reason: &str) {
        self.notifier
            .notify_control(backend_id, ControlStatus::Revoked, Some(reason));
        let _ = self.revoke_tx.send(backend_id.to_string());
    }
}

async fn wait_revoked(rx: &mut broadcast::Receiver<String>, backend_id: &str) {
    loop {
        match rx.recv().await {
            Ok(revoked) if revoked == backend_id => return,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            // the engine is gone; let the charger call run its course
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::charger::ChargerManager;
    use crate::application::events::EventBus;
    use crate::domain::{ChargerStatus, ResetKind};
    use std::sync::Mutex;

    struct MockNotifier {
        frames: Mutex<Vec<(String, ControlStatus, Option<String>)>>,
    }

    impl MockNotifier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
            })
        }

        fn frames(&self) -> Vec<(String, ControlStatus, Option<String>)> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl ControlNotifier for MockNotifier {
        fn backend_exists(&self, _backend_id: &str) -> bool {
            true
        }

        fn notify_control(&self, backend_id: &str, status: ControlStatus, reason: Option<&str>) {
            self.frames.lock().unwrap().push((
                backend_id.to_string(),
                status,
                reason.map(str::to_string),
            ));
        }
    }

    fn arbiter_with(policy: ControlPolicy) -> (ArbiterHandle, Arc<MockNotifier>) {
        let notifier = MockNotifier::new();
        let charger = ChargerManager::new(Arc::new(EventBus::new()), 300);
        let handle = spawn_arbiter(
            policy,
            notifier.clone(),
            charger,
            Arc::new(AtomicBool::new(false)),
        );
        (handle, notifier)
    }

    fn status_event(status: ChargerStatus) -> ChargerEvent {
        ChargerEvent::StatusChanged {
            connector_id: 1,
            status,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn grant_then_release() {
        let (handle, notifier) = arbiter_with(ControlPolicy::default());
        handle.request_control("A").await.unwrap();
        assert_eq!(handle.snapshot().holder.as_deref(), Some("A"));
        assert_eq!(
            notifier.frames(),
            vec![("A".to_string(), ControlStatus::Granted, None)]
        );

        handle.release_control("A").await.unwrap();
        assert_eq!(handle.snapshot().state, "free");

        let err = handle.release_control("A").await.unwrap_err();
        assert_eq!(err.code(), "NotLockHolder");
    }

    #[tokio::test]
    async fn preferred_provider_preempts_and_revokes() {
        let policy = ControlPolicy {
            preferred_provider: Some("P".into()),
            rate_limit_seconds: 0,
            ..Default::default()
        };
        let (handle, notifier) = arbiter_with(policy);
        handle.request_control("X").await.unwrap();
        handle.request_control("P").await.unwrap();

        assert_eq!(handle.snapshot().holder.as_deref(), Some("P"));
        let frames = notifier.frames();
        assert_eq!(
            frames[1],
            (
                "X".to_string(),
                ControlStatus::Revoked,
                Some("Preempted".to_string())
            )
        );
        assert_eq!(frames[2], ("P".to_string(), ControlStatus::Granted, None));
    }

    #[tokio::test]
    async fn fault_suspends_and_recovery_frees() {
        let (handle, notifier) = arbiter_with(ControlPolicy {
            rate_limit_seconds: 0,
            ..Default::default()
        });
        handle.request_control("A").await.unwrap();

        handle
            .observe_event(&status_event(ChargerStatus::Faulted))
            .await;
        assert_eq!(handle.snapshot().state, "suspended");
        assert!(notifier.frames().contains(&(
            "A".to_string(),
            ControlStatus::Revoked,
            Some("ChargerFaulted".to_string())
        )));

        // requests while suspended are rejected with ChargerFaulted
        let err = handle.request_control("B").await.unwrap_err();
        assert_eq!(err.code(), "ChargerFaulted");

        handle
            .observe_event(&status_event(ChargerStatus::Available))
            .await;
        assert_eq!(handle.snapshot().state, "free");
        handle.request_control("B").await.unwrap();
    }

    #[tokio::test]
    async fn rate_limit_applies_to_rapid_requests() {
        let (handle, _notifier) = arbiter_with(ControlPolicy::default());
        handle.request_control("A").await.unwrap();
        handle.release_control("A").await.unwrap();
        let err = handle.request_control("A").await.unwrap_err();
        assert_eq!(err.code(), "RateLimited");
    }

    #[tokio::test]
    async fn manual_override_revokes_and_blocks() {
        let (handle, notifier) = arbiter_with(ControlPolicy {
            rate_limit_seconds: 0,
            ..Default::default()
        });
        handle.request_control("A").await.unwrap();
        handle.set_manual_override(true).await;

        assert!(notifier.frames().contains(&(
            "A".to_string(),
            ControlStatus::Revoked,
            Some("UserOverride".to_string())
        )));
        assert_eq!(
            handle.snapshot().control_holder().as_deref(),
            Some("override")
        );

        let err = handle.request_control("B").await.unwrap_err();
        assert_eq!(err.code(), "UserOverride");

        handle.set_manual_override(false).await;
        handle.request_control("B").await.unwrap();
    }

    #[tokio::test]
    async fn commands_require_the_lock() {
        let (handle, _notifier) = arbiter_with(ControlPolicy {
            rate_limit_seconds: 0,
            ..Default::default()
        });
        let err = handle
            .submit_command(
                "A",
                ChargerCommand::Reset {
                    kind: ResetKind::Soft,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NotLockHolder");

        // holder without a charger gets ChargerUnavailable
        handle.request_control("A").await.unwrap();
        let err = handle
            .submit_command(
                "A",
                ChargerCommand::Reset {
                    kind: ResetKind::Soft,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ChargerUnavailable");
    }

    #[tokio::test]
    async fn backend_disconnect_frees_lock() {
        let (handle, _notifier) = arbiter_with(ControlPolicy {
            rate_limit_seconds: 0,
            ..Default::default()
        });
        handle.request_control("A").await.unwrap();
        handle.backend_gone("A").await;
        // the gone message is fire-and-forget; serialize behind a request
        handle.request_control("B").await.unwrap();
        assert_eq!(handle.snapshot().holder.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn charger_disconnect_frees_lock() {
        let (handle, notifier) = arbiter_with(ControlPolicy {
            rate_limit_seconds: 0,
            ..Default::default()
        });
        handle.request_control("A").await.unwrap();
        handle
            .observe_event(&ChargerEvent::ChargerDisconnected {
                charger_id: "charger".into(),
                timestamp: Utc::now(),
            })
            .await;
        assert_eq!(handle.snapshot().state, "free");
        assert!(notifier.frames().contains(&(
            "A".to_string(),
            ControlStatus::Revoked,
            Some("ChargerUnavailable".to_string())
        )));
    }

    #[tokio::test]
    async fn presence_gate_consults_flag() {
        let notifier = MockNotifier::new();
        let charger = ChargerManager::new(Arc::new(EventBus::new()), 300);
        let presence = Arc::new(AtomicBool::new(true));
        let handle = spawn_arbiter(
            ControlPolicy {
                preferred_provider: Some("P".into()),
                rate_limit_seconds: 0,
                ..Default::default()
            },
            notifier,
            charger,
            presence.clone(),
        );

        let err = handle.request_control("Q").await.unwrap_err();
        assert_eq!(err.code(), "PresenceBlocked");

        presence.store(false, Ordering::Relaxed);
        handle.request_control("Q").await.unwrap();
    }
}
