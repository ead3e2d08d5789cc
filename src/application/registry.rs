//! Backend registry and event fan-out
//!
//! Tracks every live backend (inbound and outbound) and owns the only path
//! onto each backend's socket: a bounded per-backend frame queue drained by
//! that connection's writer task. A full queue drops frames for that backend
//! alone; the charger and other backends are unaffected.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::arbitration::{ControlNotifier, ControlStatus};
use crate::backends::ServerFrame;
use crate::domain::{BackendKind, BackendSnapshot, BackendState, ChargerEvent};
use crate::support::ProxyError;

/// Frames buffered per backend before drops start.
pub const SEND_QUEUE_CAPACITY: usize = 64;

struct BackendEntry {
    kind: BackendKind,
    conn_id: Uuid,
    subscribed: AtomicBool,
    dropped: AtomicU64,
    sender: mpsc::Sender<ServerFrame>,
}

/// Returned by a successful registration; owns the frame stream the
/// connection's writer task must drain.
#[derive(Debug)]
pub struct BackendRegistration {
    pub conn_id: Uuid,
    pub frames: mpsc::Receiver<ServerFrame>,
}

#[derive(Default)]
pub struct BackendRegistry {
    backends: DashMap<String, BackendEntry>,
}

pub type SharedBackendRegistry = Arc<BackendRegistry>;

impl BackendRegistry {
    pub fn shared() -> SharedBackendRegistry {
        Arc::new(Self::default())
    }

    /// Register a backend id. Fails with `DuplicateBackend` while the id is
    /// live; callers that replace a connection evict first.
    pub fn register(
        &self,
        backend_id: &str,
        kind: BackendKind,
    ) -> Result<BackendRegistration, ProxyError> {
        let (sender, frames) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let conn_id = Uuid::new_v4();
        let entry = BackendEntry {
            kind,
            conn_id,
            // subscription defaults to true on connect
            subscribed: AtomicBool::new(true),
            dropped: AtomicU64::new(0),
            sender,
        };
        // guard against a racing registration of the same id
        match self.backends.entry(backend_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ProxyError::DuplicateBackend(backend_id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                info!(backend_id, ?kind, "backend registered");
                Ok(BackendRegistration { conn_id, frames })
            }
        }
    }

    /// Drop a live registration (its frame stream closes, which ends the
    /// connection's writer task).
    pub fn evict(&self, backend_id: &str) -> bool {
        if self.backends.remove(backend_id).is_some() {
            warn!(backend_id, "backend evicted");
            true
        } else {
            false
        }
    }

    /// Remove the registration owned by `conn_id`. A newer registration
    /// under the same id is left untouched.
    pub fn unregister(&self, backend_id: &str, conn_id: Uuid) -> bool {
        let removed = self
            .backends
            .remove_if(backend_id, |_, entry| entry.conn_id == conn_id)
            .is_some();
        if removed {
            info!(backend_id, "backend unregistered");
        }
        removed
    }

    pub fn set_subscribed(&self, backend_id: &str, subscribed: bool) -> bool {
        match self.backends.get(backend_id) {
            Some(entry) => {
                entry.subscribed.store(subscribed, Ordering::SeqCst);
                debug!(backend_id, subscribed, "subscription updated");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, backend_id: &str) -> bool {
        self.backends.contains_key(backend_id)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Deliver an event to every subscribed backend, dropping per backend
    /// when its queue is full.
    pub fn broadcast(&self, event: &ChargerEvent) {
        for entry in self.backends.iter() {
            if !entry.subscribed.load(Ordering::SeqCst) {
                continue;
            }
            Self::push(
                entry.key(),
                entry.value(),
                ServerFrame::Event {
                    event: event.clone(),
                },
            );
        }
    }

    /// Queue a frame for one backend.
    pub fn send_frame(&self, backend_id: &str, frame: ServerFrame) -> bool {
        match self.backends.get(backend_id) {
            Some(entry) => Self::push(backend_id, entry.value(), frame),
            None => false,
        }
    }

    fn push(backend_id: &str, entry: &BackendEntry, frame: ServerFrame) -> bool {
        match entry.sender.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = entry.dropped.fetch_add(1, Ordering::SeqCst) + 1;
                metrics::counter!(
                    "ocpp_proxy_backend_dropped_frames_total",
                    "backend" => backend_id.to_string()
                )
                .increment(1);
                warn!(backend_id, dropped, "send queue full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn snapshots(&self) -> Vec<BackendSnapshot> {
        let mut snapshots: Vec<BackendSnapshot> = self
            .backends
            .iter()
            .map(|entry| BackendSnapshot {
                id: entry.key().clone(),
                kind: entry.kind,
                state: BackendState::Connected,
                subscribed: entry.subscribed.load(Ordering::SeqCst),
                dropped_frames: entry.dropped.load(Ordering::SeqCst),
            })
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }
}

impl ControlNotifier for BackendRegistry {
    fn backend_exists(&self, backend_id: &str) -> bool {
        self.contains(backend_id)
    }

    fn notify_control(&self, backend_id: &str, status: ControlStatus, reason: Option<&str>) {
        self.send_frame(backend_id, ServerFrame::control(status, reason));
    }
}
