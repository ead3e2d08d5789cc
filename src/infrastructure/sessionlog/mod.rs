//! Session log
//!
//! Durable, append-oriented store of charging sessions. All mutations
//! serialize through one actor task (the only writer); a write is durable
//! before the caller observes success. Readers use the shared store as a
//! read-only view.

pub mod entity;
pub mod migrator;
pub mod store;

use chrono::{DateTime, Utc};
use sea_orm::{Database, DatabaseConnection, DbErr};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::domain::{ChargingSession, SessionFilter};
use crate::support::ProxyError;

pub use store::SessionStore;

/// Connect to the session log database.
pub async fn init_database(url: &str) -> Result<DatabaseConnection, DbErr> {
    Database::connect(url).await
}

// ── Actor plumbing ─────────────────────────────────────────────

enum LogMsg {
    Open {
        backend_id: String,
        charger_tx_id: Option<String>,
        start_meter_wh: i64,
        started_at: DateTime<Utc>,
        reply: oneshot::Sender<Result<i64, ProxyError>>,
    },
    Close {
        session_id: i64,
        stop_meter_wh: i64,
        stopped_at: DateTime<Utc>,
        reason: Option<String>,
        reply: oneshot::Sender<Result<(), ProxyError>>,
    },
    Meter {
        session_id: i64,
        meter_wh: i64,
        reply: oneshot::Sender<Result<(), ProxyError>>,
    },
}

#[derive(Clone)]
pub struct SessionLogHandle {
    tx: mpsc::Sender<LogMsg>,
    store: SessionStore,
}

impl SessionLogHandle {
    /// Open a session; durable before the id is returned.
    pub async fn open_session(
        &self,
        backend_id: &str,
        charger_tx_id: Option<&str>,
        start_meter_wh: i64,
        started_at: DateTime<Utc>,
    ) -> Result<i64, ProxyError> {
        let (reply, rx) = oneshot::channel();
        self.send(LogMsg::Open {
            backend_id: backend_id.to_string(),
            charger_tx_id: charger_tx_id.map(str::to_string),
            start_meter_wh,
            started_at,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| ProxyError::LogWriteFailed("session log task gone".into()))?
    }

    pub async fn close_session(
        &self,
        session_id: i64,
        stop_meter_wh: i64,
        stopped_at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<(), ProxyError> {
        let (reply, rx) = oneshot::channel();
        self.send(LogMsg::Close {
            session_id,
            stop_meter_wh,
            stopped_at,
            reason: reason.map(str::to_string),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| ProxyError::LogWriteFailed("session log task gone".into()))?
    }

    /// Record an interim meter reading on an open session.
    pub async fn record_meter(&self, session_id: i64, meter_wh: i64) -> Result<(), ProxyError> {
        let (reply, rx) = oneshot::channel();
        self.send(LogMsg::Meter {
            session_id,
            meter_wh,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| ProxyError::LogWriteFailed("session log task gone".into()))?
    }

    // Reads bypass the actor: the store is a read-only view here.

    pub async fn list_sessions(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<ChargingSession>, ProxyError> {
        self.store.list(filter).await
    }

    pub async fn get_session(&self, session_id: i64) -> Result<ChargingSession, ProxyError> {
        self.store
            .find_by_id(session_id)
            .await?
            .ok_or(ProxyError::SessionNotFound(session_id))
    }

    pub async fn find_open(&self) -> Result<Option<ChargingSession>, ProxyError> {
        self.store.find_open().await
    }

    pub async fn export_csv(&self, filter: &SessionFilter) -> Result<String, ProxyError> {
        self.store.export_csv(filter).await
    }

    async fn send(&self, msg: LogMsg) -> Result<(), ProxyError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ProxyError::LogWriteFailed("session log task gone".into()))
    }
}

/// Spawn the session log actor; the returned handle is the only way to write.
pub fn spawn_session_log(db: DatabaseConnection) -> SessionLogHandle {
    let store = SessionStore::new(db);
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(run(store.clone(), rx));
    SessionLogHandle { tx, store }
}

async fn run(store: SessionStore, mut rx: mpsc::Receiver<LogMsg>) {
    info!("session log started");
    while let Some(msg) = rx.recv().await {
        match msg {
            LogMsg::Open {
                backend_id,
                charger_tx_id,
                start_meter_wh,
                started_at,
                reply,
            } => {
                // Crash recovery: a lingering open session violates the
                // single-open-session invariant; truncate it first.
                match store.find_open().await {
                    Ok(Some(stale)) => {
                        let stop_meter = stale.last_meter_wh.unwrap_or(stale.start_meter_wh);
                        warn!(session_id = stale.id, "truncating stale open session");
                        if let Err(e) = store
                            .close(stale.id, stop_meter, started_at, Some("Truncated"))
                            .await
                        {
                            warn!(error = %e, "failed to truncate stale session");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "open-session lookup failed"),
                }
                let result = store
                    .insert_open(
                        &backend_id,
                        charger_tx_id.as_deref(),
                        start_meter_wh,
                        started_at,
                    )
                    .await;
                let _ = reply.send(result);
            }
            LogMsg::Close {
                session_id,
                stop_meter_wh,
                stopped_at,
                reason,
                reply,
            } => {
                let result = store
                    .close(session_id, stop_meter_wh, stopped_at, reason.as_deref())
                    .await;
                let _ = reply.send(result);
            }
            LogMsg::Meter {
                session_id,
                meter_wh,
                reply,
            } => {
                let result = store.record_meter(session_id, meter_wh).await;
                let _ = reply.send(result);
            }
        }
    }
    info!("session log stopped");
}

#[cfg(test)]
mod tests {
    use super::migrator::Migrator;
    use super::*;
    use sea_orm_migration::MigratorTrait;

    async fn memory_log() -> SessionLogHandle {
        let db = init_database("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        spawn_session_log(db)
    }

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn open_close_roundtrip() {
        let log = memory_log().await;
        let id = log
            .open_session("A", Some("17"), 1000, ts("2024-05-01T10:00:00Z"))
            .await
            .unwrap();
        log.close_session(id, 3500, ts("2024-05-01T11:30:00Z"), Some("Remote"))
            .await
            .unwrap();

        let session = log.get_session(id).await.unwrap();
        assert_eq!(session.backend_id, "A");
        assert_eq!(session.charger_tx_id.as_deref(), Some("17"));
        assert_eq!(session.energy_wh(), Some(2500));
        assert_eq!(session.stop_reason.as_deref(), Some("Remote"));
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn session_ids_are_monotonic() {
        let log = memory_log().await;
        let mut previous = 0;
        for i in 0..3 {
            let id = log
                .open_session("A", None, i * 100, ts("2024-05-01T10:00:00Z"))
                .await
                .unwrap();
            assert!(id > previous);
            log.close_session(id, i * 100 + 50, ts("2024-05-01T11:00:00Z"), None)
                .await
                .unwrap();
            previous = id;
        }
    }

    #[tokio::test]
    async fn opening_over_stale_session_truncates_it() {
        let log = memory_log().await;
        let stale = log
            .open_session("A", None, 1000, ts("2024-05-01T10:00:00Z"))
            .await
            .unwrap();
        log.record_meter(stale, 1800).await.unwrap();

        let fresh = log
            .open_session("B", None, 2000, ts("2024-05-01T12:00:00Z"))
            .await
            .unwrap();

        let stale_session = log.get_session(stale).await.unwrap();
        assert!(!stale_session.is_open());
        assert_eq!(stale_session.stop_reason.as_deref(), Some("Truncated"));
        assert_eq!(stale_session.stop_meter_wh, Some(1800));

        let open = log.find_open().await.unwrap().unwrap();
        assert_eq!(open.id, fresh);
    }

    #[tokio::test]
    async fn list_filters_by_backend_and_time() {
        let log = memory_log().await;
        let a = log
            .open_session("A", None, 0, ts("2024-05-01T10:00:00Z"))
            .await
            .unwrap();
        log.close_session(a, 100, ts("2024-05-01T10:30:00Z"), None)
            .await
            .unwrap();
        let b = log
            .open_session("B", None, 0, ts("2024-05-02T10:00:00Z"))
            .await
            .unwrap();
        log.close_session(b, 200, ts("2024-05-02T10:30:00Z"), None)
            .await
            .unwrap();

        let only_a = log
            .list_sessions(&SessionFilter {
                backend_id: Some("A".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].id, a);

        let recent = log
            .list_sessions(&SessionFilter {
                from: Some(ts("2024-05-02T00:00:00Z")),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, b);
    }

    #[tokio::test]
    async fn csv_export_has_stable_columns_and_filtering() {
        let log = memory_log().await;
        let a = log
            .open_session("A", Some("1"), 1000, ts("2024-05-01T10:00:00Z"))
            .await
            .unwrap();
        log.close_session(a, 2000, ts("2024-05-01T11:00:00Z"), Some("Local"))
            .await
            .unwrap();
        let b = log
            .open_session("B", Some("2"), 0, ts("2024-05-01T12:00:00Z"))
            .await
            .unwrap();
        log.close_session(b, 500, ts("2024-05-01T12:30:00Z"), None)
            .await
            .unwrap();

        let csv = log
            .export_csv(&SessionFilter {
                backend_id: Some("A".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines[0],
            "session_id,backend_id,start_ts,stop_ts,start_meter_wh,stop_meter_wh,energy_wh,reason"
        );
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[1],
            format!("{a},A,2024-05-01T10:00:00Z,2024-05-01T11:00:00Z,1000,2000,1000,Local")
        );
    }

    #[tokio::test]
    async fn closing_unknown_session_is_not_found() {
        let log = memory_log().await;
        let err = log
            .close_session(99, 0, ts("2024-05-01T10:00:00Z"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SessionNotFound");
    }

    #[tokio::test]
    async fn sessions_survive_reconnect() {
        // restart-recovery: write through one connection, read through a new one
        let path = std::env::temp_dir().join(format!(
            "ocpp-proxy-test-{}.sqlite",
            uuid::Uuid::new_v4()
        ));
        let url = format!("sqlite://{}?mode=rwc", path.display());

        {
            let db = init_database(&url).await.unwrap();
            Migrator::up(&db, None).await.unwrap();
            let log = spawn_session_log(db);
            let id = log
                .open_session("A", Some("17"), 1000, ts("2024-05-01T10:00:00Z"))
                .await
                .unwrap();
            log.close_session(id, 3500, ts("2024-05-01T11:30:00Z"), Some("Remote"))
                .await
                .unwrap();
        }

        let db = init_database(&url).await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let log = spawn_session_log(db);
        let sessions = log.list_sessions(&SessionFilter::default()).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].backend_id, "A");
        assert_eq!(sessions[0].energy_wh(), Some(2500));

        let _ = std::fs::remove_file(&path);
    }
}
