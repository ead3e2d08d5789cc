//! Event pump
//!
//! The single pipeline between the charger event bus and everything driven
//! by it. Per event, strictly in order: (1) session accounting, (2) the
//! arbitration engine's reaction (fault suspension, revocation frames),
//! (3) fan-out to backends. Because revocation frames are enqueued before
//! the event itself is broadcast, a lock holder always sees its revocation
//! before the event that caused it.

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::arbitration::ArbiterHandle;
use crate::application::events::SharedEventBus;
use crate::application::registry::SharedBackendRegistry;
use crate::domain::ChargerEvent;
use crate::infrastructure::sessionlog::SessionLogHandle;
use crate::support::ShutdownSignal;

struct OpenSession {
    id: i64,
    charger_tx_id: Option<String>,
}

pub fn spawn_event_pump(
    bus: SharedEventBus,
    log: SessionLogHandle,
    arbiter: ArbiterHandle,
    registry: SharedBackendRegistry,
    shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(run(bus, log, arbiter, registry, shutdown))
}

async fn run(
    bus: SharedEventBus,
    log: SessionLogHandle,
    arbiter: ArbiterHandle,
    registry: SharedBackendRegistry,
    shutdown: ShutdownSignal,
) {
    let mut sub = bus.subscribe();

    // Recover the open session after a restart so a StopTransaction arriving
    // on reconnect still closes the right row.
    let mut open = match log.find_open().await {
        Ok(Some(session)) => {
            info!(session_id = session.id, "recovered open session");
            Some(OpenSession {
                id: session.id,
                charger_tx_id: session.charger_tx_id,
            })
        }
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "open-session recovery failed");
            None
        }
    };

    info!("event pump started");
    loop {
        let event = tokio::select! {
            event = sub.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.wait() => break,
        };

        account(&log, &arbiter, &mut open, &event).await;
        arbiter.observe_event(&event).await;
        registry.broadcast(&event);
    }
    info!("event pump stopped");
}

/// Session accounting. A log failure degrades accounting but never breaks
/// the event stream.
async fn account(
    log: &SessionLogHandle,
    arbiter: &ArbiterHandle,
    open: &mut Option<OpenSession>,
    event: &ChargerEvent,
) {
    match event {
        ChargerEvent::TransactionStarted {
            transaction_id,
            meter_start_wh,
            timestamp,
            ..
        } => {
            // the lock holder at start owns the session; a locally started
            // charge has no holder
            let backend_id = arbiter
                .snapshot()
                .control_holder()
                .unwrap_or_else(|| "local".to_string());
            match log
                .open_session(&backend_id, Some(transaction_id), *meter_start_wh, *timestamp)
                .await
            {
                Ok(id) => {
                    *open = Some(OpenSession {
                        id,
                        charger_tx_id: Some(transaction_id.clone()),
                    });
                }
                Err(e) => warn!(error = %e, "failed to open session"),
            }
        }
        ChargerEvent::MeterSample {
            transaction_id,
            meter_wh,
            ..
        } => {
            if let Some(session) = open.as_ref() {
                let matches = match (transaction_id, &session.charger_tx_id) {
                    (Some(sample_tx), Some(open_tx)) => sample_tx == open_tx,
                    _ => true,
                };
                if matches {
                    if let Err(e) = log.record_meter(session.id, *meter_wh).await {
                        warn!(error = %e, "failed to record meter sample");
                    }
                }
            }
        }
        ChargerEvent::TransactionEnded {
            transaction_id,
            meter_stop_wh,
            reason,
            timestamp,
        } => match open.take() {
            Some(session) => {
                if let Some(open_tx) = &session.charger_tx_id {
                    if open_tx != transaction_id {
                        warn!(
                            open_tx,
                            ended_tx = transaction_id.as_str(),
                            "transaction id mismatch at stop, closing open session"
                        );
                    }
                }
                if let Err(e) = log
                    .close_session(session.id, *meter_stop_wh, *timestamp, reason.as_deref())
                    .await
                {
                    warn!(error = %e, "failed to close session");
                }
            }
            None => warn!(
                transaction_id = transaction_id.as_str(),
                "stop event without an open session"
            ),
        },
        _ => {}
    }
}
