//! Presence and override sources
//!
//! The proxy consults two external booleans: "is anyone home" (presence
//! gate) and "is the administrative override on". Both are modeled as small
//! pollable interfaces; the concrete binding is either the Home Assistant
//! REST API or a fixed constant. Poller tasks cache each source at 1 Hz so
//! the arbitration engine never blocks on HTTP.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::application::arbitration::ArbiterHandle;
use crate::support::ShutdownSignal;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[async_trait]
pub trait PresenceSource: Send + Sync {
    /// Does the configured presence entity currently report "home"?
    async fn is_present(&self) -> bool;
}

#[async_trait]
pub trait OverrideSource: Send + Sync {
    /// Is the external override switch on?
    async fn is_active(&self) -> bool;
}

// ── Fixed binding ──────────────────────────────────────────────

/// Constant source, used when no home-automation binding is configured.
pub struct FixedFlag(pub bool);

#[async_trait]
impl PresenceSource for FixedFlag {
    async fn is_present(&self) -> bool {
        self.0
    }
}

#[async_trait]
impl OverrideSource for FixedFlag {
    async fn is_active(&self) -> bool {
        self.0
    }
}

// ── Home Assistant binding ─────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EntityState {
    state: String,
}

/// Reads one entity's state from the Home Assistant REST API.
pub struct HomeAssistantSource {
    client: reqwest::Client,
    base_url: String,
    token: String,
    entity_id: String,
}

impl HomeAssistantSource {
    pub fn new(base_url: &str, token: &str, entity_id: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            entity_id: entity_id.to_string(),
        }
    }

    async fn state(&self) -> Option<String> {
        let url = format!("{}/api/states/{}", self.base_url, self.entity_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => {
                match response.json::<EntityState>().await {
                    Ok(entity) => Some(entity.state),
                    Err(e) => {
                        warn!(entity_id = self.entity_id.as_str(), error = %e, "bad entity state");
                        None
                    }
                }
            }
            Ok(response) => {
                warn!(
                    entity_id = self.entity_id.as_str(),
                    status = %response.status(),
                    "entity state request rejected"
                );
                None
            }
            Err(e) => {
                warn!(entity_id = self.entity_id.as_str(), error = %e, "entity state request failed");
                None
            }
        }
    }
}

#[async_trait]
impl PresenceSource for HomeAssistantSource {
    async fn is_present(&self) -> bool {
        matches!(self.state().await.as_deref(), Some("home"))
    }
}

#[async_trait]
impl OverrideSource for HomeAssistantSource {
    async fn is_active(&self) -> bool {
        matches!(self.state().await.as_deref(), Some("on"))
    }
}

// ── Cached pollers ─────────────────────────────────────────────

/// Read side of a 1 Hz cached boolean.
#[derive(Clone)]
pub struct CachedFlag {
    value: Arc<AtomicBool>,
}

impl CachedFlag {
    pub fn get(&self) -> bool {
        self.value.load(Ordering::Relaxed)
    }

    pub fn handle(&self) -> Arc<AtomicBool> {
        self.value.clone()
    }
}

/// Poll the presence source into a cached flag.
pub fn spawn_presence_poller(
    source: Arc<dyn PresenceSource>,
    shutdown: ShutdownSignal,
) -> CachedFlag {
    let value = Arc::new(AtomicBool::new(false));
    let flag = CachedFlag {
        value: value.clone(),
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let present = source.is_present().await;
                    if value.swap(present, Ordering::Relaxed) != present {
                        debug!(present, "presence changed");
                    }
                }
                _ = shutdown.wait() => break,
            }
        }
    });
    flag
}

/// Poll the override source and push edges into the arbitration engine
/// (activation must revoke the current holder immediately).
pub fn spawn_override_poller(
    source: Arc<dyn OverrideSource>,
    arbiter: ArbiterHandle,
    shutdown: ShutdownSignal,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        let mut last = false;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let active = source.is_active().await;
                    if active != last {
                        debug!(active, "override source changed");
                        arbiter.set_source_override(active).await;
                        last = active;
                    }
                }
                _ = shutdown.wait() => break,
            }
        }
    });
}
