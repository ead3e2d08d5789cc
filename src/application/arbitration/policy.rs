//! Control lock policy
//!
//! Pure evaluation of a `request_control` call against the configured policy
//! and the current lock state. The caller owns the clocks: the requester's
//! previous request timestamp goes in, and must be advanced on acceptance
//! *and* rejection.

use chrono::{DateTime, Duration, Utc};

use crate::support::ProxyError;

/// Immutable policy snapshot, loaded at startup.
#[derive(Debug, Clone)]
pub struct ControlPolicy {
    /// When false, only the preferred provider may hold the lock.
    pub allow_shared_charging: bool,
    /// Exempt from the presence gate; may preempt other holders.
    pub preferred_provider: Option<String>,
    /// Minimum interval between a backend's control requests.
    pub rate_limit_seconds: i64,
    /// Whitelist; empty means no whitelist.
    pub allowed_providers: Vec<String>,
    /// Blacklist.
    pub disallowed_providers: Vec<String>,
}

impl Default for ControlPolicy {
    fn default() -> Self {
        Self {
            allow_shared_charging: true,
            preferred_provider: None,
            rate_limit_seconds: 10,
            allowed_providers: Vec::new(),
            disallowed_providers: Vec::new(),
        }
    }
}

impl ControlPolicy {
    pub fn is_preferred(&self, backend_id: &str) -> bool {
        self.preferred_provider.as_deref() == Some(backend_id)
    }
}

/// Control lock state: a process-wide single-holder resource.
#[derive(Debug, Clone, PartialEq)]
pub enum LockState {
    Free,
    Held {
        backend_id: String,
        since: DateTime<Utc>,
    },
    Suspended {
        reason: &'static str,
    },
}

impl LockState {
    pub fn holder(&self) -> Option<&str> {
        match self {
            Self::Held { backend_id, .. } => Some(backend_id),
            _ => None,
        }
    }
}

/// Inputs that vary per request.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub now: DateTime<Utc>,
    /// The requester's previous `request_control` timestamp.
    pub last_request: Option<DateTime<Utc>>,
    /// Effective administrative override (external source OR manual toggle).
    pub override_active: bool,
    /// Presence source currently reports "home" (false when unconfigured).
    pub presence_home: bool,
}

/// Positive policy outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Grant {
    Granted,
    /// Granted by preempting the named previous holder.
    Preempted { previous: String },
}

/// Evaluate a `request_control` call. The rate-limit clock must be advanced
/// by the caller regardless of the outcome.
pub fn evaluate(
    policy: &ControlPolicy,
    lock: &LockState,
    backend_id: &str,
    ctx: RequestContext,
) -> Result<Grant, ProxyError> {
    // While the override is active, the override itself is the holder.
    if ctx.override_active {
        return Err(ProxyError::UserOverride);
    }

    if matches!(lock, LockState::Suspended { .. }) {
        return Err(ProxyError::ChargerFaulted);
    }

    if !policy.allow_shared_charging && !policy.is_preferred(backend_id) {
        return Err(ProxyError::ProviderNotAllowed);
    }

    if policy
        .disallowed_providers
        .iter()
        .any(|p| p == backend_id)
    {
        return Err(ProxyError::ProviderBlocked);
    }

    if !policy.allowed_providers.is_empty()
        && !policy.allowed_providers.iter().any(|p| p == backend_id)
    {
        return Err(ProxyError::ProviderNotAllowed);
    }

    if let Some(last) = ctx.last_request {
        if ctx.now - last < Duration::seconds(policy.rate_limit_seconds) {
            return Err(ProxyError::RateLimited);
        }
    }

    if ctx.presence_home && !policy.is_preferred(backend_id) {
        return Err(ProxyError::PresenceBlocked);
    }

    match lock {
        LockState::Free => Ok(Grant::Granted),
        LockState::Held {
            backend_id: holder, ..
        } if holder == backend_id => Ok(Grant::Granted),
        LockState::Held {
            backend_id: holder, ..
        } => {
            if policy.is_preferred(backend_id) && !policy.is_preferred(holder) {
                Ok(Grant::Preempted {
                    previous: holder.clone(),
                })
            } else {
                Err(ProxyError::AlreadyHeld)
            }
        }
        LockState::Suspended { .. } => unreachable!("checked above"),
    }
}
