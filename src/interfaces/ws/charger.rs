//! Charger WebSocket endpoint
//!
//! `WS /charger` is the CSMS face of the proxy. The OCPP version is fixed
//! during the upgrade, consulting in priority order: the
//! `Sec-WebSocket-Protocol` offer, the `X-OCPP-Version` header, the
//! `version` query parameter, a version path suffix, and finally the
//! configured default. An offer that contains no recognized subprotocol is
//! refused with 400. A second charger connection while one is live is
//! refused with 409.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::{info, warn};

use crate::application::charger::run_charger_session;
use crate::domain::OcppVersion;
use crate::interfaces::http::AppState;
use crate::support::ProxyError;

#[derive(Debug, Deserialize)]
pub struct ChargerQuery {
    /// Charger identity; falls back to the configured default.
    pub id: Option<String>,
    /// Detection source (c): `?version=2.0.1`.
    pub version: Option<String>,
}

/// Pick the wire version for a charger upgrade.
pub fn detect_version(
    default_version: OcppVersion,
    auto_detect: bool,
    headers: &HeaderMap,
    query_version: Option<&str>,
    path_suffix: Option<&str>,
) -> Result<OcppVersion, ProxyError> {
    if !auto_detect {
        return Ok(default_version);
    }

    // (a) WebSocket subprotocol offer, newest mutual version wins
    if let Some(offered) = headers
        .get("sec-websocket-protocol")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
    {
        let offers: Vec<&str> = offered.split(',').map(str::trim).collect();
        for candidate in OcppVersion::ALL {
            if offers.iter().any(|p| *p == candidate.subprotocol()) {
                return Ok(*candidate);
            }
        }
        return Err(ProxyError::VersionMismatch(format!(
            "no supported subprotocol in '{offered}'"
        )));
    }

    // (b) custom version header
    if let Some(header) = headers
        .get("x-ocpp-version")
        .and_then(|value| value.to_str().ok())
    {
        return OcppVersion::from_version_str(header).ok_or_else(|| {
            ProxyError::VersionMismatch(format!("unknown X-OCPP-Version '{header}'"))
        });
    }

    // (c) query parameter
    if let Some(version) = query_version {
        return OcppVersion::from_version_str(version).ok_or_else(|| {
            ProxyError::VersionMismatch(format!("unknown version '{version}'"))
        });
    }

    // (d) path suffix
    if let Some(suffix) = path_suffix {
        return OcppVersion::from_version_str(suffix).ok_or_else(|| {
            ProxyError::VersionMismatch(format!("unknown version path '{suffix}'"))
        });
    }

    // (e) configured default
    Ok(default_version)
}

/// `WS /charger`
pub async fn charger_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ChargerQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, query, headers, state, None)
}

/// `WS /charger/{version}` (detection source (d))
pub async fn charger_ws_handler_versioned(
    ws: WebSocketUpgrade,
    Path(suffix): Path<String>,
    Query(query): Query<ChargerQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, query, headers, state, Some(suffix))
}

fn upgrade(
    ws: WebSocketUpgrade,
    query: ChargerQuery,
    headers: HeaderMap,
    state: AppState,
    path_suffix: Option<String>,
) -> Response {
    let version = match detect_version(
        state.config.ocpp_version,
        state.config.auto_detect_ocpp_version,
        &headers,
        query.version.as_deref(),
        path_suffix.as_deref(),
    ) {
        Ok(version) => version,
        Err(e) => {
            warn!(error = %e, "charger version selection failed");
            return e.into_response();
        }
    };

    let Some(claim) = state.charger.try_claim() else {
        warn!("second charger connection refused");
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": { "code": "DuplicateCharger", "message": "a charger is already connected" }
            })),
        )
            .into_response();
    };

    let charger_id = query
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| state.config.charger.default_id.clone());
    info!(charger_id = charger_id.as_str(), %version, "charger upgrade accepted");

    ws.protocols([version.subprotocol()])
        .on_upgrade(move |socket| run_charger_session(socket, claim, charger_id, version))
}
