//! REST handlers

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::application::arbitration::LockSnapshot;
use crate::application::charger::ChargerSnapshot;
use crate::domain::{BackendSnapshot, ChargingSession, SessionFilter};
use crate::support::ProxyError;

use super::AppState;

/// `GET /health`
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `GET /metrics` — Prometheus exposition
pub async fn metrics(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
        .into_response()
}

// ── Status ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub charger_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_holder: Option<String>,
    pub backends: Vec<BackendSnapshot>,
    pub version: &'static str,
    pub charger: ChargerSnapshot,
    pub lock: LockSnapshot,
}

fn build_status(state: &AppState) -> StatusResponse {
    let charger = state.charger.snapshot();
    let lock = state.arbiter.snapshot();

    let charger_status = if charger.connected {
        charger.status.to_string()
    } else {
        "Disconnected".to_string()
    };

    let mut backends = state.registry.snapshots();
    backends.extend(state.outbound.offline_snapshots(&state.registry));
    backends.sort_by(|a, b| a.id.cmp(&b.id));

    StatusResponse {
        charger_status,
        control_holder: lock.control_holder(),
        backends,
        version: env!("CARGO_PKG_VERSION"),
        charger,
        lock,
    }
}

/// `GET /status`
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(build_status(&state))
}

/// `GET /` — human-readable status page
pub async fn index(State(state): State<AppState>) -> Html<String> {
    let status = build_status(&state);
    let backends: String = if status.backends.is_empty() {
        "<li><em>none</em></li>".to_string()
    } else {
        status
            .backends
            .iter()
            .map(|b| {
                format!(
                    "<li><code>{}</code> — {:?}, {}</li>",
                    b.id,
                    b.state,
                    if b.subscribed {
                        "subscribed"
                    } else {
                        "not subscribed"
                    }
                )
            })
            .collect()
    };

    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>OCPP Proxy</title></head>
<body>
<h1>OCPP Proxy</h1>
<p>Charger: <strong>{charger_status}</strong></p>
<p>Control holder: <strong>{holder}</strong></p>
<h2>Backends</h2>
<ul>{backends}</ul>
<p><small>ocpp-proxy {version} — <a href="/status">status</a> · <a href="/sessions">sessions</a> · <a href="/sessions.csv">csv</a> · <a href="/metrics">metrics</a></small></p>
</body>
</html>
"#,
        charger_status = status.charger_status,
        holder = status.control_holder.as_deref().unwrap_or("none"),
        backends = backends,
        version = status.version,
    ))
}

// ── Sessions ───────────────────────────────────────────────────

/// `GET /sessions?from=&to=&backend_id=`
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(filter): Query<SessionFilter>,
) -> Result<Json<Vec<ChargingSession>>, ProxyError> {
    Ok(Json(state.log.list_sessions(&filter).await?))
}

/// `GET /sessions/{id}`
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ChargingSession>, ProxyError> {
    Ok(Json(state.log.get_session(id).await?))
}

/// `GET /sessions.csv` — same filters as `/sessions`
pub async fn export_sessions_csv(
    State(state): State<AppState>,
    Query(filter): Query<SessionFilter>,
) -> Result<Response, ProxyError> {
    let csv = state.log.export_csv(&filter).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"sessions.csv\"",
            ),
        ],
        csv,
    )
        .into_response())
}

// ── Override ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct OverrideBody {
    pub active: bool,
}

/// `POST /override` — body `{"active": bool}`
pub async fn set_override(
    State(state): State<AppState>,
    Json(body): Json<OverrideBody>,
) -> impl IntoResponse {
    info!(active = body.active, "administrative override toggled");
    state.arbiter.set_manual_override(body.active).await;
    (
        StatusCode::OK,
        Json(serde_json::json!({ "active": body.active })),
    )
}
