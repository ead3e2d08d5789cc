//! Charging session record
//!
//! A session is one charging episode derived from protocol events, owned and
//! persisted by the session log. The CSV column order is a public contract.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Header row of the CSV export. Column order is stable.
pub const CSV_HEADER: &str =
    "session_id,backend_id,start_ts,stop_ts,start_meter_wh,stop_meter_wh,energy_wh,reason";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingSession {
    /// Proxy-assigned monotonic id.
    pub id: i64,
    /// Backend holding the control lock when the transaction started.
    pub backend_id: String,
    /// Charger-reported transaction id (proxy-assigned for 1.6).
    pub charger_tx_id: Option<String>,
    pub start_meter_wh: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_meter_wh: Option<i64>,
    /// Most recent interim meter reading; the stop meter stays authoritative.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_meter_wh: Option<i64>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

impl ChargingSession {
    /// A session is open iff it has no stop timestamp.
    pub fn is_open(&self) -> bool {
        self.stopped_at.is_none()
    }

    /// Energy delivered, known once the session is closed.
    pub fn energy_wh(&self) -> Option<i64> {
        self.stop_meter_wh.map(|stop| stop - self.start_meter_wh)
    }

    /// One CSV data row, columns per [`CSV_HEADER`].
    pub fn csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{}",
            self.id,
            self.backend_id,
            format_ts(self.started_at),
            self.stopped_at.map(format_ts).unwrap_or_default(),
            self.start_meter_wh,
            self.stop_meter_wh
                .map(|v| v.to_string())
                .unwrap_or_default(),
            self.energy_wh().map(|v| v.to_string()).unwrap_or_default(),
            self.stop_reason.as_deref().unwrap_or_default(),
        )
    }
}

/// ISO-8601 UTC with seconds precision.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Query filter for session listings and exports.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionFilter {
    /// Sessions started at or after this instant.
    pub from: Option<DateTime<Utc>>,
    /// Sessions started at or before this instant.
    pub to: Option<DateTime<Utc>>,
    pub backend_id: Option<String>,
}
