//! Unified charger status
//!
//! The internal status vocabulary is the OCPP 1.6 connector status set plus
//! `Unknown` for 2.0.1 states the proxy does not track. 2.0.1's narrower
//! enum is widened on decode (`Occupied` → `Preparing`; the charger session
//! reports `Charging` while a transaction is open).

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChargerStatus {
    Available,
    Preparing,
    Charging,
    SuspendedEV,
    SuspendedEVSE,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
    Unknown,
}

impl ChargerStatus {
    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Preparing => "Preparing",
            Self::Charging => "Charging",
            Self::SuspendedEV => "SuspendedEV",
            Self::SuspendedEVSE => "SuspendedEVSE",
            Self::Finishing => "Finishing",
            Self::Reserved => "Reserved",
            Self::Unavailable => "Unavailable",
            Self::Faulted => "Faulted",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ChargerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faulted_detection() {
        assert!(ChargerStatus::Faulted.is_faulted());
        assert!(!ChargerStatus::Charging.is_faulted());
    }

    #[test]
    fn serializes_as_bare_name() {
        assert_eq!(
            serde_json::to_string(&ChargerStatus::SuspendedEV).unwrap(),
            "\"SuspendedEV\""
        );
    }
}
