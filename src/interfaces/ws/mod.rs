//! WebSocket endpoints: `/charger` (OCPP) and `/backend` (control protocol).

pub mod backend;
pub mod charger;

pub use backend::backend_ws_handler;
pub use charger::{charger_ws_handler, charger_ws_handler_versioned};
