//! Backend-facing wire protocol (control frames exchanged with inbound
//! backends over `/backend`).

pub mod protocol;

pub use protocol::{ClientFrame, ControlWireStatus, ServerFrame};
