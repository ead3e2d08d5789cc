//! Cross-cutting utilities: errors, OCPP-J framing, shutdown, backoff.

pub mod backoff;
pub mod errors;
pub mod frame;
pub mod shutdown;

pub use errors::ProxyError;
pub use frame::OcppFrame;
pub use shutdown::ShutdownSignal;
