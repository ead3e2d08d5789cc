//! Delivery mechanisms: the HTTP surface and the two WebSocket endpoints.

pub mod http;
pub mod ws;
