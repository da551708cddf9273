//! Network face of the in-process broker.
//!
//! A [`MemoryBroker`](crate::broker::MemoryBroker) can be served to other
//! processes over WebSockets. Each client request is a JSON frame answered by
//! exactly one reply frame, and deliveries are pushed as they happen.
//! [`WsTransport`](crate::broker::ws::WsTransport) is the matching client.

pub mod message;
pub mod websocket;

pub use websocket::{serve, start_websocket_server};
