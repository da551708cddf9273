//! # svclink
//!
//! `svclink` is the plumbing shared by a fleet of small services: calling one
//! another over HTTP or through a topic-based message broker, and
//! bootstrapping configuration from a file, the environment and a remote
//! settings service.
//!
//! ## Core Modules
//!
//! - `broker`: broker connection, topic subscriptions, and the transport seam
//!   with an in-process broker and a WebSocket client.
//! - `config`: layered configuration with periodic remote refetch.
//! - `rpc`: direct (HTTP) and mediate (broker) request/response calls.
//! - `transport`: the WebSocket broker server and its frame protocol.
//! - `utils`: error type and logging setup.

pub mod broker;
pub mod config;
pub mod rpc;
pub mod transport;
pub mod utils;
