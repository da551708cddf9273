//! Message-broker adapter.
//!
//! [`connection::BrokerConnection`] owns the session and the publish/consume
//! channels, [`registry::TopicSubscriptionRegistry`] tracks which consumer
//! tags are bound under which topic pattern, and [`transport`] is the seam a
//! broker implementation plugs into. [`memory::MemoryBroker`] runs in process;
//! [`ws::WsTransport`] reaches the WebSocket broker server.

pub mod connection;
pub mod memory;
pub mod message;
pub mod pattern;
pub mod registry;
pub mod topic;
pub mod transport;
pub mod ws;

pub use connection::{BrokerConnection, ChannelHandle};
pub use memory::MemoryBroker;
pub use message::Message;
pub use registry::{Acker, TopicSubscriptionRegistry};
pub use transport::{Credentials, MessageProperties, Transport};
