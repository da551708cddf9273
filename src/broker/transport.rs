//! Broker protocol seam.
//!
//! The adapter in [`crate::broker::connection`] talks to a broker only through
//! these traits. A [`Transport`] opens sessions (connections), a [`Session`]
//! opens channels, and a [`Channel`] carries the AMQP-style verbs: exchange
//! and queue declaration, bindings, consumers, publishing and
//! acknowledgements.
//!
//! Deliveries are pushed into the `mpsc` sender handed to
//! [`Channel::consume`]. Cancelling the consumer drops that sender, so a
//! receive loop over the matching receiver ends on its own.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("access refused for user `{0}`")]
    AccessRefused(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("resource locked: {0}")]
    Locked(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Per-message properties carried next to the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Time to live in milliseconds, as a decimal string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, topic: impl Into<String>) -> Self {
        self.reply_to = Some(topic.into());
        self
    }

    pub fn with_expiration(mut self, millis: u64) -> Self {
        self.expiration = Some(millis.to_string());
        self
    }

    /// Parsed expiration, ignoring values that are not a millisecond count.
    pub fn expiration_millis(&self) -> Option<u64> {
        self.expiration.as_deref().and_then(|e| e.trim().parse().ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOptions {
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            auto_delete: true,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Session>, TransportError>;
}

#[async_trait]
pub trait Session: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError>;

    /// Closes every channel opened on this session, then the session itself.
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Channel: Send + Sync {
    /// Asserts a topic exchange. Re-declaring an existing exchange is a no-op.
    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<(), TransportError>;

    /// Declares a queue. An empty `name` asks the broker to generate one.
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), TransportError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), TransportError>;

    /// Starts a consumer and returns its broker-assigned tag.
    async fn consume(
        &self,
        queue: &str,
        no_ack: bool,
        deliveries: UnboundedSender<Delivery>,
    ) -> Result<String, TransportError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    async fn delete_queue(&self, queue: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
