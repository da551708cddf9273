//! Messages handed to subscribers.
//!
//! A `Message` is built once from a broker [`Delivery`] and never changes
//! afterwards. `data` is the payload parsed as JSON; the raw bytes are kept
//! next to it for consumers that need them.

use serde_json::Value;

use crate::broker::transport::{Delivery, MessageProperties};

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub raw_payload: Vec<u8>,
    pub data: Value,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

impl Message {
    /// Parses the delivery payload. Fails when the payload is not JSON.
    pub fn from_delivery(delivery: &Delivery) -> Result<Self, serde_json::Error> {
        let data = serde_json::from_slice(&delivery.payload)?;
        Ok(Self {
            topic: delivery.routing_key.clone(),
            raw_payload: delivery.payload.clone(),
            data,
            properties: delivery.properties.clone(),
            redelivered: delivery.redelivered,
        })
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }
}
