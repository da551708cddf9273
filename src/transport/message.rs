//! Frames exchanged between a broker client and the WebSocket broker server.
//!
//! Every client frame carries a request `id`; the server answers it with
//! exactly one `ok` or `error` frame bearing the same id. `deliver` frames
//! are pushed by the server at any time and name the client-side
//! `subscription` they belong to, so a delivery can arrive before the
//! `consume` request that created it has been answered.
//!
//! Payloads travel base64-encoded.

use serde::{Deserialize, Serialize};

use crate::broker::transport::{Delivery, MessageProperties, QueueOptions, TransportError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Hello {
        id: u64,
        username: String,
        password: String,
    },
    OpenChannel {
        id: u64,
    },
    CloseChannel {
        id: u64,
        channel: u64,
    },
    DeclareExchange {
        id: u64,
        channel: u64,
        name: String,
        durable: bool,
    },
    DeclareQueue {
        id: u64,
        channel: u64,
        name: String,
        options: QueueOptions,
    },
    BindQueue {
        id: u64,
        channel: u64,
        queue: String,
        exchange: String,
        pattern: String,
    },
    UnbindQueue {
        id: u64,
        channel: u64,
        queue: String,
        exchange: String,
        pattern: String,
    },
    Consume {
        id: u64,
        channel: u64,
        queue: String,
        no_ack: bool,
        subscription: u64,
    },
    Cancel {
        id: u64,
        channel: u64,
        consumer_tag: String,
    },
    Publish {
        id: u64,
        channel: u64,
        exchange: String,
        routing_key: String,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
        #[serde(default)]
        properties: MessageProperties,
    },
    Ack {
        id: u64,
        channel: u64,
        delivery_tag: u64,
    },
    Nack {
        id: u64,
        channel: u64,
        delivery_tag: u64,
        requeue: bool,
    },
    DeleteQueue {
        id: u64,
        channel: u64,
        queue: String,
    },
    Close {
        id: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Ok {
        id: u64,
        /// Channel id, queue name or consumer tag, depending on the request.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    Error {
        id: u64,
        error: TransportError,
    },
    Deliver {
        subscription: u64,
        delivery_tag: u64,
        consumer_tag: String,
        exchange: String,
        routing_key: String,
        redelivered: bool,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
        #[serde(default)]
        properties: MessageProperties,
    },
}

impl ServerFrame {
    pub fn deliver(subscription: u64, delivery: Delivery) -> Self {
        ServerFrame::Deliver {
            subscription,
            delivery_tag: delivery.delivery_tag,
            consumer_tag: delivery.consumer_tag,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            redelivered: delivery.redelivered,
            payload: delivery.payload,
            properties: delivery.properties,
        }
    }

    pub fn reply(id: u64, result: Result<Option<String>, TransportError>) -> Self {
        match result {
            Ok(result) => ServerFrame::Ok { id, result },
            Err(error) => ServerFrame::Error { id, error },
        }
    }
}

impl ClientFrame {
    pub fn id(&self) -> u64 {
        match self {
            ClientFrame::Hello { id, .. }
            | ClientFrame::OpenChannel { id }
            | ClientFrame::CloseChannel { id, .. }
            | ClientFrame::DeclareExchange { id, .. }
            | ClientFrame::DeclareQueue { id, .. }
            | ClientFrame::BindQueue { id, .. }
            | ClientFrame::UnbindQueue { id, .. }
            | ClientFrame::Consume { id, .. }
            | ClientFrame::Cancel { id, .. }
            | ClientFrame::Publish { id, .. }
            | ClientFrame::Ack { id, .. }
            | ClientFrame::Nack { id, .. }
            | ClientFrame::DeleteQueue { id, .. }
            | ClientFrame::Close { id } => *id,
        }
    }
}

pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
