//! Broker connection lifecycle.
//!
//! A `BrokerConnection` owns one session with the broker and exactly two
//! channels: one dedicated to publishing and one dedicated to consuming. Both
//! are created on first use and cached. Every channel asserts the configured
//! durable topic exchange when it is created.
//!
//! The consume channel serves a single exclusive queue; additional patterns
//! are added to that queue as extra bindings.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::transport::{
    Channel, Credentials, MessageProperties, QueueOptions, Session, Transport, TransportError,
};
use crate::config::BrokerSettings;
use crate::utils::error::{Error, Result, ResultExt};

/// A channel together with the queue it has bound, if any.
pub struct ChannelHandle {
    channel: Arc<dyn Channel>,
    bound_queue: Mutex<Option<String>>,
}

impl ChannelHandle {
    fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            bound_queue: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub async fn bound_queue(&self) -> Option<String> {
        self.bound_queue.lock().await.clone()
    }
}

pub struct BrokerConnection {
    transport: Arc<dyn Transport>,
    settings: BrokerSettings,
    session: Mutex<Option<Arc<dyn Session>>>,
    publish_channel: Mutex<Option<Arc<ChannelHandle>>>,
    consume_channel: Mutex<Option<Arc<ChannelHandle>>>,
}

impl BrokerConnection {
    pub fn new(transport: Arc<dyn Transport>, settings: BrokerSettings) -> Self {
        Self {
            transport,
            settings,
            session: Mutex::new(None),
            publish_channel: Mutex::new(None),
            consume_channel: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn exchange(&self) -> &str {
        &self.settings.exchange
    }

    /// Opens the session, or returns the one already open.
    ///
    /// Concurrent callers wait for the attempt in progress and share its
    /// result. An unreachable broker is retried up to `reconnect_attempts`
    /// times, `reconnect_timeout` apart.
    pub async fn connect(&self) -> Result<Arc<dyn Session>> {
        let mut session = self.session.lock().await;
        if let Some(existing) = session.as_ref() {
            return Ok(existing.clone());
        }

        let credentials = Credentials::new(&self.settings.username, &self.settings.password);
        let mut attempt = 0;
        let opened = loop {
            attempt += 1;
            match self.transport.connect(&self.settings.host, &credentials).await {
                Ok(opened) => break opened,
                Err(e @ TransportError::Unreachable(_))
                    if attempt <= self.settings.reconnect_attempts =>
                {
                    warn!(
                        "broker at {} unreachable ({e}), retrying in {:?}",
                        self.settings.host, self.settings.reconnect_timeout
                    );
                    tokio::time::sleep(self.settings.reconnect_timeout).await;
                }
                Err(e) => return Err(Error::critical("Connection creation error", e)),
            }
        };

        info!("connected to broker at {}", self.settings.host);
        *session = Some(opened.clone());
        Ok(opened)
    }

    async fn create_channel(&self) -> Result<Arc<ChannelHandle>> {
        let session = self.connect().await?;
        let channel = session
            .create_channel()
            .await
            .critical("Channel creation error")?;
        channel
            .declare_exchange(&self.settings.exchange, true)
            .await
            .critical("Channel creation error")?;
        Ok(Arc::new(ChannelHandle::new(channel)))
    }

    pub async fn publish_channel(&self) -> Result<Arc<ChannelHandle>> {
        let mut slot = self.publish_channel.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }
        let handle = self.create_channel().await?;
        *slot = Some(handle.clone());
        Ok(handle)
    }

    pub async fn consume_channel(&self) -> Result<Arc<ChannelHandle>> {
        let mut slot = self.consume_channel.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }
        let handle = self.create_channel().await?;
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// The consume channel, only if it has already been created.
    pub async fn existing_consume_channel(&self) -> Option<Arc<ChannelHandle>> {
        self.consume_channel.lock().await.clone()
    }

    /// Publishes `payload` to `exchange` with `topic` as routing key.
    ///
    /// The configured message expiry applies unless `properties` sets one.
    pub async fn publish(
        &self,
        exchange: &str,
        topic: &str,
        payload: Vec<u8>,
        mut properties: MessageProperties,
    ) -> Result<()> {
        let handle = self.publish_channel().await.critical("Publish error")?;
        if properties.expiration.is_none() {
            if let Some(expiry) = self.settings.message_expiry {
                properties = properties.with_expiration(expiry);
            }
        }
        handle
            .channel
            .publish(exchange, topic, payload, properties)
            .await
            .critical("Publish error")
    }

    /// Binds `pattern` to the channel's queue, declaring the exclusive queue
    /// first if the channel has none yet. Returns the queue name.
    pub async fn bind_queue(&self, handle: &ChannelHandle, pattern: &str) -> Result<String> {
        let mut bound = handle.bound_queue.lock().await;
        let queue = match bound.as_ref() {
            Some(queue) => queue.clone(),
            None => {
                let requested = self.settings.queue.as_deref().unwrap_or("");
                let queue = handle
                    .channel
                    .declare_queue(requested, QueueOptions::exclusive())
                    .await
                    .critical("Queue creation error")?;
                debug!("declared consume queue {queue}");
                *bound = Some(queue.clone());
                queue
            }
        };

        handle
            .channel
            .bind_queue(&queue, &self.settings.exchange, pattern)
            .await
            .critical("Queue binding error")?;
        Ok(queue)
    }

    /// Removes one pattern binding. The queue itself stays.
    pub async fn unbind_queue(&self, handle: &ChannelHandle, pattern: &str) -> Result<()> {
        let bound = handle.bound_queue.lock().await;
        let Some(queue) = bound.as_ref() else {
            return Ok(());
        };
        handle
            .channel
            .unbind_queue(queue, &self.settings.exchange, pattern)
            .await
            .critical("Queue unbinding error")
    }

    /// Deletes the consume queue, closes both channels, then the session.
    /// Pieces that were never created are skipped.
    pub async fn disconnect(&self) -> Result<()> {
        let consume = self.consume_channel.lock().await.take();
        if let Some(handle) = consume {
            if let Some(queue) = handle.bound_queue.lock().await.take() {
                handle
                    .channel
                    .delete_queue(&queue)
                    .await
                    .critical("Queue deletion error")?;
            }
            handle
                .channel
                .close()
                .await
                .critical("Channel closing error")?;
        }

        let publish = self.publish_channel.lock().await.take();
        if let Some(handle) = publish {
            handle
                .channel
                .close()
                .await
                .critical("Channel closing error")?;
        }

        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.close().await.critical("Connection closing error")?;
            info!("disconnected from broker at {}", self.settings.host);
        }
        Ok(())
    }
}
