//! [`Transport`] over the WebSocket broker server in [`crate::transport`].
//!
//! One socket carries a whole session. Requests are matched to replies by
//! frame id and deliveries are routed to consumers by subscription id,
//! which the client picks before sending `consume` so that no delivery can
//! arrive for an unknown subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::oneshot;
use tokio_tungstenite::connect_async;
use tracing::{debug, trace, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::transport::{
    Channel, Credentials, Delivery, MessageProperties, QueueOptions, Session, Transport,
    TransportError,
};
use crate::transport::message::{ClientFrame, ServerFrame};

type Reply = Result<Option<String>, TransportError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

fn broker_url(host: &str) -> String {
    if host.starts_with("ws://") || host.starts_with("wss://") {
        host.to_string()
    } else {
        format!("ws://{host}")
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        host: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Session>, TransportError> {
        let url = broker_url(host);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Unreachable(format!("{url}: {e}")))?;
        debug!("connected to broker at {url}");

        let link = Link::start(ws_stream);
        link.request(|id| ClientFrame::Hello {
            id,
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        })
        .await?;

        Ok(Arc::new(WsSession { link }))
    }
}

struct Link {
    outgoing: UnboundedSender<WsMessage>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    subscriptions: Mutex<HashMap<u64, UnboundedSender<Delivery>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Link {
    fn start<S>(ws_stream: tokio_tungstenite::WebSocketStream<S>) -> Arc<Self>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

        let link = Arc::new(Link {
            outgoing: tx,
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        // Ends once the link is dropped, closing the socket.
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    debug!("broker socket send failed: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let weak = Arc::downgrade(&link);
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("broker socket read failed: {e}");
                        break;
                    }
                };
                if msg.is_close() {
                    break;
                }
                if !msg.is_text() {
                    continue;
                }
                let Ok(text) = msg.to_text() else {
                    continue;
                };
                let frame = match serde_json::from_str::<ServerFrame>(text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("invalid frame from broker: {e}");
                        continue;
                    }
                };
                let Some(link) = weak.upgrade() else {
                    break;
                };
                link.route(frame);
            }
            if let Some(link) = weak.upgrade() {
                link.shut();
            }
        });

        link
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn route(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Ok { id, result } => self.resolve(id, Ok(result)),
            ServerFrame::Error { id, error } => self.resolve(id, Err(error)),
            ServerFrame::Deliver {
                subscription,
                delivery_tag,
                consumer_tag,
                exchange,
                routing_key,
                redelivered,
                payload,
                properties,
            } => {
                let delivery = Delivery {
                    delivery_tag,
                    consumer_tag,
                    exchange,
                    routing_key,
                    redelivered,
                    payload,
                    properties,
                };
                let mut subscriptions = lock(&self.subscriptions);
                match subscriptions.get(&subscription) {
                    Some(sender) => {
                        if sender.send(delivery).is_err() {
                            subscriptions.remove(&subscription);
                        }
                    }
                    None => trace!("delivery for unknown subscription {subscription}"),
                }
            }
        }
    }

    fn resolve(&self, id: u64, reply: Reply) {
        match lock(&self.pending).remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => trace!("reply to unknown request {id}"),
        }
    }

    /// Fails every pending request and ends every consumer.
    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, waiter) in lock(&self.pending).drain() {
            let _ = waiter.send(Err(TransportError::ChannelClosed(
                "broker connection lost".into(),
            )));
        }
        lock(&self.subscriptions).clear();
        debug!("broker link closed");
    }

    async fn request(&self, build: impl FnOnce(u64) -> ClientFrame) -> Reply {
        let closed = || TransportError::ChannelClosed("broker connection closed".into());
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed());
        }

        let id = self.next_id();
        let text = serde_json::to_string(&build(id))
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        if self.closed.load(Ordering::SeqCst) || self.outgoing.send(WsMessage::text(text)).is_err()
        {
            lock(&self.pending).remove(&id);
            return Err(closed());
        }

        rx.await.map_err(|_| closed())?
    }
}

pub struct WsSession {
    link: Arc<Link>,
}

#[async_trait]
impl Session for WsSession {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let reply = self
            .link
            .request(|id| ClientFrame::OpenChannel { id })
            .await?;
        let id = reply
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| TransportError::Protocol("broker sent no channel id".into()))?;

        Ok(Arc::new(WsChannel {
            link: self.link.clone(),
            id,
            consumers: Mutex::new(HashMap::new()),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = self.link.request(|id| ClientFrame::Close { id }).await;
        lock(&self.link.subscriptions).clear();
        result.map(|_| ())
    }
}

pub struct WsChannel {
    link: Arc<Link>,
    id: u64,
    /// Consumer tag → subscription id.
    consumers: Mutex<HashMap<String, u64>>,
}

impl WsChannel {
    fn drop_subscription(&self, consumer_tag: &str) {
        if let Some(subscription) = lock(&self.consumers).remove(consumer_tag) {
            lock(&self.link.subscriptions).remove(&subscription);
        }
    }
}

#[async_trait]
impl Channel for WsChannel {
    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<(), TransportError> {
        self.link
            .request(|id| ClientFrame::DeclareExchange {
                id,
                channel: self.id,
                name: name.to_string(),
                durable,
            })
            .await
            .map(|_| ())
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, TransportError> {
        self.link
            .request(|id| ClientFrame::DeclareQueue {
                id,
                channel: self.id,
                name: name.to_string(),
                options,
            })
            .await?
            .ok_or_else(|| TransportError::Protocol("broker sent no queue name".into()))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), TransportError> {
        self.link
            .request(|id| ClientFrame::BindQueue {
                id,
                channel: self.id,
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
            })
            .await
            .map(|_| ())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), TransportError> {
        self.link
            .request(|id| ClientFrame::UnbindQueue {
                id,
                channel: self.id,
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
            })
            .await
            .map(|_| ())
    }

    async fn consume(
        &self,
        queue: &str,
        no_ack: bool,
        deliveries: UnboundedSender<Delivery>,
    ) -> Result<String, TransportError> {
        let subscription = self.link.next_id();
        lock(&self.link.subscriptions).insert(subscription, deliveries);

        let reply = self
            .link
            .request(|id| ClientFrame::Consume {
                id,
                channel: self.id,
                queue: queue.to_string(),
                no_ack,
                subscription,
            })
            .await;

        match reply {
            Ok(Some(tag)) => {
                lock(&self.consumers).insert(tag.clone(), subscription);
                Ok(tag)
            }
            Ok(None) => {
                lock(&self.link.subscriptions).remove(&subscription);
                Err(TransportError::Protocol("broker sent no consumer tag".into()))
            }
            Err(e) => {
                lock(&self.link.subscriptions).remove(&subscription);
                Err(e)
            }
        }
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let result = self
            .link
            .request(|id| ClientFrame::Cancel {
                id,
                channel: self.id,
                consumer_tag: consumer_tag.to_string(),
            })
            .await;
        self.drop_subscription(consumer_tag);
        result.map(|_| ())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), TransportError> {
        self.link
            .request(|id| ClientFrame::Publish {
                id,
                channel: self.id,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload,
                properties,
            })
            .await
            .map(|_| ())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.link
            .request(|id| ClientFrame::Ack {
                id,
                channel: self.id,
                delivery_tag,
            })
            .await
            .map(|_| ())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.link
            .request(|id| ClientFrame::Nack {
                id,
                channel: self.id,
                delivery_tag,
                requeue,
            })
            .await
            .map(|_| ())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.link
            .request(|id| ClientFrame::DeleteQueue {
                id,
                channel: self.id,
                queue: queue.to_string(),
            })
            .await
            .map(|_| ())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = self
            .link
            .request(|id| ClientFrame::CloseChannel {
                id,
                channel: self.id,
            })
            .await;
        let tags: Vec<String> = lock(&self.consumers).keys().cloned().collect();
        for tag in tags {
            self.drop_subscription(&tag);
        }
        result.map(|_| ())
    }
}
