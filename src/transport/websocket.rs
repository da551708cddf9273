use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, error, info, trace, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::memory::MemoryBroker;
use crate::broker::transport::{Channel, Credentials, Session, Transport, TransportError};
use crate::transport::message::{ClientFrame, ServerFrame};
use crate::utils::error::Result;

/// Binds `addr` and serves `broker` to WebSocket clients until the listener
/// fails.
pub async fn start_websocket_server(addr: &str, broker: MemoryBroker) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("broker listening on ws://{}", listener.local_addr()?);
    serve(listener, broker).await
}

/// Accept loop over an already bound listener.
pub async fn serve(listener: TcpListener, broker: MemoryBroker) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let broker = broker.clone();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake error from {peer}: {e}");
                    return;
                }
            };
            handle_connection(ws_stream, broker, peer).await;
        });
    }
}

async fn handle_connection(
    ws_stream: WebSocketStream<TcpStream>,
    broker: MemoryBroker,
    peer: SocketAddr,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    // Replies and deliveries share one outgoing queue.
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    error!("could not encode frame for {peer}: {e}");
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(WsMessage::text(text)).await {
                debug!("send to {peer} failed: {e}");
                break;
            }
        }
        let _ = ws_sender.close().await;
        trace!("send loop closed for {peer}");
    });

    let mut connection = ClientConnection {
        broker,
        peer,
        session: None,
        channels: HashMap::new(),
        next_channel: 1,
        outgoing: tx,
    };

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!("read from {peer} failed: {e}");
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

        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("invalid frame from {peer}: {e} | {text}");
                continue;
            }
        };

        let id = frame.id();
        let closing = matches!(frame, ClientFrame::Close { .. });
        let result = connection.apply(frame).await;
        if let Err(e) = &result {
            debug!("request {id} from {peer} failed: {e}");
        }
        connection.reply(ServerFrame::reply(id, result));
        if closing {
            break;
        }
    }

    connection.shutdown().await;
    info!("{peer} disconnected");
}

/// Broker-side state of one WebSocket client: at most one session and the
/// channels opened on it, numbered per connection.
struct ClientConnection {
    broker: MemoryBroker,
    peer: SocketAddr,
    session: Option<Arc<dyn Session>>,
    channels: HashMap<u64, Arc<dyn Channel>>,
    next_channel: u64,
    outgoing: mpsc::UnboundedSender<ServerFrame>,
}

impl ClientConnection {
    fn reply(&self, frame: ServerFrame) {
        if self.outgoing.send(frame).is_err() {
            debug!("{} is gone, reply dropped", self.peer);
        }
    }

    fn session(&self) -> Result<Arc<dyn Session>, TransportError> {
        self.session
            .clone()
            .ok_or_else(|| TransportError::Protocol("no session, send hello first".into()))
    }

    fn channel(&self, id: u64) -> Result<Arc<dyn Channel>, TransportError> {
        self.channels
            .get(&id)
            .cloned()
            .ok_or_else(|| TransportError::ChannelClosed(format!("channel {id}")))
    }

    async fn apply(&mut self, frame: ClientFrame) -> Result<Option<String>, TransportError> {
        match frame {
            ClientFrame::Hello {
                username, password, ..
            } => {
                if self.session.is_some() {
                    return Err(TransportError::Protocol("session already open".into()));
                }
                let credentials = Credentials::new(username, password);
                let session = self
                    .broker
                    .connect(&self.peer.to_string(), &credentials)
                    .await?;
                self.session = Some(session);
                info!("{} connected as {}", self.peer, credentials.username);
                Ok(None)
            }

            ClientFrame::OpenChannel { .. } => {
                let channel = self.session()?.create_channel().await?;
                let id = self.next_channel;
                self.next_channel += 1;
                self.channels.insert(id, channel);
                Ok(Some(id.to_string()))
            }

            ClientFrame::CloseChannel { channel, .. } => {
                if let Some(channel) = self.channels.remove(&channel) {
                    channel.close().await?;
                }
                Ok(None)
            }

            ClientFrame::DeclareExchange {
                channel,
                name,
                durable,
                ..
            } => {
                self.channel(channel)?
                    .declare_exchange(&name, durable)
                    .await?;
                Ok(None)
            }

            ClientFrame::DeclareQueue {
                channel,
                name,
                options,
                ..
            } => {
                let queue = self.channel(channel)?.declare_queue(&name, options).await?;
                Ok(Some(queue))
            }

            ClientFrame::BindQueue {
                channel,
                queue,
                exchange,
                pattern,
                ..
            } => {
                self.channel(channel)?
                    .bind_queue(&queue, &exchange, &pattern)
                    .await?;
                Ok(None)
            }

            ClientFrame::UnbindQueue {
                channel,
                queue,
                exchange,
                pattern,
                ..
            } => {
                self.channel(channel)?
                    .unbind_queue(&queue, &exchange, &pattern)
                    .await?;
                Ok(None)
            }

            ClientFrame::Consume {
                channel,
                queue,
                no_ack,
                subscription,
                ..
            } => {
                let (deliveries, mut rx) = mpsc::unbounded_channel();
                let tag = self
                    .channel(channel)?
                    .consume(&queue, no_ack, deliveries)
                    .await?;

                let outgoing = self.outgoing.clone();
                tokio::spawn(async move {
                    while let Some(delivery) = rx.recv().await {
                        if outgoing
                            .send(ServerFrame::deliver(subscription, delivery))
                            .is_err()
                        {
                            break;
                        }
                    }
                });
                Ok(Some(tag))
            }

            ClientFrame::Cancel {
                channel,
                consumer_tag,
                ..
            } => {
                self.channel(channel)?.cancel(&consumer_tag).await?;
                Ok(None)
            }

            ClientFrame::Publish {
                channel,
                exchange,
                routing_key,
                payload,
                properties,
                ..
            } => {
                self.channel(channel)?
                    .publish(&exchange, &routing_key, payload, properties)
                    .await?;
                trace!("{} published to {routing_key}", self.peer);
                Ok(None)
            }

            ClientFrame::Ack {
                channel,
                delivery_tag,
                ..
            } => {
                self.channel(channel)?.ack(delivery_tag).await?;
                Ok(None)
            }

            ClientFrame::Nack {
                channel,
                delivery_tag,
                requeue,
                ..
            } => {
                self.channel(channel)?.nack(delivery_tag, requeue).await?;
                Ok(None)
            }

            ClientFrame::DeleteQueue { channel, queue, .. } => {
                self.channel(channel)?.delete_queue(&queue).await?;
                Ok(None)
            }

            ClientFrame::Close { .. } => {
                self.shutdown().await;
                Ok(None)
            }
        }
    }

    async fn shutdown(&mut self) {
        self.channels.clear();
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!("closing session of {} failed: {e}", self.peer);
            }
        }
    }
}
