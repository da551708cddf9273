//! In-process topic-exchange broker.
//!
//! `MemoryBroker` keeps exchanges, queues and consumers in one shared state
//! behind a mutex and implements the [`Transport`] seam, so the adapter and
//! the RPC layers run against it exactly as they would against a networked
//! broker. The WebSocket broker server hosts one of these.
//!
//! Semantics:
//! - exchanges are topic exchanges; a durable flag is recorded but nothing
//!   is persisted
//! - exclusive queues belong to the channel that declared them and are
//!   deleted when that channel (or its session) closes
//! - a queue's consumers receive messages round-robin
//! - unacknowledged deliveries return to the front of their queue, flagged
//!   `redelivered`, on `nack(requeue)` or when the consuming channel closes
//! - messages whose `expiration` has elapsed are dropped at dispatch time

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::broker::pattern::topic_matches;
use crate::broker::transport::{
    Channel, Credentials, Delivery, MessageProperties, QueueOptions, Session, Transport,
    TransportError,
};

type ChannelId = u64;
type SessionId = u64;

#[derive(Debug, Clone)]
struct Queued {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
    expires_at: Option<i64>,
}

#[derive(Debug)]
struct Consumer {
    tag: String,
    channel: ChannelId,
    no_ack: bool,
    sender: UnboundedSender<Delivery>,
}

#[derive(Debug, Default)]
struct Queue {
    owner: Option<ChannelId>,
    ready: VecDeque<Queued>,
    consumers: Vec<Consumer>,
    cursor: usize,
}

#[derive(Debug, Default)]
struct Exchange {
    durable: bool,
    routes: Vec<(String, String)>,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    channel: ChannelId,
    message: Queued,
}

#[derive(Debug)]
struct BrokerState {
    available: bool,
    credentials: Option<Credentials>,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    sessions: HashMap<SessionId, HashSet<ChannelId>>,
    channels: HashMap<ChannelId, SessionId>,
    unacked: HashMap<u64, Unacked>,
    next_id: u64,
    next_delivery_tag: u64,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            available: true,
            credentials: None,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            sessions: HashMap::new(),
            channels: HashMap::new(),
            unacked: HashMap::new(),
            next_id: 1,
            next_delivery_tag: 1,
        }
    }
}

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only sessions presenting these credentials will be accepted.
    pub fn with_credentials(self, credentials: Credentials) -> Self {
        self.state().credentials = Some(credentials);
        self
    }

    /// Simulates the broker going away (`false`) or coming back (`true`).
    /// While unavailable, connects fail and every channel verb fails.
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    /// `(pattern, queue)` bindings of an exchange, sorted.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        let state = self.state();
        let mut routes = state
            .exchanges
            .get(exchange)
            .map(|e| e.routes.clone())
            .unwrap_or_default();
        routes.sort();
        routes
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn exchange_is_durable(&self, name: &str) -> Option<bool> {
        self.state().exchanges.get(name).map(|e| e.durable)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Messages waiting in a queue, not counting unacknowledged deliveries.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    pub fn session_count(&self) -> usize {
        self.state().sessions.len()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_channel(&self, channel: ChannelId) -> Result<(), TransportError> {
        if !self.available {
            return Err(TransportError::ChannelClosed("broker unavailable".into()));
        }
        if !self.channels.contains_key(&channel) {
            return Err(TransportError::ChannelClosed(format!("channel {channel}")));
        }
        Ok(())
    }

    /// Pushes ready messages of `queue_name` to its consumers until either
    /// side runs out.
    fn dispatch(&mut self, queue_name: &str) {
        let now = chrono::Utc::now().timestamp_millis();
        let BrokerState {
            queues,
            unacked,
            next_delivery_tag,
            ..
        } = self;

        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.consumers.is_empty() {
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            if message.expires_at.is_some_and(|at| at <= now) {
                trace!("dropping expired message on {}", message.routing_key);
                continue;
            }

            let idx = queue.cursor % queue.consumers.len();
            queue.cursor = queue.cursor.wrapping_add(1);
            let consumer = &queue.consumers[idx];

            let delivery_tag = *next_delivery_tag;
            *next_delivery_tag += 1;

            let delivery = Delivery {
                delivery_tag,
                consumer_tag: consumer.tag.clone(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                payload: message.payload.clone(),
                properties: message.properties.clone(),
            };

            if consumer.sender.send(delivery).is_err() {
                debug!("consumer {} went away, removing it", consumer.tag);
                queue.consumers.remove(idx);
                queue.ready.push_front(message);
                continue;
            }

            if !consumer.no_ack {
                unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        channel: consumer.channel,
                        message,
                    },
                );
            }
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        let Unacked { queue, mut message, .. } = unacked;
        if let Some(q) = self.queues.get_mut(&queue) {
            message.redelivered = true;
            q.ready.push_front(message);
            self.dispatch(&queue);
        }
    }

    fn remove_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for exchange in self.exchanges.values_mut() {
            exchange.routes.retain(|(_, queue)| queue != name);
        }
        self.unacked.retain(|_, u| u.queue != name);
    }

    /// Cleans up a channel: its consumers are dropped, its unacknowledged
    /// deliveries are requeued and the exclusive queues it owns are deleted.
    fn cleanup_channel(&mut self, channel: ChannelId) {
        let Some(session) = self.channels.remove(&channel) else {
            return;
        };
        if let Some(channels) = self.sessions.get_mut(&session) {
            channels.remove(&channel);
        }

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != channel);
        }

        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(channel))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &owned {
            self.remove_queue(name);
        }

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked);
            }
        }

        debug!("cleaned up channel {channel}");
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(
        &self,
        host: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Session>, TransportError> {
        let mut state = self.state();
        if !state.available {
            return Err(TransportError::Unreachable(host.to_string()));
        }
        if let Some(expected) = &state.credentials {
            if expected != credentials {
                return Err(TransportError::AccessRefused(credentials.username.clone()));
            }
        }

        let id = state.next_id();
        state.sessions.insert(id, HashSet::new());
        debug!("session {id} opened for {host}");

        Ok(Arc::new(MemorySession {
            broker: self.clone(),
            id,
        }))
    }
}

#[derive(Debug)]
pub struct MemorySession {
    broker: MemoryBroker,
    id: SessionId,
}

#[async_trait]
impl Session for MemorySession {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let mut state = self.broker.state();
        if !state.available {
            return Err(TransportError::Unreachable("broker unavailable".into()));
        }
        if !state.sessions.contains_key(&self.id) {
            return Err(TransportError::ChannelClosed(format!("session {}", self.id)));
        }

        let id = state.next_id();
        state.channels.insert(id, self.id);
        if let Some(channels) = state.sessions.get_mut(&self.id) {
            channels.insert(id);
        }

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        let Some(channels) = state.sessions.remove(&self.id) else {
            return Ok(());
        };
        for channel in channels {
            state.cleanup_channel(channel);
        }
        debug!("session {} closed", self.id);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: ChannelId,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.check_channel(self.id)?;
        state
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| Exchange {
                durable,
                routes: Vec::new(),
            });
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, TransportError> {
        let mut state = self.broker.state();
        state.check_channel(self.id)?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            return match existing.owner {
                Some(owner) if owner != self.id => Err(TransportError::Locked(name)),
                _ => Ok(name),
            };
        }

        let owner = options.exclusive.then_some(self.id);
        state.queues.insert(
            name.clone(),
            Queue {
                owner,
                ..Queue::default()
            },
        );
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.check_channel(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(TransportError::NotFound(format!("queue {queue}")));
        }
        let Some(exchange) = state.exchanges.get_mut(exchange) else {
            return Err(TransportError::NotFound(format!("exchange {exchange}")));
        };

        let route = (pattern.to_string(), queue.to_string());
        if !exchange.routes.contains(&route) {
            exchange.routes.push(route);
        }
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.check_channel(self.id)?;
        if let Some(exchange) = state.exchanges.get_mut(exchange) {
            exchange.routes.retain(|(p, q)| !(p == pattern && q == queue));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        no_ack: bool,
        deliveries: UnboundedSender<Delivery>,
    ) -> Result<String, TransportError> {
        let mut state = self.broker.state();
        state.check_channel(self.id)?;
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(TransportError::NotFound(format!("queue {queue}")));
        };

        let tag = format!("amq.ctag-{}", Uuid::new_v4().simple());
        q.consumers.push(Consumer {
            tag: tag.clone(),
            channel: self.id,
            no_ack,
            sender: deliveries,
        });
        state.dispatch(queue);
        Ok(tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.check_channel(self.id)?;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.tag == consumer_tag && c.channel == self.id));
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.check_channel(self.id)?;
        let Some(ex) = state.exchanges.get(exchange) else {
            return Err(TransportError::NotFound(format!("exchange {exchange}")));
        };

        let mut targets: Vec<String> = Vec::new();
        for (pattern, queue) in &ex.routes {
            if topic_matches(pattern, routing_key) && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        if targets.is_empty() {
            trace!("no binding matches '{routing_key}' on {exchange}");
            return Ok(());
        }

        let expires_at = properties
            .expiration_millis()
            .map(|ttl| chrono::Utc::now().timestamp_millis() + ttl as i64);
        let message = Queued {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            properties,
            redelivered: false,
            expires_at,
        };

        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(message.clone());
            }
            state.dispatch(&queue);
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.check_channel(self.id)?;
        match state.unacked.remove(&delivery_tag) {
            Some(_) => Ok(()),
            None => Err(TransportError::Protocol(format!(
                "unknown delivery tag {delivery_tag}"
            ))),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.check_channel(self.id)?;
        let Some(unacked) = state.unacked.remove(&delivery_tag) else {
            return Err(TransportError::Protocol(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        };
        if requeue {
            state.requeue(unacked);
        } else {
            warn!(
                "discarding message on {} after negative acknowledgement",
                unacked.message.routing_key
            );
        }
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.check_channel(self.id)?;
        state.remove_queue(queue);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.state().cleanup_channel(self.id);
        Ok(())
    }
}
