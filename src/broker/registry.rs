//! Topic subscriptions on the shared consume queue.
//!
//! Every subscription lands on the connection's single consume channel and
//! its single queue. The registry runs one broker consumer on that queue and
//! fans each delivery out to the subscriptions whose pattern matches its
//! routing key, so a binding made for one subscriber never feeds another.
//! Patterns are bound on first use; a pattern's binding is removed only when
//! the last subscription registered under it goes away, and the broker
//! consumer is cancelled with the last subscription overall.
//!
//! The registry serializes subscribe/unsubscribe behind one async lock, so it
//! can be shared freely between tasks.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::broker::connection::{BrokerConnection, ChannelHandle};
use crate::broker::message::Message;
use crate::broker::pattern::topic_matches;
use crate::broker::topic::{Bindings, Released};
use crate::broker::transport::{Channel, Delivery};
use crate::utils::error::{Error, Result, ResultExt};

type OnMessage = Arc<dyn Fn(Message, Acker) -> BoxFuture<'static, ()> + Send + Sync>;

struct Subscriber {
    pattern: String,
    no_ack: bool,
    on_message: OnMessage,
}

/// Subscription tag → subscriber, shared with the dispatch loop.
type Subscribers = Arc<StdMutex<BTreeMap<String, Subscriber>>>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One delivery awaiting its ack or nack. Only the first settlement reaches
/// the broker; later ones are no-ops.
struct Settlement {
    channel: Arc<dyn Channel>,
    delivery_tag: u64,
    settled: AtomicBool,
}

impl Settlement {
    fn new(channel: Arc<dyn Channel>, delivery_tag: u64) -> Arc<Self> {
        Arc::new(Self {
            channel,
            delivery_tag,
            settled: AtomicBool::new(false),
        })
    }

    async fn ack(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.channel
            .ack(self.delivery_tag)
            .await
            .critical("Acknowledgement error")
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.channel
            .nack(self.delivery_tag, requeue)
            .await
            .critical("Negative acknowledgement error")
    }
}

/// Acknowledgement handle for one delivery.
///
/// For subscriptions created with `no_ack`, both methods are no-ops. When a
/// delivery matches several subscriptions, the first ack or nack settles it.
#[derive(Clone)]
pub struct Acker {
    delivery_tag: u64,
    settlement: Option<Arc<Settlement>>,
}

impl Acker {
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub async fn ack(&self) -> Result<()> {
        match &self.settlement {
            Some(settlement) => settlement.ack().await,
            None => Ok(()),
        }
    }

    /// Rejects the delivery; with `requeue` the broker hands it out again.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        match &self.settlement {
            Some(settlement) => settlement.nack(requeue).await,
            None => Ok(()),
        }
    }
}

struct Consumer {
    tag: String,
    channel: Arc<dyn Channel>,
}

#[derive(Default)]
struct RegistryState {
    bindings: Bindings,
    consumer: Option<Consumer>,
}

pub struct TopicSubscriptionRegistry {
    connection: Arc<BrokerConnection>,
    state: Mutex<RegistryState>,
    subscribers: Subscribers,
}

impl TopicSubscriptionRegistry {
    pub fn new(connection: Arc<BrokerConnection>) -> Self {
        Self {
            connection,
            state: Mutex::new(RegistryState::default()),
            subscribers: Arc::new(StdMutex::new(BTreeMap::new())),
        }
    }

    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.connection
    }

    /// Binds `pattern` on the consume queue and registers `on_message` for
    /// deliveries whose routing key matches it.
    ///
    /// Returns the subscription tag to hand to [`Self::unsubscribe`].
    pub async fn subscribe<F, Fut>(&self, pattern: &str, on_message: F, no_ack: bool) -> Result<String>
    where
        F: Fn(Message, Acker) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if pattern.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "subscription pattern must not be empty".into(),
            ));
        }

        let mut state = self.state.lock().await;
        let handle = self.connection.consume_channel().await?;
        let newly_bound = state.bindings.get(pattern).is_none();

        let tag = format!("sub-{}", Uuid::new_v4().simple());
        let callback: OnMessage =
            Arc::new(move |message: Message, acker: Acker| on_message(message, acker).boxed());
        lock(&self.subscribers).insert(
            tag.clone(),
            Subscriber {
                pattern: pattern.to_string(),
                no_ack,
                on_message: callback,
            },
        );

        let queue = match self.connection.bind_queue(&handle, pattern).await {
            Ok(queue) => queue,
            Err(e) => {
                lock(&self.subscribers).remove(&tag);
                return Err(e);
            }
        };

        if state.consumer.is_none() {
            match self.start_consumer(&handle, &queue).await {
                Ok(consumer) => state.consumer = Some(consumer),
                Err(e) => {
                    lock(&self.subscribers).remove(&tag);
                    if newly_bound {
                        if let Err(unbind) = self.connection.unbind_queue(&handle, pattern).await {
                            warn!("could not unbind '{pattern}' after failed subscribe: {unbind}");
                        }
                    }
                    return Err(e);
                }
            }
        }

        state.bindings.add(pattern, tag.clone());
        debug!("subscribed {tag} to '{pattern}' on {queue}");
        Ok(tag)
    }

    async fn start_consumer(&self, handle: &ChannelHandle, queue: &str) -> Result<Consumer> {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = handle.channel().clone();
        let tag = channel
            .consume(queue, false, tx)
            .await
            .critical("Subscription error")?;
        tokio::spawn(dispatch_loop(rx, channel.clone(), self.subscribers.clone()));
        debug!("consumer {tag} started on {queue}");
        Ok(Consumer { tag, channel })
    }

    /// Drops the subscription, unbinds its pattern if no other subscription
    /// holds it, and cancels the broker consumer after the last one.
    ///
    /// A message already handed to the callback still runs to completion.
    pub async fn unsubscribe(&self, tag: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(handle) = self.connection.existing_consume_channel().await else {
            return Ok(());
        };

        lock(&self.subscribers).remove(tag);

        match state.bindings.release(tag) {
            Some(Released::Emptied(pattern)) => {
                self.connection.unbind_queue(&handle, &pattern).await?;
                debug!("unsubscribed {tag}, unbound '{pattern}'");
            }
            Some(Released::Retained(pattern)) => {
                debug!("unsubscribed {tag}, '{pattern}' still in use");
            }
            None => warn!("unsubscribe for unknown subscription {tag}"),
        }

        if state.bindings.is_empty() {
            if let Some(consumer) = state.consumer.take() {
                consumer
                    .channel
                    .cancel(&consumer.tag)
                    .await
                    .critical("Unsubscribe error")?;
                debug!("consumer {} cancelled", consumer.tag);
            }
        }
        Ok(())
    }

    pub async fn patterns(&self) -> Vec<String> {
        self.state.lock().await.bindings.patterns()
    }

    pub async fn tags(&self, pattern: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let mut tags: Vec<String> = state
            .bindings
            .get(pattern)
            .map(|b| b.consumer_tags.iter().cloned().collect())
            .unwrap_or_default();
        tags.sort();
        tags
    }

    /// Forgets every subscription and disconnects from the broker.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.bindings.clear();
        state.consumer = None;
        lock(&self.subscribers).clear();
        self.connection.disconnect().await
    }
}

async fn dispatch_loop(
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    channel: Arc<dyn Channel>,
    subscribers: Subscribers,
) {
    while let Some(delivery) = deliveries.recv().await {
        let settlement = Settlement::new(channel.clone(), delivery.delivery_tag);
        let matching: Vec<(OnMessage, bool)> = lock(&subscribers)
            .values()
            .filter(|s| topic_matches(&s.pattern, &delivery.routing_key))
            .map(|s| (s.on_message.clone(), s.no_ack))
            .collect();

        if matching.is_empty() {
            trace!("no subscription matches {}, dropping", delivery.routing_key);
            if let Err(e) = settlement.nack(false).await {
                warn!("failed to reject unmatched message: {e}");
            }
            continue;
        }

        let message = match Message::from_delivery(&delivery) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "dropping undecodable message on {}: {e}",
                    delivery.routing_key
                );
                if let Err(e) = settlement.nack(false).await {
                    warn!("failed to reject undecodable message: {e}");
                }
                continue;
            }
        };

        if matching.iter().all(|(_, no_ack)| *no_ack) {
            if let Err(e) = settlement.ack().await {
                warn!("failed to acknowledge {}: {e}", delivery.routing_key);
            }
        }

        for (on_message, no_ack) in matching {
            let acker = Acker {
                delivery_tag: delivery.delivery_tag,
                settlement: (!no_ack).then(|| settlement.clone()),
            };
            tokio::spawn(on_message(message.clone(), acker));
        }
    }
    debug!("consumer loop finished");
}
