//! Mediate RPC over the message broker.
//!
//! Requests go to `request.{service}.{action}` carrying a correlation id and
//! a `replyTo` topic; the handler publishes the response envelope to
//! `replyTo` with the same correlation id. The caller listens on
//! `response.{service}.{action}` and matches responses to calls purely by
//! correlation id, which is a fresh UUID per call.
//!
//! The handler acknowledges a request only after its reply is published. An
//! internal fault publishes a failure envelope and then nacks so another
//! consumer gets a go; a request that was already redelivered is dropped
//! instead of being requeued again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::broker::connection::BrokerConnection;
use crate::broker::message::Message;
use crate::broker::registry::{Acker, TopicSubscriptionRegistry};
use crate::broker::transport::{MessageProperties, TransportError};
use crate::rpc::dispatch::{ActionError, ActionFactory, ActionFn, Resolver, invoke, resolve_action_func};
use crate::rpc::envelope::{
    RpcRequest, RpcResponse, create_response, is_valid_action_name, request_topic, response_topic,
};
use crate::rpc::{Caller, Handler};
use crate::utils::error::{Error, Result};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

type Waiters = Arc<Mutex<HashMap<String, oneshot::Sender<Result<RpcResponse>>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct MediateHandler {
    name: String,
    resolver: Arc<dyn Resolver>,
    subscriptions: Arc<TopicSubscriptionRegistry>,
    consumer_tags: Mutex<Vec<String>>,
}

impl MediateHandler {
    pub fn new(
        name: impl Into<String>,
        resolver: Arc<dyn Resolver>,
        subscriptions: Arc<TopicSubscriptionRegistry>,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidArgument("handler name must not be empty".into()));
        }
        Ok(Self {
            name,
            resolver,
            subscriptions,
            consumer_tags: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancels every request subscription this handler made.
    pub async fn stop(&self) -> Result<()> {
        let tags = std::mem::take(&mut *lock(&self.consumer_tags));
        for tag in tags {
            self.subscriptions.unsubscribe(&tag).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for MediateHandler {
    async fn handle(
        &self,
        action: &str,
        dependency_id: &str,
        factory: Option<ActionFactory>,
    ) -> Result<()> {
        if !is_valid_action_name(action) {
            return Err(Error::InvalidArgument(format!(
                "action name `{action}` may only contain [a-zA-Z0-9_-]"
            )));
        }
        let func = resolve_action_func(
            self.resolver.as_ref(),
            action,
            dependency_id,
            factory.as_ref(),
        )?;

        let topic = request_topic(&self.name, action);
        let connection = self.subscriptions.connection().clone();
        let name = self.name.clone();
        let tag = self
            .subscriptions
            .subscribe(
                &topic,
                move |message, acker| {
                    let func = func.clone();
                    let connection = connection.clone();
                    let name = name.clone();
                    async move { serve_request(&name, &func, &connection, message, acker).await }
                },
                false,
            )
            .await?;

        lock(&self.consumer_tags).push(tag);
        debug!("mediate handler {} listening on {topic}", self.name);
        Ok(())
    }
}

async fn serve_request(
    name: &str,
    func: &ActionFn,
    connection: &BrokerConnection,
    message: Message,
    acker: Acker,
) {
    let request: RpcRequest = match serde_json::from_value(message.data.clone()) {
        Ok(request) => request,
        Err(e) => {
            warn!("malformed request on {}: {e}", message.topic);
            settle(&acker, Settle::Reject).await;
            return;
        }
    };

    let correlation_id = message.correlation_id().map(str::to_string);
    let from = request.from.clone();

    let (response, fault) = match invoke(func, request).await {
        Ok(data) => (create_response(name, true, data, &from), false),
        Err(ActionError::Rejected(data)) => (create_response(name, false, data, &from), false),
        Err(ActionError::Internal(reason)) => {
            error!("mediate handler {name} failed on {}: {reason}", message.topic);
            (create_response(name, false, Value::String(reason), &from), true)
        }
    };

    let published = match message.reply_to() {
        Some(reply_to) => publish_reply(connection, reply_to, &response, correlation_id).await,
        None => {
            warn!("request on {} has no replyTo, response dropped", message.topic);
            Ok(())
        }
    };

    let outcome = match (published, fault) {
        (Ok(()), false) => Settle::Ack,
        (Ok(()), true) if message.redelivered => Settle::Reject,
        (Ok(()), true) => Settle::Requeue,
        (Err(e), _) => {
            error!("could not publish reply for {}: {e}", message.topic);
            Settle::Requeue
        }
    };
    settle(&acker, outcome).await;
}

async fn publish_reply(
    connection: &BrokerConnection,
    reply_to: &str,
    response: &RpcResponse,
    correlation_id: Option<String>,
) -> Result<()> {
    let payload = serde_json::to_vec(response)?;
    let properties = MessageProperties {
        correlation_id,
        ..MessageProperties::default()
    };
    connection
        .publish(connection.exchange(), reply_to, payload, properties)
        .await
}

enum Settle {
    Ack,
    Requeue,
    Reject,
}

async fn settle(acker: &Acker, outcome: Settle) {
    let result = match outcome {
        Settle::Ack => acker.ack().await,
        Settle::Requeue => acker.nack(true).await,
        Settle::Reject => acker.nack(false).await,
    };
    if let Err(e) = result {
        error!("failed to settle delivery {}: {e}", acker.delivery_tag());
    }
}

struct ResponseSubscription {
    consumer_tag: String,
    in_flight: usize,
}

pub struct MediateCaller {
    name: String,
    subscriptions: Arc<TopicSubscriptionRegistry>,
    waiters: Waiters,
    response_topics: tokio::sync::Mutex<HashMap<String, ResponseSubscription>>,
    timeout: Option<Duration>,
}

impl MediateCaller {
    pub fn new(name: impl Into<String>, subscriptions: Arc<TopicSubscriptionRegistry>) -> Self {
        Self {
            name: name.into(),
            subscriptions,
            waiters: Arc::new(Mutex::new(HashMap::new())),
            response_topics: tokio::sync::Mutex::new(HashMap::new()),
            timeout: Some(DEFAULT_CALL_TIMEOUT),
        }
    }

    /// How long a call waits for its response; `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pending_calls(&self) -> usize {
        lock(&self.waiters).len()
    }

    /// Sends a request with an explicit correlation id. An id already used by
    /// a call in flight is refused with [`Error::InvalidArgument`].
    pub async fn call_with_id(
        &self,
        module: &str,
        action: &str,
        params: Value,
        correlation_id: &str,
    ) -> Result<RpcResponse> {
        let reply_topic = response_topic(module, action);

        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = lock(&self.waiters);
            if waiters.contains_key(correlation_id) {
                return Err(Error::InvalidArgument(format!(
                    "correlation id {correlation_id} is already in flight"
                )));
            }
            waiters.insert(correlation_id.to_string(), tx);
        }

        if let Err(e) = self.acquire_response_topic(&reply_topic).await {
            lock(&self.waiters).remove(correlation_id);
            return Err(e);
        }

        let outcome = self
            .send_and_wait(module, action, params, correlation_id, &reply_topic, rx)
            .await;

        lock(&self.waiters).remove(correlation_id);
        if let Err(e) = self.release_response_topic(&reply_topic).await {
            warn!("could not release response subscription on {reply_topic}: {e}");
        }
        outcome
    }

    async fn send_and_wait(
        &self,
        module: &str,
        action: &str,
        params: Value,
        correlation_id: &str,
        reply_topic: &str,
        rx: oneshot::Receiver<Result<RpcResponse>>,
    ) -> Result<RpcResponse> {
        let request = RpcRequest::new(&self.name, module, params);
        let payload = serde_json::to_vec(&request)?;
        let properties = MessageProperties::default()
            .with_correlation_id(correlation_id)
            .with_reply_to(reply_topic);

        let connection = self.subscriptions.connection();
        connection
            .publish(
                connection.exchange(),
                &request_topic(module, action),
                payload,
                properties,
            )
            .await?;
        trace!("request {correlation_id} sent to {module}.{action}");

        let received = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => rx.await,
        };
        received.map_err(|_| {
            Error::Transport(TransportError::ChannelClosed(
                "response waiter dropped".into(),
            ))
        })?
    }

    /// Makes sure `topic` is subscribed and counts one more call on it.
    async fn acquire_response_topic(&self, topic: &str) -> Result<()> {
        let mut topics = self.response_topics.lock().await;
        if let Some(subscription) = topics.get_mut(topic) {
            subscription.in_flight += 1;
            return Ok(());
        }

        let waiters = self.waiters.clone();
        let consumer_tag = self
            .subscriptions
            .subscribe(
                topic,
                move |message, _acker| {
                    let waiters = waiters.clone();
                    async move { deliver_response(&waiters, message) }
                },
                true,
            )
            .await?;
        topics.insert(
            topic.to_string(),
            ResponseSubscription {
                consumer_tag,
                in_flight: 1,
            },
        );
        Ok(())
    }

    /// Counts one call less on `topic`, unsubscribing after the last one.
    async fn release_response_topic(&self, topic: &str) -> Result<()> {
        let mut topics = self.response_topics.lock().await;
        let Some(subscription) = topics.get_mut(topic) else {
            return Ok(());
        };
        subscription.in_flight = subscription.in_flight.saturating_sub(1);
        if subscription.in_flight > 0 {
            return Ok(());
        }
        if let Some(subscription) = topics.remove(topic) {
            self.subscriptions
                .unsubscribe(&subscription.consumer_tag)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Caller for MediateCaller {
    async fn call(&self, module: &str, action: &str, params: Value) -> Result<RpcResponse> {
        let correlation_id = Uuid::new_v4().to_string();
        self.call_with_id(module, action, params, &correlation_id)
            .await
    }
}

fn deliver_response(waiters: &Waiters, message: Message) {
    let Some(correlation_id) = message.correlation_id() else {
        debug!("response on {} without correlation id ignored", message.topic);
        return;
    };
    let Some(waiter) = lock(waiters).remove(correlation_id) else {
        trace!("response {correlation_id} belongs to another caller");
        return;
    };
    let response = serde_json::from_value::<RpcResponse>(message.data).map_err(Error::from);
    // the caller may have timed out meanwhile
    let _ = waiter.send(response);
}
