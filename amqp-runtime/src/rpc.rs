use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Consumer, ExchangeKind};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::actor::ActorHandle;
use crate::envelope::Method;
use crate::error::AmqpRuntimeError;
use crate::handler::Handler;

fn reply_queue_name(exchange: &str) -> String {
    format!("{exchange}_response_{}", Uuid::new_v4().simple())
}

/// Declares the exchange, declares this handler's exclusive durable reply
/// queue, binds it under its own name, and starts consuming it.
async fn declare_and_consume(
    connection: &ActorHandle,
    exchange: &str,
    exchange_kind: ExchangeKind,
    queue: &str,
) -> Result<(Channel, Consumer), AmqpRuntimeError> {
    let channel = connection.channel_async().await?;
    Method::ExchangeDeclare {
        exchange: exchange.to_string(),
        kind: exchange_kind,
        durable: true,
        auto_delete: false,
    }
    .invoke(&channel)
    .await?;
    Method::QueueDeclare {
        queue: queue.to_string(),
        durable: true,
        exclusive: true,
        auto_delete: false,
        arguments: FieldTable::default(),
    }
    .invoke(&channel)
    .await?;
    Method::QueueBind {
        queue: queue.to_string(),
        exchange: exchange.to_string(),
        routing_key: queue.to_string(),
    }
    .invoke(&channel)
    .await?;
    let consumer = Method::consume(&channel, queue, &format!("rpc-{queue}")).await?;
    Ok((channel, consumer))
}

fn request_properties(reply_queue: &str, correlation_id: &str, expiration: Option<Duration>) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_reply_to(reply_queue.to_string().into())
        .with_correlation_id(correlation_id.to_string().into());
    if let Some(expiration) = expiration {
        properties = properties.with_expiration(expiration.as_millis().to_string().into());
    }
    properties
}

/// Request/response RPC where `publish` blocks the caller until the
/// correlated reply arrives (or `timeout` elapses).
pub struct BlockingRequestResponseHandler {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub reply_queue: String,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
}

impl BlockingRequestResponseHandler {
    pub fn new(exchange: impl Into<String>, exchange_kind: ExchangeKind) -> Self {
        let exchange = exchange.into();
        let reply_queue = reply_queue_name(&exchange);
        Self {
            exchange,
            exchange_kind,
            reply_queue,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Overrides the auto-generated reply queue name with a caller-supplied one.
    pub fn with_reply_queue(mut self, queue: impl Into<String>) -> Self {
        self.reply_queue = queue.into();
        self
    }

    /// Publishes `message` to `routing_key` and blocks until the correlated
    /// reply arrives or `timeout` elapses. Mints a correlation ID when none
    /// is supplied; the correlation table entry is removed on every exit
    /// path, including timeout.
    pub async fn publish(
        &self,
        connection: &ActorHandle,
        message: &impl Serialize,
        routing_key: &str,
        correlation_id: Option<String>,
        expiration: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<Value, AmqpRuntimeError> {
        let correlation_id = correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(correlation_id.clone(), tx);

        let properties = request_properties(&self.reply_queue, &correlation_id, expiration);
        let body = serde_json::to_vec(message)?;

        if let Err(e) = connection
            .publish(self.exchange.clone(), routing_key.to_string(), body, properties, true, timeout)
            .await
        {
            self.pending.lock().await.remove(&correlation_id);
            return Err(e);
        }

        let received = match timeout {
            Some(d) => tokio::time::timeout(d, rx).await.ok().and_then(|r| r.ok()),
            None => rx.await.ok(),
        };
        self.pending.lock().await.remove(&correlation_id);

        received.ok_or(AmqpRuntimeError::NoResponse(correlation_id))
    }
}

#[async_trait]
impl Handler for BlockingRequestResponseHandler {
    async fn register(&self, connection: &ActorHandle) -> Result<(), AmqpRuntimeError> {
        let (channel, consumer) =
            declare_and_consume(connection, &self.exchange, self.exchange_kind.clone(), &self.reply_queue).await?;
        tokio::spawn(blocking_dispatch_loop(
            consumer,
            channel,
            connection.clone(),
            self.pending.clone(),
            self.reply_queue.clone(),
        ));
        log::info!(
            "registered BlockingRequestResponseHandler exchange={} reply_queue={}",
            self.exchange,
            self.reply_queue
        );
        Ok(())
    }

    fn routing_key(&self) -> &str {
        &self.reply_queue
    }
}

async fn blocking_dispatch_loop(
    mut consumer: Consumer,
    channel: Channel,
    connection: ActorHandle,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
    queue: String,
) {
    while let Some(delivery_result) = consumer.next().await {
        let delivery = match delivery_result {
            Ok(d) => d,
            Err(e) => {
                log::error!("amqp rpc: delivery error queue={queue} err={e}");
                continue;
            }
        };
        // Blocking RPC acks immediately, never late — the response is only
        // meaningful to the one waiter who is already listening.
        if let Err(e) = connection.ack(channel.clone(), delivery.delivery_tag, true, None).await {
            log::error!("amqp rpc: ack failed queue={queue} err={e}");
        }

        let correlation_id = delivery.properties.correlation_id().as_ref().map(|c| c.as_str().to_string());
        let payload: Value = match serde_json::from_slice(&delivery.data) {
            Ok(v) => v,
            Err(e) => {
                log::error!("amqp rpc: failed to parse response body queue={queue} err={e}");
                continue;
            }
        };
        let Some(correlation_id) = correlation_id else {
            log::warn!("amqp rpc: response missing correlation_id queue={queue}, dropping");
            continue;
        };

        match pending.lock().await.remove(&correlation_id) {
            Some(tx) => {
                let _ = tx.send(payload);
            }
            None => log::debug!("amqp rpc: no waiter for correlation_id={correlation_id} queue={queue}"),
        }
    }
    log::warn!("amqp rpc: consumer stream ended queue={queue}");
}

/// A callback invoked with an RPC response; must be non-blocking or
/// self-dispatch any blocking work onto its own task, since it runs
/// directly on this handler's consumer dispatch loop.
pub type Callback = Arc<dyn Fn(Value) + Send + Sync>;

/// Request/response RPC where `publish` registers a callback and returns
/// immediately; the callback fires when the correlated reply arrives.
pub struct CallbackRequestResponseHandler {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub reply_queue: String,
    callbacks: Arc<Mutex<HashMap<String, Callback>>>,
}

impl CallbackRequestResponseHandler {
    pub fn new(exchange: impl Into<String>, exchange_kind: ExchangeKind) -> Self {
        let exchange = exchange.into();
        let reply_queue = reply_queue_name(&exchange);
        Self {
            exchange,
            exchange_kind,
            reply_queue,
            callbacks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_reply_queue(mut self, queue: impl Into<String>) -> Self {
        self.reply_queue = queue.into();
        self
    }

    /// Publishes `message` and returns immediately with the correlation ID
    /// used. If `callback` is supplied it fires, on the consumer dispatch
    /// task, when a reply with the matching correlation ID arrives.
    pub async fn publish(
        &self,
        connection: &ActorHandle,
        message: &impl Serialize,
        routing_key: &str,
        callback: Option<Callback>,
        correlation_id: Option<String>,
        expiration: Option<Duration>,
    ) -> Result<String, AmqpRuntimeError> {
        let correlation_id = correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Some(callback) = callback {
            self.callbacks.lock().await.insert(correlation_id.clone(), callback);
        }

        let properties = request_properties(&self.reply_queue, &correlation_id, expiration);
        let body = serde_json::to_vec(message)?;
        connection
            .publish(self.exchange.clone(), routing_key.to_string(), body, properties, true, None)
            .await?;

        Ok(correlation_id)
    }
}

#[async_trait]
impl Handler for CallbackRequestResponseHandler {
    async fn register(&self, connection: &ActorHandle) -> Result<(), AmqpRuntimeError> {
        let (channel, consumer) =
            declare_and_consume(connection, &self.exchange, self.exchange_kind.clone(), &self.reply_queue).await?;
        tokio::spawn(callback_dispatch_loop(
            consumer,
            channel,
            connection.clone(),
            self.callbacks.clone(),
            self.reply_queue.clone(),
        ));
        log::info!(
            "registered CallbackRequestResponseHandler exchange={} reply_queue={}",
            self.exchange,
            self.reply_queue
        );
        Ok(())
    }

    fn routing_key(&self) -> &str {
        &self.reply_queue
    }
}

async fn callback_dispatch_loop(
    mut consumer: Consumer,
    channel: Channel,
    connection: ActorHandle,
    callbacks: Arc<Mutex<HashMap<String, Callback>>>,
    queue: String,
) {
    while let Some(delivery_result) = consumer.next().await {
        let delivery = match delivery_result {
            Ok(d) => d,
            Err(e) => {
                log::error!("amqp rpc: delivery error queue={queue} err={e}");
                continue;
            }
        };
        if let Err(e) = connection.ack(channel.clone(), delivery.delivery_tag, true, None).await {
            log::error!("amqp rpc: ack failed queue={queue} err={e}");
        }

        let correlation_id = delivery.properties.correlation_id().as_ref().map(|c| c.as_str().to_string());
        let payload: Value = match serde_json::from_slice(&delivery.data) {
            Ok(v) => v,
            Err(e) => {
                log::error!("amqp rpc: failed to parse response body queue={queue} err={e}");
                continue;
            }
        };
        let Some(correlation_id) = correlation_id else {
            log::warn!("amqp rpc: response missing correlation_id queue={queue}, dropping");
            continue;
        };

        match callbacks.lock().await.remove(&correlation_id) {
            Some(callback) => callback(payload),
            None => log::debug!("amqp rpc: no callback for correlation_id={correlation_id} queue={queue}"),
        }
    }
    log::warn!("amqp rpc: consumer stream ended queue={queue}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_queue_name_is_namespaced_to_exchange() {
        let name = reply_queue_name("orders");
        assert!(name.starts_with("orders_response_"));
    }

    #[test]
    fn blocking_handler_generates_distinct_reply_queues() {
        let a = BlockingRequestResponseHandler::new("ex", ExchangeKind::Topic);
        let b = BlockingRequestResponseHandler::new("ex", ExchangeKind::Topic);
        assert_ne!(a.reply_queue, b.reply_queue);
    }

    #[test]
    fn with_reply_queue_overrides_generated_name() {
        let handler = CallbackRequestResponseHandler::new("ex", ExchangeKind::Topic).with_reply_queue("fixed_queue");
        assert_eq!(handler.reply_queue, "fixed_queue");
    }
}
