use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, ExchangeKind};
use serde_json::{json, Value};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::actor::ActorHandle;
use crate::envelope::Method;
use crate::error::AmqpRuntimeError;
use crate::handler::Handler;

/// Application logic run by a `TaskConsumer` for each accepted delivery.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle_task(&self, payload: Value) -> Result<Value, String>;
}

struct DispatchState {
    semaphore: Arc<Semaphore>,
    buffer: Mutex<VecDeque<(Delivery, Value)>>,
}

/// Declares a work queue named `<exchange>_<routing_key>`, binds it, and
/// drains it through a bounded worker pool. See the worker-pool note on
/// `process_delivery` for the buffer-then-release hand-off discipline.
pub struct TaskConsumer<T> {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub routing_key: String,
    pub pool_size: usize,
    pub late_ack: bool,
    task_handler: Arc<T>,
}

impl<T: TaskHandler + 'static> TaskConsumer<T> {
    pub fn new(
        exchange: impl Into<String>,
        exchange_kind: ExchangeKind,
        routing_key: impl Into<String>,
        task_handler: T,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            exchange_kind,
            routing_key: routing_key.into(),
            pool_size: 5,
            late_ack: false,
            task_handler: Arc::new(task_handler),
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_late_ack(mut self, late_ack: bool) -> Self {
        self.late_ack = late_ack;
        self
    }

    fn queue_name(&self) -> String {
        format!("{}_{}", self.exchange, self.routing_key)
    }
}

#[async_trait]
impl<T: TaskHandler + 'static> Handler for TaskConsumer<T> {
    async fn register(&self, connection: &ActorHandle) -> Result<(), AmqpRuntimeError> {
        let channel = connection.channel_async().await?;
        Method::ExchangeDeclare {
            exchange: self.exchange.clone(),
            kind: self.exchange_kind.clone(),
            durable: true,
            auto_delete: false,
        }
        .invoke(&channel)
        .await?;

        let queue = self.queue_name();
        Method::QueueDeclare {
            queue: queue.clone(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: FieldTable::default(),
        }
        .invoke(&channel)
        .await?;

        Method::QueueBind {
            queue: queue.clone(),
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
        }
        .invoke(&channel)
        .await?;

        Method::BasicQos {
            prefetch_count: self.pool_size as u16,
        }
        .invoke(&channel)
        .await?;
        channel.confirm_select(Default::default()).await?;

        let consumer_tag = format!("task-consumer-{queue}");
        let consumer = Method::consume(&channel, &queue, &consumer_tag).await?;

        let state = Arc::new(DispatchState {
            semaphore: Arc::new(Semaphore::new(self.pool_size)),
            buffer: Mutex::new(VecDeque::new()),
        });

        tokio::spawn(dispatch_loop(
            consumer,
            channel,
            connection.clone(),
            state,
            self.task_handler.clone(),
            self.exchange.clone(),
            queue,
            self.late_ack,
        ));

        log::info!(
            "registered TaskConsumer exchange={} queue={}_{} pool_size={}",
            self.exchange,
            self.exchange,
            self.routing_key,
            self.pool_size
        );
        Ok(())
    }

    fn routing_key(&self) -> &str {
        &self.routing_key
    }
}

async fn dispatch_loop<T: TaskHandler + 'static>(
    mut consumer: lapin::Consumer,
    channel: Channel,
    connection: ActorHandle,
    state: Arc<DispatchState>,
    handler: Arc<T>,
    exchange: String,
    queue: String,
    late_ack: bool,
) {
    while let Some(delivery_result) = consumer.next().await {
        let delivery = match delivery_result {
            Ok(d) => d,
            Err(e) => {
                log::error!("amqp task consumer: delivery error queue={queue} err={e}");
                continue;
            }
        };

        // JSON parse failure is logged and the delivery is dropped without
        // an ack; the broker redelivers it once the channel is lost.
        let payload: Value = match serde_json::from_slice(&delivery.data) {
            Ok(v) => v,
            Err(e) => {
                log::error!(
                    "amqp task consumer: failed to parse body as json queue={queue} delivery_tag={} err={e}",
                    delivery.delivery_tag
                );
                continue;
            }
        };

        match state.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                tokio::spawn(process_delivery(
                    delivery,
                    payload,
                    connection.clone(),
                    channel.clone(),
                    handler.clone(),
                    exchange.clone(),
                    late_ack,
                    state.clone(),
                    permit,
                ));
            }
            Err(_) => {
                state.buffer.lock().await.push_back((delivery, payload));
            }
        }
    }

    log::warn!("amqp task consumer: consumer stream ended queue={queue}");
}

/// Processes one delivery, then either hands its pool slot directly to the
/// next buffered task (chained hand-off, avoiding a thundering herd on the
/// semaphore) or releases the slot if the buffer is empty.
#[allow(clippy::too_many_arguments)]
fn process_delivery<T: TaskHandler + 'static>(
    delivery: Delivery,
    payload: Value,
    connection: ActorHandle,
    channel: Channel,
    handler: Arc<T>,
    exchange: String,
    late_ack: bool,
    state: Arc<DispatchState>,
    permit: OwnedSemaphorePermit,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
    let delivery_tag = delivery.delivery_tag;

    if !late_ack {
        if let Err(e) = connection.ack(channel.clone(), delivery_tag, true, None).await {
            log::error!("amqp task consumer: ack failed delivery_tag={delivery_tag} err={e}");
        }
    }

    let response = match handler.handle_task(payload).await {
        Ok(value) => value,
        Err(err) => {
            log::error!("amqp task consumer: handle_task failed delivery_tag={delivery_tag} err={err}");
            json!({"ok": false, "error": err})
        }
    };

    if late_ack {
        if let Err(e) = connection.ack(channel.clone(), delivery_tag, true, None).await {
            log::error!("amqp task consumer: late ack failed delivery_tag={delivery_tag} err={e}");
        }
    }

    if let Some(reply_to) = delivery.properties.reply_to().clone() {
        let mut properties = BasicProperties::default();
        if let Some(correlation_id) = delivery.properties.correlation_id().clone() {
            properties = properties.with_correlation_id(correlation_id);
        }
        match serde_json::to_vec(&response) {
            Ok(body) => {
                if let Err(e) = connection
                    .publish(exchange.clone(), reply_to.as_str().to_string(), body, properties, false, None)
                    .await
                {
                    log::error!("amqp task consumer: failed to publish reply delivery_tag={delivery_tag} err={e}");
                }
            }
            Err(e) => {
                log::error!("amqp task consumer: failed to encode reply delivery_tag={delivery_tag} err={e}");
            }
        }
    }

    release_or_chain(state, permit, connection, channel, handler, exchange, late_ack).await;
    })
}

#[allow(clippy::too_many_arguments)]
fn release_or_chain<T: TaskHandler + 'static>(
    state: Arc<DispatchState>,
    permit: OwnedSemaphorePermit,
    connection: ActorHandle,
    channel: Channel,
    handler: Arc<T>,
    exchange: String,
    late_ack: bool,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let next = state.buffer.lock().await.pop_front();
        match next {
            Some((delivery, payload)) => {
                tokio::spawn(process_delivery(
                    delivery, payload, connection, channel, handler, exchange, late_ack, state, permit,
                ));
            }
            None => drop(permit),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        async fn handle_task(&self, payload: Value) -> Result<Value, String> {
            Ok(payload)
        }
    }

    #[test]
    fn queue_name_joins_exchange_and_routing_key() {
        let consumer = TaskConsumer::new("ex", ExchangeKind::Direct, "rk", EchoHandler);
        assert_eq!(consumer.queue_name(), "ex_rk");
    }

    #[test]
    fn default_pool_size_and_ack_timing() {
        let consumer = TaskConsumer::new("ex", ExchangeKind::Direct, "rk", EchoHandler);
        assert_eq!(consumer.pool_size, 5);
        assert!(!consumer.late_ack);
    }

    #[tokio::test]
    async fn semaphore_admits_up_to_pool_size_then_buffers() {
        let pool_size = 3;
        let semaphore = Arc::new(Semaphore::new(pool_size));

        let mut held = Vec::new();
        for _ in 0..pool_size {
            held.push(semaphore.clone().try_acquire_owned().expect("slot available under pool_size"));
        }
        assert!(semaphore.clone().try_acquire_owned().is_err(), "pool is full, next task must buffer");

        drop(held.pop());
        assert!(
            semaphore.clone().try_acquire_owned().is_ok(),
            "releasing one permit admits the next buffered task"
        );
    }
}
