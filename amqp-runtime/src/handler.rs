use async_trait::async_trait;
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};
use serde::Serialize;
use serde_json::Value;

use crate::actor::ActorHandle;
use crate::envelope::Method;
use crate::error::AmqpRuntimeError;

/// A pluggable consumer or publisher bound to one or more broker objects.
///
/// `register` is invoked at most once per successful (re)connect, always on
/// the connection actor's own task, so implementations may call
/// `connection.channel_async()` and declare directly against it rather than
/// going through `channel_method`. It MUST be idempotent and re-declare
/// everything it depends on — broker state does not survive a reconnect.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn register(&self, connection: &ActorHandle) -> Result<(), AmqpRuntimeError>;

    fn routing_key(&self) -> &str;
}

const EXCHANGE_DURABLE_NOT_AUTO_DELETE: (bool, bool) = (true, false);

/// Declares a durable, non-auto-delete exchange and publishes JSON messages
/// to it. A textual message (`{"message": {"text": ...}, ...}`) is also
/// logged, at the level named by `message.level` (default `info`).
pub struct SendHandler {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub routing_key: String,
    pub wait_for_publish: bool,
}

impl SendHandler {
    pub fn new(exchange: impl Into<String>, exchange_kind: ExchangeKind, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            exchange_kind,
            routing_key: routing_key.into(),
            wait_for_publish: true,
        }
    }

    /// A `SendHandler` whose publishes are fire-and-forget (`wait_for_publish = false`).
    pub fn no_wait(exchange: impl Into<String>, exchange_kind: ExchangeKind, routing_key: impl Into<String>) -> Self {
        Self {
            wait_for_publish: false,
            ..Self::new(exchange, exchange_kind, routing_key)
        }
    }

    fn log_message(&self, message: &Value) {
        let Some(text) = message.pointer("/message/text").and_then(Value::as_str) else {
            return;
        };
        let level = message
            .get("level")
            .and_then(Value::as_str)
            .unwrap_or("info");
        let exec_id = message.pointer("/context/execution_id").and_then(Value::as_str);
        let line = match exec_id {
            Some(id) => format!("[{id}] {text}"),
            None => text.to_string(),
        };
        match level {
            "debug" => log::debug!("{line}"),
            "warn" | "warning" => log::warn!("{line}"),
            "error" => log::error!("{line}"),
            _ => log::info!("{line}"),
        }
    }

    pub async fn publish(&self, connection: &ActorHandle, message: &impl Serialize) -> Result<(), AmqpRuntimeError> {
        let value = serde_json::to_value(message)?;
        if value.get("message").is_some() {
            self.log_message(&value);
        }
        let body = serde_json::to_vec(&value)?;
        connection
            .channel_method(
                Method::Publish {
                    exchange: self.exchange.clone(),
                    routing_key: self.routing_key.clone(),
                    body,
                    properties: BasicProperties::default(),
                },
                None,
                self.wait_for_publish,
                None,
            )
            .await
    }
}

#[async_trait]
impl Handler for SendHandler {
    async fn register(&self, connection: &ActorHandle) -> Result<(), AmqpRuntimeError> {
        let channel = connection.channel_async().await?;
        let (durable, auto_delete) = EXCHANGE_DURABLE_NOT_AUTO_DELETE;
        Method::ExchangeDeclare {
            exchange: self.exchange.clone(),
            kind: self.exchange_kind.clone(),
            durable,
            auto_delete,
        }
        .invoke(&channel)
        .await?;
        log::info!("registered SendHandler exchange={}", self.exchange);
        Ok(())
    }

    fn routing_key(&self) -> &str {
        &self.routing_key
    }
}

/// Realises delayed delivery: parks messages on a TTL'd queue whose
/// dead-letter target is the real exchange/routing key.
pub struct ScheduledExecutionHandler {
    pub base: SendHandler,
    pub target_exchange: String,
    pub target_routing_key: String,
    pub ttl_ms: u64,
}

impl ScheduledExecutionHandler {
    pub fn new(
        exchange: impl Into<String>,
        exchange_kind: ExchangeKind,
        routing_key: impl Into<String>,
        target_exchange: impl Into<String>,
        target_routing_key: impl Into<String>,
        ttl_ms: u64,
    ) -> Self {
        Self {
            base: SendHandler::new(exchange, exchange_kind, routing_key),
            target_exchange: target_exchange.into(),
            target_routing_key: target_routing_key.into(),
            ttl_ms,
        }
    }

    pub async fn publish(&self, connection: &ActorHandle, message: &impl Serialize) -> Result<(), AmqpRuntimeError> {
        self.base.publish(connection, message).await
    }
}

#[async_trait]
impl Handler for ScheduledExecutionHandler {
    async fn register(&self, connection: &ActorHandle) -> Result<(), AmqpRuntimeError> {
        self.base.register(connection).await?;

        let channel = connection.channel_async().await?;
        let mut arguments = FieldTable::default();
        arguments.insert(
            "x-message-ttl".into(),
            lapin::types::AMQPValue::LongUInt(self.ttl_ms as u32),
        );
        arguments.insert(
            "x-dead-letter-exchange".into(),
            lapin::types::AMQPValue::LongString(self.target_exchange.clone().into()),
        );
        arguments.insert(
            "x-dead-letter-routing-key".into(),
            lapin::types::AMQPValue::LongString(self.target_routing_key.clone().into()),
        );

        Method::QueueDeclare {
            queue: self.base.routing_key.clone(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments,
        }
        .invoke(&channel)
        .await?;

        Method::QueueBind {
            queue: self.base.routing_key.clone(),
            exchange: self.base.exchange.clone(),
            routing_key: self.base.routing_key.clone(),
        }
        .invoke(&channel)
        .await?;

        log::info!(
            "registered ScheduledExecutionHandler queue={} ttl_ms={} target_exchange={} target_routing_key={}",
            self.base.routing_key,
            self.ttl_ms,
            self.target_exchange,
            self.target_routing_key,
        );
        Ok(())
    }

    fn routing_key(&self) -> &str {
        &self.base.routing_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_message_prefixes_execution_id() {
        let handler = SendHandler::new("ex", ExchangeKind::Direct, "rk");
        // Exercised indirectly through publish in integration tests; here we
        // just confirm the pointer lookups used by log_message don't panic
        // on messages lacking the optional fields.
        let msg = json!({"message": {"text": "hello"}, "level": "warn"});
        handler.log_message(&msg);
        let msg_no_text = json!({"message": {}});
        handler.log_message(&msg_no_text);
    }
}
