use std::sync::Arc;
use std::time::Duration;

use lapin::ExchangeKind;
use serde::Serialize;

use crate::actor::{ActorHandle, ConfigRefresh};
use crate::error::AmqpRuntimeError;
use crate::handler::{Handler, SendHandler};
use crate::options::BrokerOptions;

const LOGS_EXCHANGE: &str = "cloudify-logs";
const EVENTS_EXCHANGE: &str = "cloudify-events";
const EVENTS_ROUTING_KEY: &str = "events";
const HOOKS_ROUTING_KEY: &str = "events.hooks";

/// The topic a message is routed to. A closed enum rather than the original
/// free-form string — same tradeoff as `Method` in `envelope.rs`: an unknown
/// kind becomes a compile error instead of a dropped-and-logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Log,
    Event,
    Hook,
}

/// Pre-wires the `log`/`event`/`hook` handlers onto one connection actor.
pub struct EventsPublisher {
    connection: ActorHandle,
    log: Arc<SendHandler>,
    event: Arc<SendHandler>,
    hook: Arc<SendHandler>,
}

impl EventsPublisher {
    pub async fn start(
        options: BrokerOptions,
        connect_timeout: Option<Duration>,
        config_refresh: Option<ConfigRefresh>,
    ) -> Result<Self, AmqpRuntimeError> {
        let log = Arc::new(SendHandler::no_wait(LOGS_EXCHANGE, ExchangeKind::Fanout, ""));
        let event = Arc::new(SendHandler::new(EVENTS_EXCHANGE, ExchangeKind::Topic, EVENTS_ROUTING_KEY));
        let hook = Arc::new(SendHandler::new(EVENTS_EXCHANGE, ExchangeKind::Topic, HOOKS_ROUTING_KEY));

        let handlers: Vec<Arc<dyn Handler>> = vec![log.clone(), event.clone(), hook.clone()];
        let connection = ActorHandle::start(options, handlers, connect_timeout, config_refresh).await?;

        Ok(Self { connection, log, event, hook })
    }

    /// Routes `message` to the handler bound to `kind`. Fails with
    /// `ClosedClient` after `close()`.
    pub async fn publish_message(&self, message: &impl Serialize, kind: EventKind) -> Result<(), AmqpRuntimeError> {
        if self.connection.is_closed() {
            return Err(AmqpRuntimeError::ClosedClient);
        }
        match kind {
            EventKind::Log => self.log.publish(&self.connection, message).await,
            EventKind::Event => self.event.publish(&self.connection, message).await,
            EventKind::Hook => self.hook.publish(&self.connection, message).await,
        }
    }

    /// Idempotent; tolerates errors encountered while the actor shuts down.
    pub async fn close(&self) {
        if self.connection.is_closed() {
            return;
        }
        self.connection.close(true).await;
        log::debug!("events publisher closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_is_a_closed_set() {
        let kinds = [EventKind::Log, EventKind::Event, EventKind::Hook];
        assert_eq!(kinds.len(), 3);
    }
}
