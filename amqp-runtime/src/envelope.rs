use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, ExchangeDeclareOptions,
    ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Consumer, ExchangeKind};
use tokio::sync::oneshot;

use crate::error::AmqpRuntimeError;

/// A broker operation submitted by publish/ack helpers — the closed set of
/// methods the connection actor is willing to invoke on a caller's behalf.
/// Using an enum instead of a free-form method name turns an unsupported
/// method into a compile error instead of a runtime `AttributeError`.
#[derive(Debug)]
pub enum Method {
    Publish {
        exchange: String,
        routing_key: String,
        body: Vec<u8>,
        properties: BasicProperties,
    },
    BasicAck {
        delivery_tag: u64,
    },
    QueueDelete {
        queue: String,
        if_unused: bool,
        if_empty: bool,
    },
    ExchangeDelete {
        exchange: String,
    },
    QueueDeclare {
        queue: String,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        arguments: FieldTable,
    },
    ExchangeDeclare {
        exchange: String,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    BasicQos {
        prefetch_count: u16,
    },
    ConfirmDelivery,
}

impl Method {
    /// Invokes this method on `channel`. `basic_consume` is handled
    /// separately by callers that need the resulting `Consumer` stream — see
    /// `Envelope::deliver_on` in the connection actor.
    pub(crate) async fn invoke(&self, channel: &Channel) -> Result<(), lapin::Error> {
        match self {
            Method::Publish {
                exchange,
                routing_key,
                body,
                properties,
            } => {
                channel
                    .basic_publish(
                        exchange,
                        routing_key,
                        Default::default(),
                        body,
                        properties.clone(),
                    )
                    .await?
                    .await?;
                Ok(())
            }
            Method::BasicAck { delivery_tag } => {
                channel
                    .basic_ack(*delivery_tag, BasicAckOptions::default())
                    .await
            }
            Method::QueueDelete {
                queue,
                if_unused,
                if_empty,
            } => {
                channel
                    .queue_delete(
                        queue,
                        QueueDeleteOptions {
                            if_unused: *if_unused,
                            if_empty: *if_empty,
                            nowait: false,
                        },
                    )
                    .await
                    .map(|_| ())
            }
            Method::ExchangeDelete { exchange } => {
                channel
                    .exchange_delete(exchange, ExchangeDeleteOptions::default())
                    .await
            }
            Method::QueueDeclare {
                queue,
                durable,
                exclusive,
                auto_delete,
                arguments,
            } => channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: *durable,
                        exclusive: *exclusive,
                        auto_delete: *auto_delete,
                        passive: false,
                        nowait: false,
                    },
                    arguments.clone(),
                )
                .await
                .map(|_| ()),
            Method::ExchangeDeclare {
                exchange,
                kind,
                durable,
                auto_delete,
            } => {
                channel
                    .exchange_declare(
                        exchange,
                        kind.clone(),
                        ExchangeDeclareOptions {
                            durable: *durable,
                            auto_delete: *auto_delete,
                            passive: false,
                            internal: false,
                            nowait: false,
                        },
                        FieldTable::default(),
                    )
                    .await
            }
            Method::QueueBind {
                queue,
                exchange,
                routing_key,
            } => {
                channel
                    .queue_bind(
                        queue,
                        exchange,
                        routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
            }
            Method::BasicQos { prefetch_count } => {
                channel
                    .basic_qos(*prefetch_count, BasicQosOptions::default())
                    .await
            }
            Method::ConfirmDelivery => channel.confirm_select(Default::default()).await,
        }
    }

    /// `basic_consume` is split out of `invoke` because it returns a
    /// `Consumer` stream rather than `()`.
    pub(crate) async fn consume(
        channel: &Channel,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Consumer, lapin::Error> {
        channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
    }
}

/// The single-use reply slot conveying success or error back to a waiting
/// caller. `None` over the channel is never sent — dropping the sender
/// without a send is how `ReplyDropped` is communicated to the receiver.
pub type ReplySlot = oneshot::Sender<Result<(), AmqpRuntimeError>>;

/// A unit of work handed from any task to the connection actor.
pub struct Envelope {
    pub method: Method,
    /// Explicit channel to invoke on; `None` uses the actor's shared
    /// out-channel.
    pub channel: Option<Channel>,
    pub reply: Option<ReplySlot>,
}

impl Envelope {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            channel: None,
            reply: None,
        }
    }

    pub fn on_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_reply(mut self, reply: ReplySlot) -> Self {
        self.reply = Some(reply);
        self
    }
}
