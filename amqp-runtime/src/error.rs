use thiserror::Error;

/// Error taxonomy for the AMQP client runtime.
///
/// Reconnectable conditions never reach a caller as one of these — they're
/// handled inside the connection actor. What does reach a caller is either a
/// terminal broker error, a timeout on a synchronous wait, or a programming
/// mistake.
#[derive(Error, Debug)]
pub enum AmqpRuntimeError {
    #[error("failed to connect before deadline: {0}")]
    Connect(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("timed out waiting for reply")]
    Timeout,

    #[error("operation attempted on a closed client")]
    ClosedClient,

    #[error("misuse: {0}")]
    Misuse(&'static str),

    #[error("failed to parse message body: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no response received for correlation id {0}")]
    NoResponse(String),

    #[error("invalid broker configuration: {0}")]
    Config(String),

    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("reply slot dropped before a value was delivered")]
    ReplyDropped,
}
