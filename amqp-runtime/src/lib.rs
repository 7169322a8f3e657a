//! A reconnecting AMQP client runtime: one connection actor multiplexes
//! publishing, consuming, and request/response RPC over a single long-lived
//! broker connection, so callers never deal with the broker's reconnection
//! discipline or non-thread-safe channel semantics directly.

pub mod actor;
pub mod backoff;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod events;
pub mod handler;
pub mod host_iter;
pub mod options;
pub mod rpc;

pub use actor::{ActorHandle, ConfigRefresh};
pub use backoff::Backoff;
pub use consumer::{TaskConsumer, TaskHandler};
pub use envelope::{Envelope, Method, ReplySlot};
pub use error::AmqpRuntimeError;
pub use events::{EventKind, EventsPublisher};
pub use handler::{Handler, ScheduledExecutionHandler, SendHandler};
pub use host_iter::HostIterator;
pub use options::BrokerOptions;
pub use rpc::{BlockingRequestResponseHandler, Callback, CallbackRequestResponseHandler};
