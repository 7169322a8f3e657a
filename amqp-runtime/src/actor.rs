use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lapin::tcp::OwnedTLSConfig;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::envelope::{Envelope, Method, ReplySlot};
use crate::error::AmqpRuntimeError;
use crate::handler::Handler;
use crate::host_iter::HostIterator;
use crate::options::BrokerOptions;

const PUMP_TICK: Duration = Duration::from_millis(200);

tokio::task_local! {
    static ON_ACTOR_TASK: bool;
}

enum ActorMessage {
    Work(Envelope),
    AddHandler(Arc<dyn Handler>),
}

struct Shared {
    connection: RwLock<Option<Connection>>,
    connected: watch::Sender<bool>,
    closed: AtomicBool,
}

/// A cheap, `Clone`-able reference to a running connection actor. This is
/// the handle application code holds on to; the actor itself runs as a
/// detached task reachable only through this handle's channel.
#[derive(Clone)]
pub struct ActorHandle {
    sender: mpsc::UnboundedSender<ActorMessage>,
    shared: Arc<Shared>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

/// Optional hook consulted on failed connect attempts to re-load host list
/// and credentials before the next try, enabling HA failover.
pub type ConfigRefresh = Box<dyn Fn() -> BrokerOptions + Send + Sync>;

impl ActorHandle {
    /// Spawns the connection actor and blocks until either the first
    /// `register` pass succeeds or the first connect attempt fails past
    /// `connect_timeout`.
    pub async fn start(
        options: BrokerOptions,
        handlers: Vec<Arc<dyn Handler>>,
        connect_timeout: Option<Duration>,
        config_refresh: Option<ConfigRefresh>,
    ) -> Result<Self, AmqpRuntimeError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (connected_tx, _connected_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            connection: RwLock::new(None),
            connected: connected_tx,
            closed: AtomicBool::new(false),
        });

        let handle = ActorHandle {
            sender,
            shared: shared.clone(),
            join: Arc::new(Mutex::new(None)),
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let actor = ConnectionActor {
            options,
            handlers,
            shared,
            config_refresh,
            connect_timeout,
        };

        let handle_for_task = handle.clone();
        let join = tokio::spawn(ON_ACTOR_TASK.scope(true, async move {
            actor.run(receiver, handle_for_task, ready_tx).await;
        }));
        *handle.join.lock().await = Some(join);

        match ready_rx.await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AmqpRuntimeError::Connect(
                "actor task ended before completing its first connect".into(),
            )),
        }
    }

    /// Enqueues a method invocation. When `wait` is true, blocks on a
    /// single-use reply slot up to `timeout`.
    pub async fn channel_method(
        &self,
        method: Method,
        channel: Option<Channel>,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<(), AmqpRuntimeError> {
        if wait && ON_ACTOR_TASK.try_with(|v| *v).unwrap_or(false) {
            return Err(AmqpRuntimeError::Misuse(
                "cannot wait on channel_method from within the connection actor's own task",
            ));
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(AmqpRuntimeError::ClosedClient);
        }

        let mut envelope = Envelope::new(method);
        if let Some(channel) = channel {
            envelope = envelope.on_channel(channel);
        }

        let reply_rx = if wait {
            let (tx, rx): (ReplySlot, _) = oneshot::channel();
            envelope = envelope.with_reply(tx);
            Some(rx)
        } else {
            None
        };

        self.sender
            .send(ActorMessage::Work(envelope))
            .map_err(|_| AmqpRuntimeError::ClosedClient)?;

        match reply_rx {
            None => Ok(()),
            Some(rx) => {
                let result = match timeout {
                    Some(d) => tokio::time::timeout(d, rx)
                        .await
                        .map_err(|_| AmqpRuntimeError::Timeout)?,
                    None => Ok(rx.await.map_err(|_| AmqpRuntimeError::ReplyDropped)?),
                };
                result.map_err(|_| AmqpRuntimeError::ReplyDropped).and_then(|r| r)
            }
        }
    }

    pub async fn publish(
        &self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: Vec<u8>,
        properties: lapin::BasicProperties,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<(), AmqpRuntimeError> {
        self.channel_method(
            Method::Publish {
                exchange: exchange.into(),
                routing_key: routing_key.into(),
                body,
                properties,
            },
            None,
            wait,
            timeout,
        )
        .await
    }

    pub async fn ack(
        &self,
        channel: Channel,
        delivery_tag: u64,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<(), AmqpRuntimeError> {
        self.channel_method(Method::BasicAck { delivery_tag }, Some(channel), wait, timeout)
            .await
    }

    /// Appends a handler and, if a connection is already live, registers it
    /// immediately.
    pub fn add_handler(&self, handler: Arc<dyn Handler>) -> Result<(), AmqpRuntimeError> {
        self.sender
            .send(ActorMessage::AddHandler(handler))
            .map_err(|_| AmqpRuntimeError::ClosedClient)
    }

    /// Returns a fresh channel on the live connection. `create_channel` is
    /// inherently async in lapin, so unlike the Python original's blocking
    /// `channel()` call this must be awaited; `register` implementations run
    /// on the actor's own task but still go through the executor to get one.
    pub async fn channel_async(&self) -> Result<Channel, AmqpRuntimeError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(AmqpRuntimeError::ClosedClient);
        }
        let guard = self.shared.connection.read().await;
        match guard.as_ref() {
            Some(conn) => Ok(conn.create_channel().await?),
            None => Err(AmqpRuntimeError::ClosedClient),
        }
    }

    pub async fn close(&self, wait: bool) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if wait {
            let mut guard = self.join.lock().await;
            if let Some(join) = guard.take() {
                let _ = join.await;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

struct ConnectionActor {
    options: BrokerOptions,
    handlers: Vec<Arc<dyn Handler>>,
    shared: Arc<Shared>,
    config_refresh: Option<ConfigRefresh>,
    connect_timeout: Option<Duration>,
}

enum PumpOutcome {
    ConnectionLost,
    ChannelClosed(String),
    Closed,
}

impl ConnectionActor {
    async fn run(
        mut self,
        mut receiver: mpsc::UnboundedReceiver<ActorMessage>,
        handle: ActorHandle,
        ready_tx: oneshot::Sender<Result<(), AmqpRuntimeError>>,
    ) {
        let mut ready_tx = Some(ready_tx);
        let mut buffer: VecDeque<Envelope> = VecDeque::new();
        let mut hosts = HostIterator::new(self.options.hosts.clone());
        let mut backoff = Backoff::new();
        let mut last_channel: Option<Channel> = None;

        loop {
            let connect_result = self.connect_phase(&mut hosts, &mut backoff, &handle).await;
            let mut out_channel = match connect_result {
                Ok(ch) => ch,
                Err(e) => {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(e));
                    }
                    return;
                }
            };
            last_channel = Some(out_channel.clone());

            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(Ok(()));
            }
            let _ = self.shared.connected.send(true);

            match self.pump(&mut out_channel, &mut receiver, &mut buffer, &handle).await {
                PumpOutcome::Closed => break,
                PumpOutcome::ChannelClosed(reason) => {
                    log::error!("amqp actor: channel closed terminally: {reason}");
                    break;
                }
                PumpOutcome::ConnectionLost => {
                    let _ = self.shared.connected.send(false);
                    *self.shared.connection.write().await = None;
                    last_channel = None;
                    continue;
                }
            }
        }

        self.drain_once(&mut buffer, &mut receiver, last_channel.as_ref()).await;
        if let Some(conn) = self.shared.connection.write().await.take() {
            let _ = conn.close(200, "client shutdown").await;
        }
    }

    async fn connect_phase(
        &mut self,
        hosts: &mut HostIterator,
        backoff: &mut Backoff,
        handle: &ActorHandle,
    ) -> Result<Channel, AmqpRuntimeError> {
        let deadline = self.connect_timeout.map(|d| Instant::now() + d);
        let tls_config = self.load_tls_config().await?;

        let connection = loop {
            let host = hosts.next_host().to_string();
            let uri = self.options.amqp_uri(&host);
            log::debug!("amqp actor: attempting connect host={host}");

            let mut props = ConnectionProperties::default();
            if let Some(name) = &self.options.connection_name {
                props = props.with_connection_name(name.clone().into());
            }

            let connect_result = match &tls_config {
                Some(tls_config) => {
                    let config = OwnedTLSConfig {
                        identity: None,
                        cert_chain: tls_config.cert_chain.clone(),
                    };
                    Connection::connect_with_config(&uri, props, config).await
                }
                None => Connection::connect(&uri, props).await,
            };

            match connect_result {
                Ok(conn) => break conn,
                Err(e) => {
                    log::warn!("amqp actor: connect failed host={host} err={e}");
                    let delay = backoff.next_delay();
                    if let Some(deadline) = deadline {
                        if Instant::now() + delay > deadline {
                            return Err(AmqpRuntimeError::Connect(e.to_string()));
                        }
                    }
                    tokio::time::sleep(delay).await;
                    if let Some(refresh) = &self.config_refresh {
                        self.options = refresh();
                        *hosts = HostIterator::new(self.options.hosts.clone());
                    }
                }
            }
        };

        backoff.reset();
        let out_channel = connection.create_channel().await?;
        out_channel.confirm_select(Default::default()).await?;

        *self.shared.connection.write().await = Some(connection);

        for h in &self.handlers {
            h.register(handle).await?;
            log::info!("amqp actor: registered handler routing_key={}", h.routing_key());
        }

        Ok(out_channel)
    }

    /// Builds the TLS connector config from `tls_ca_path` when
    /// `tls_enabled`, read once per connect phase rather than once per
    /// host attempt since the CA cert doesn't vary by host. A missing or
    /// unreadable CA file is a static misconfiguration, not a transient
    /// connect failure, so this returns a hard error instead of feeding
    /// into the retry loop.
    async fn load_tls_config(&self) -> Result<Option<OwnedTLSConfig>, AmqpRuntimeError> {
        if !self.options.tls_enabled {
            return Ok(None);
        }
        let cert_chain = match &self.options.tls_ca_path {
            Some(path) => Some(tokio::fs::read_to_string(path).await.map_err(|e| {
                AmqpRuntimeError::Config(format!("failed to read tls_ca_path {path}: {e}"))
            })?),
            None => None,
        };
        Ok(Some(OwnedTLSConfig {
            identity: None,
            cert_chain,
        }))
    }

    async fn pump(
        &mut self,
        out_channel: &mut Channel,
        receiver: &mut mpsc::UnboundedReceiver<ActorMessage>,
        buffer: &mut VecDeque<Envelope>,
        handle: &ActorHandle,
    ) -> PumpOutcome {
        let mut ticker = tokio::time::interval(PUMP_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return PumpOutcome::Closed;
            }

            tokio::select! {
                biased;
                _ = ticker.tick() => {}
                msg = receiver.recv() => {
                    match msg {
                        Some(ActorMessage::Work(envelope)) => buffer.push_back(envelope),
                        Some(ActorMessage::AddHandler(h)) => {
                            if let Err(e) = h.register(handle).await {
                                log::error!("amqp actor: failed to register added handler routing_key={} err={e}", h.routing_key());
                            } else {
                                log::info!("amqp actor: registered added handler routing_key={}", h.routing_key());
                            }
                            self.handlers.push(h);
                        }
                        None => return PumpOutcome::Closed,
                    }
                }
            }

            while let Ok(msg) = receiver.try_recv() {
                match msg {
                    ActorMessage::Work(envelope) => buffer.push_back(envelope),
                    ActorMessage::AddHandler(h) => {
                        if let Err(e) = h.register(handle).await {
                            log::error!("amqp actor: failed to register added handler routing_key={} err={e}", h.routing_key());
                        }
                        self.handlers.push(h);
                    }
                }
            }

            match self.drain(out_channel, buffer).await {
                Ok(()) => {}
                Err(DrainError::ConnectionLost) => return PumpOutcome::ConnectionLost,
                Err(DrainError::ChannelClosed(reason)) => return PumpOutcome::ChannelClosed(reason),
            }
        }
    }

    /// Pops envelopes non-blockingly until the buffer is empty, invoking
    /// each on its target channel (or the shared out-channel).
    async fn drain(&self, out_channel: &Channel, buffer: &mut VecDeque<Envelope>) -> Result<(), DrainError> {
        while let Some(envelope) = buffer.pop_front() {
            let target = envelope.channel.clone().unwrap_or_else(|| out_channel.clone());
            let result = envelope.method.invoke(&target).await;

            match result {
                Ok(()) => {
                    if let Some(reply) = envelope.reply {
                        let _ = reply.send(Ok(()));
                    }
                }
                Err(e) => {
                    // Classify off the error itself rather than channel
                    // status: `target` and `out_channel` are the same
                    // object for every envelope submitted with
                    // `channel: None` (every SendHandler/TaskConsumer
                    // reply/RPC publish), so status checks alone can never
                    // tell a broker-side channel close (soft AMQP error,
                    // e.g. publish to an undeclared exchange) apart from
                    // the connection itself dropping.
                    if is_soft_channel_error(&e) {
                        // The broker closed this specific channel without
                        // dropping the connection. Per the broker actor's
                        // contract this is terminal: surface the error to
                        // any waiter, then stop the actor.
                        if let Some(reply) = envelope.reply {
                            let _ = reply.send(Err(AmqpRuntimeError::ChannelClosed(e.to_string())));
                        }
                        return Err(DrainError::ChannelClosed(e.to_string()));
                    }

                    if self.shared.closed.load(Ordering::SeqCst) {
                        return Ok(());
                    }

                    let target_dead = !target.status().connected();
                    let shared_dead = !out_channel.status().connected();

                    if target_dead || shared_dead {
                        // Head-of-line push-back: retry the exact same
                        // envelope, reply slot included, once reconnected.
                        buffer.push_front(envelope);
                        return Err(DrainError::ConnectionLost);
                    }

                    log::error!("amqp actor: envelope failed: {e}");
                    if let Some(reply) = envelope.reply {
                        let _ = reply.send(Err(AmqpRuntimeError::from(e)));
                    }
                }
            }
        }
        Ok(())
    }

    async fn drain_once(
        &self,
        buffer: &mut VecDeque<Envelope>,
        receiver: &mut mpsc::UnboundedReceiver<ActorMessage>,
        out_channel: Option<&Channel>,
    ) {
        while let Ok(msg) = receiver.try_recv() {
            if let ActorMessage::Work(envelope) = msg {
                buffer.push_back(envelope);
            }
        }
        if let Some(channel) = out_channel {
            let _ = self.drain(channel, buffer).await;
        }
    }
}

enum DrainError {
    ConnectionLost,
    ChannelClosed(String),
}

/// A "soft" AMQP error (e.g. `NOT_FOUND`, `PRECONDITION_FAILED`) closes only
/// the channel the offending method ran on, leaving the connection and every
/// other channel on it alive. A "hard" error closes the whole connection.
/// lapin surfaces both through the same `ProtocolError` variant, so this is
/// the only reliable way to tell them apart — channel status alone can't,
/// since a hard error also reports the channel as disconnected.
fn is_soft_channel_error(error: &lapin::Error) -> bool {
    matches!(
        error,
        lapin::Error::ProtocolError(amqp_err)
            if matches!(amqp_err.kind(), lapin::protocol::AMQPErrorKind::Soft(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unconnected_handle(closed: bool) -> ActorHandle {
        let (sender, _receiver) = mpsc::unbounded_channel();
        let (connected_tx, _connected_rx) = watch::channel(false);
        ActorHandle {
            sender,
            shared: Arc::new(Shared {
                connection: RwLock::new(None),
                connected: connected_tx,
                closed: AtomicBool::new(closed),
            }),
            join: Arc::new(Mutex::new(None)),
        }
    }

    fn unconnected_handle_with_receiver(closed: bool) -> (ActorHandle, mpsc::UnboundedReceiver<ActorMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (connected_tx, _connected_rx) = watch::channel(false);
        let handle = ActorHandle {
            sender,
            shared: Arc::new(Shared {
                connection: RwLock::new(None),
                connected: connected_tx,
                closed: AtomicBool::new(closed),
            }),
            join: Arc::new(Mutex::new(None)),
        };
        (handle, receiver)
    }

    #[tokio::test]
    async fn waiting_from_within_the_actor_task_is_rejected() {
        let handle = unconnected_handle(false);
        let result = ON_ACTOR_TASK
            .scope(true, async move {
                handle
                    .channel_method(Method::BasicAck { delivery_tag: 1 }, None, true, None)
                    .await
            })
            .await;
        assert!(matches!(result, Err(AmqpRuntimeError::Misuse(_))));
    }

    #[tokio::test]
    async fn fire_and_forget_from_within_the_actor_task_is_allowed() {
        let (handle, _receiver) = unconnected_handle_with_receiver(false);
        // wait=false skips the misuse check entirely; only a blocking wait
        // can deadlock the actor against itself.
        let result = ON_ACTOR_TASK
            .scope(true, async move {
                handle
                    .channel_method(Method::BasicAck { delivery_tag: 1 }, None, false, None)
                    .await
            })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn closed_client_rejects_channel_method() {
        let handle = unconnected_handle(true);
        let result = handle
            .channel_method(Method::BasicAck { delivery_tag: 1 }, None, false, None)
            .await;
        assert!(matches!(result, Err(AmqpRuntimeError::ClosedClient)));
    }

    #[tokio::test]
    async fn closed_client_rejects_channel_async() {
        let handle = unconnected_handle(true);
        let result = handle.channel_async().await;
        assert!(matches!(result, Err(AmqpRuntimeError::ClosedClient)));
    }

    #[tokio::test]
    async fn channel_async_without_a_live_connection_is_closed_client() {
        let handle = unconnected_handle(false);
        let result = handle.channel_async().await;
        assert!(matches!(result, Err(AmqpRuntimeError::ClosedClient)));
    }

    #[test]
    fn is_closed_reflects_shared_flag() {
        assert!(!unconnected_handle(false).is_closed());
        assert!(unconnected_handle(true).is_closed());
    }
}
