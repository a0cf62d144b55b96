#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use backoff::backoff::{Backoff as _, Constant};
use futures::Stream;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use url::Url;

use crate::Result;
use crate::config::Config;
use crate::event::{
    self, Callback, CloseEvent, Emitter, Event, EventKind, EventMask, ListenerId, Payload,
};
use crate::machine::{CloseRequest, Closure, Machine, Opened, Status};
use crate::transport::{
    Command, Connector, ReadyState, Signal, SignalSink, Transport as _, TransportError,
    close_code, parse_target,
};

/// Reason sent with the close frame of a caller-initiated close.
pub(crate) const CLOSE_REASON: &str = "close called";
const RESTART_REASON: &str = "restart";
const DROP_REASON: &str = "connection dropped";

/// A WebSocket-style connection that re-establishes itself after unintentional closes.
///
/// The connection owns at most one transport at a time. Every signal from that
/// transport runs through the reconnection state machine on a single background
/// task, which emits the resulting lifecycle [`Event`]s and, after an unintentional
/// close, arms a timer that replaces the transport with a fresh one.
///
/// Handles are cheap to clone and share the same connection. Dropping the last
/// handle closes the bound transport. Callbacks registered on the connection are
/// owned by it, so a callback that needs the connection should capture a
/// [`WeakConnection`] from [`downgrade`](Self::downgrade) rather than a clone;
/// a captured clone keeps the connection alive until `close()` is called.
///
/// Must be created from within a tokio runtime.
///
/// # Example
///
/// ```ignore
/// let connection =
///     ReconnectingConnection::new(WsConnector, "wss://echo.websocket.org", Config::default())?;
///
/// let weak = connection.downgrade();
/// connection.on(EventKind::Open, move |_| {
///     if let Some(connection) = weak.upgrade() {
///         _ = connection.send("hello");
///     }
/// });
/// connection.on(EventKind::Reconnect, |_| println!("back online"));
///
/// let mut events = connection.subscribe();
/// while let Ok(event) = events.recv().await {
///     if let Event::Message(payload) = event {
///         println!("{payload:?}");
///     }
/// }
/// ```
pub struct ReconnectingConnection<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ReconnectingConnection<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C: Connector> {
    target: Url,
    protocols: Vec<String>,
    config: Config,
    connector: C,
    /// State machine and the bound transport; `send` and `close` take this lock too
    core: Mutex<Core<C::Transport>>,
    /// Sender side of the worker's command queue
    commands_tx: mpsc::UnboundedSender<Command>,
    /// Watch channel sender for status changes
    state_tx: watch::Sender<Status>,
    events: Emitter,
}

struct Core<T> {
    machine: Machine,
    transport: Option<T>,
    /// Binding number of `transport`; signals tagged with any other number are stale
    generation: u64,
    /// Pending retry timer while reconnecting
    retry: Option<JoinHandle<()>>,
    backoff: Constant,
}

/// A non-owning handle to a [`ReconnectingConnection`].
///
/// Does not keep the connection alive; meant for capture inside event callbacks.
pub struct WeakConnection<C: Connector> {
    inner: Weak<Inner<C>>,
}

impl<C: Connector> Clone for WeakConnection<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<C: Connector> WeakConnection<C> {
    /// Get a full handle back, unless every handle has been dropped.
    #[must_use]
    pub fn upgrade(&self) -> Option<ReconnectingConnection<C>> {
        self.inner
            .upgrade()
            .map(|inner| ReconnectingConnection { inner })
    }
}

impl<C: Connector> ReconnectingConnection<C> {
    /// Create a connection to `target` and start the first attempt.
    pub fn new(connector: C, target: &str, config: Config) -> Result<Self> {
        Self::with_protocols(connector, target, Vec::new(), config)
    }

    /// Create a connection to `target` negotiating one of `protocols`.
    pub fn with_protocols(
        connector: C,
        target: &str,
        protocols: Vec<String>,
        config: Config,
    ) -> Result<Self> {
        let target = parse_target(target)?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(Status::Connecting);

        let inner = Arc::new(Inner {
            core: Mutex::new(Core {
                machine: Machine::new(config.max_reconnect_attempts),
                transport: None,
                generation: 0,
                retry: None,
                backoff: (&config).into(),
            }),
            target,
            protocols,
            config,
            connector,
            commands_tx,
            state_tx,
            events: Emitter::new(),
        });

        inner.rebind(&mut inner.lock());

        tokio::spawn(Self::run(Arc::downgrade(&inner), commands_rx));

        Ok(Self { inner })
    }

    /// Drain the command queue until a terminal event or until every handle is gone.
    async fn run(inner: Weak<Inner<C>>, mut commands_rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands_rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };

            let events = inner.handle(command);

            let mut terminal = false;
            for event in &events {
                inner.events.emit(event);
                terminal |= event.kind().is_terminal();
            }

            if terminal {
                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint = %inner.target, "Connection reached a terminal state");
                break;
            }
        }
    }

    /// Send `payload` over the bound transport.
    ///
    /// Nothing is buffered: this fails unless the connection is currently open.
    pub fn send<P: Into<Payload>>(&self, payload: P) -> Result<()> {
        let core = self.inner.lock();
        match &core.transport {
            Some(transport) => transport.send(payload.into()),
            None => Err(TransportError::Unbound.into()),
        }
    }

    /// Serialize `request` as JSON and send it as a text message.
    pub fn send_json<R: Serialize>(&self, request: &R) -> Result<()> {
        let json = serde_json::to_string(request)?;
        self.send(json)
    }

    /// Close the connection for good.
    ///
    /// While open the transport is asked to close with code 1000 and the status
    /// becomes [`Status::Closing`] right away, so the closure that follows is
    /// reported as `close` whatever code the transport reports. While still
    /// connecting the status becomes Closing but the transport is left alone: its
    /// closure is reported as `close`, and if it opens instead it is asked to close
    /// then. While waiting to retry, the pending retry is cancelled and `close` is
    /// emitted directly. Otherwise this does nothing.
    pub fn close(&self) {
        let mut core = self.inner.lock();

        match core.machine.request_close() {
            CloseRequest::Terminate => {
                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint = %self.inner.target, "Closing connection");
                if let Some(transport) = &core.transport {
                    transport.terminate(close_code::NORMAL, CLOSE_REASON);
                }
            }
            CloseRequest::Defer => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    endpoint = %self.inner.target,
                    "Close requested while connecting, deferring until the attempt settles"
                );
            }
            CloseRequest::CancelRetry => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    endpoint = %self.inner.target,
                    "Closing connection, cancelling pending retry"
                );
                if let Some(retry) = core.retry.take() {
                    retry.abort();
                }
                self.inner.unbind(&mut core);
                _ = self.inner.commands_tx.send(Command::Emit(Event::Close(CloseEvent::new(
                    close_code::NORMAL,
                    CLOSE_REASON,
                    true,
                ))));
            }
            CloseRequest::Ignore => {}
        }

        self.inner.publish(&core);
    }

    /// Get a handle that does not keep the connection alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakConnection<C> {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Get the current status.
    #[must_use]
    pub fn status(&self) -> Status {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<Status> {
        self.inner.state_tx.subscribe()
    }

    /// Consecutive failed attempts since the last successful open.
    #[must_use]
    pub fn attempt_number(&self) -> u32 {
        self.inner.lock().machine.attempt_number()
    }

    #[must_use]
    pub fn has_connected_once(&self) -> bool {
        self.inner.lock().machine.has_connected_once()
    }

    /// Ready state of the bound transport, if any.
    #[must_use]
    pub fn transport_state(&self) -> Option<ReadyState> {
        self.inner
            .lock()
            .transport
            .as_ref()
            .map(|transport| transport.ready_state())
    }

    #[must_use]
    pub fn target(&self) -> &Url {
        &self.inner.target
    }

    #[must_use]
    pub fn protocols(&self) -> &[String] {
        &self.inner.protocols
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Set the single callback for `kind`, replacing any previous one.
    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.set_slot(kind, Some(Arc::new(callback)));
    }

    /// Clear the single callback for `kind`.
    pub fn off(&self, kind: EventKind) {
        self.inner.events.set_slot(kind, None);
    }

    /// Add a general listener for the events in `mask`.
    pub fn add_listener<F>(&self, mask: EventMask, callback: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        self.inner.events.add_listener(mask, callback)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.events.remove_listener(id)
    }

    /// Subscribe to all events.
    ///
    /// Each call returns a new independent receiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Stream of all events, ending after `close` or `connectiontimeout`.
    pub fn events(&self) -> impl Stream<Item = Result<Event>> + use<C> {
        event::into_stream(self.subscribe())
    }
}

impl<C: Connector> Inner<C> {
    // Every mutation of `Core` is a whole-field assignment, so a poisoned lock holds
    // consistent data.
    fn lock(&self) -> MutexGuard<'_, Core<C::Transport>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, core: &Core<C::Transport>) {
        self.state_tx.send_replace(core.machine.status());
    }

    fn handle(&self, command: Command) -> Vec<Event> {
        let mut core = self.lock();

        match command {
            Command::Signal { generation, signal } => {
                if generation != core.generation {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(
                        generation,
                        current = core.generation,
                        ?signal,
                        "Dropping signal from superseded transport"
                    );
                    return Vec::new();
                }
                self.on_signal(&mut core, signal)
            }
            Command::Retry { generation } => {
                if generation == core.generation && core.machine.status() == Status::Reconnecting {
                    core.retry = None;
                    self.rebind(&mut core);
                }
                Vec::new()
            }
            Command::Emit(event) => vec![event],
        }
    }

    fn on_signal(&self, core: &mut Core<C::Transport>, signal: Signal) -> Vec<Event> {
        match signal {
            Signal::Opened => {
                let opened = core.machine.opened();

                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint = %self.target, ?opened, "Connection open");

                if core.machine.take_pending_close()
                    && let Some(transport) = &core.transport
                {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(endpoint = %self.target, "Carrying out deferred close");
                    transport.terminate(close_code::NORMAL, CLOSE_REASON);
                }
                self.publish(core);

                match opened {
                    Opened::First => vec![Event::Open],
                    Opened::Reconnected => vec![Event::Reconnect],
                }
            }
            Signal::Closed(close) => {
                let closure = core.machine.closed(close.code);
                self.publish(core);

                match closure {
                    Closure::Graceful => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(
                            code = close.code,
                            reason = %close.reason,
                            "Connection closed"
                        );
                        self.unbind(core);
                        vec![Event::Close(close)]
                    }
                    Closure::Retry {
                        disconnect,
                        attempt,
                    } => {
                        let mut events = Vec::with_capacity(2);
                        if disconnect {
                            events.push(Event::Disconnect(close.clone()));
                        }
                        events.push(Event::ConnectionRetry(close));
                        self.schedule_retry(core, attempt);
                        events
                    }
                    Closure::Exhausted { attempts } => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(attempts, endpoint = %self.target, "Giving up reconnecting");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &attempts;
                        self.unbind(core);
                        vec![Event::ConnectionTimeout(close)]
                    }
                }
            }
            Signal::Error(error) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%error, "Transport error");
                vec![Event::Error(Arc::new(error))]
            }
            Signal::Message(payload) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(?payload, "Received message");
                vec![Event::Message(payload)]
            }
        }
    }

    fn schedule_retry(&self, core: &mut Core<C::Transport>, attempt: u32) {
        let delay = core.backoff.next_backoff().unwrap_or_default();

        #[cfg(feature = "tracing")]
        tracing::debug!(attempt, ?delay, endpoint = %self.target, "Scheduling reconnect");
        #[cfg(not(feature = "tracing"))]
        let _ = &attempt;

        if let Some(previous) = core.retry.take() {
            previous.abort();
        }

        let generation = core.generation;
        let commands_tx = self.commands_tx.clone();
        core.retry = Some(tokio::spawn(async move {
            sleep(delay).await;
            _ = commands_tx.send(Command::Retry { generation });
        }));
    }

    /// Detach the bound transport so nothing it reports is processed any more.
    fn unbind(&self, core: &mut Core<C::Transport>) {
        core.generation = core.generation.wrapping_add(1);

        if let Some(old) = core.transport.take()
            && !old.ready_state().is_closing_or_closed()
        {
            #[cfg(feature = "tracing")]
            tracing::trace!(endpoint = %self.target, "Terminating superseded transport");
            old.terminate(close_code::RESTART, RESTART_REASON);
        }
    }

    /// Replace the bound transport with a fresh attempt.
    fn rebind(&self, core: &mut Core<C::Transport>) {
        self.unbind(core);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            generation = core.generation,
            endpoint = %self.target,
            "Starting connection attempt"
        );

        let sink = SignalSink::new(self.commands_tx.clone(), core.generation);
        core.transport = Some(
            self.connector
                .connect(&self.target, &self.protocols, &self.config, sink),
        );
    }
}

impl<C: Connector> Drop for Inner<C> {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);

        if let Some(retry) = core.retry.take() {
            retry.abort();
        }
        if let Some(transport) = core.transport.take()
            && !transport.ready_state().is_closing_or_closed()
        {
            transport.terminate(close_code::NORMAL, DROP_REASON);
        }
    }
}
