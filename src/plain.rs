#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::{Arc, Weak};

use futures::Stream;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use url::Url;

use crate::Result;
use crate::config::Config;
use crate::connection::CLOSE_REASON;
use crate::event::{self, Callback, Emitter, Event, EventKind, EventMask, ListenerId, Payload};
use crate::transport::{
    Command, Connector, ReadyState, Signal, SignalSink, Transport as _, close_code, parse_target,
};

/// A single transport with the connection event surface and no reconnection.
///
/// This is what a connection degenerates to when `reconnect` is off: it emits
/// `open`, `message`, `error` and finally `close` for whatever code the transport
/// reports, and never replaces the transport.
pub struct PlainConnection<C: Connector> {
    inner: Arc<PlainInner<C>>,
}

impl<C: Connector> Clone for PlainConnection<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A non-owning handle to a [`PlainConnection`], for capture inside callbacks.
pub struct WeakPlainConnection<C: Connector> {
    inner: Weak<PlainInner<C>>,
}

impl<C: Connector> Clone for WeakPlainConnection<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<C: Connector> WeakPlainConnection<C> {
    #[must_use]
    pub fn upgrade(&self) -> Option<PlainConnection<C>> {
        self.inner.upgrade().map(|inner| PlainConnection { inner })
    }
}

struct PlainInner<C: Connector> {
    target: Url,
    protocols: Vec<String>,
    config: Config,
    transport: C::Transport,
    events: Emitter,
}

impl<C: Connector> PlainConnection<C> {
    pub fn new(connector: &C, target: &str, config: Config) -> Result<Self> {
        Self::with_protocols(connector, target, Vec::new(), config)
    }

    pub fn with_protocols(
        connector: &C,
        target: &str,
        protocols: Vec<String>,
        config: Config,
    ) -> Result<Self> {
        let target = parse_target(target)?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let transport = connector.connect(
            &target,
            &protocols,
            &config,
            SignalSink::new(commands_tx, 0),
        );

        let inner = Arc::new(PlainInner {
            target,
            protocols,
            config,
            transport,
            events: Emitter::new(),
        });

        tokio::spawn(Self::run(Arc::downgrade(&inner), commands_rx));

        Ok(Self { inner })
    }

    async fn run(inner: Weak<PlainInner<C>>, mut commands_rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands_rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };

            let event = match command {
                Command::Signal { signal, .. } => match signal {
                    Signal::Opened => Event::Open,
                    Signal::Closed(close) => Event::Close(close),
                    Signal::Error(error) => Event::Error(Arc::new(error)),
                    Signal::Message(payload) => Event::Message(payload),
                },
                Command::Emit(event) => event,
                Command::Retry { .. } => continue,
            };

            inner.events.emit(&event);

            if event.kind().is_terminal() {
                break;
            }
        }
    }

    /// Get a handle that does not keep the connection alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakPlainConnection<C> {
        WeakPlainConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn send<P: Into<Payload>>(&self, payload: P) -> Result<()> {
        self.inner.transport.send(payload.into())
    }

    pub fn send_json<R: Serialize>(&self, request: &R) -> Result<()> {
        let json = serde_json::to_string(request)?;
        self.send(json)
    }

    /// Ask the transport to close with code 1000.
    pub fn close(&self) {
        if !self.inner.transport.ready_state().is_closing_or_closed() {
            self.inner
                .transport
                .terminate(close_code::NORMAL, CLOSE_REASON);
        }
    }

    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.inner.transport.ready_state()
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

    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.set_slot(kind, Some(Arc::new(callback)));
    }

    pub fn off(&self, kind: EventKind) {
        self.inner.events.set_slot(kind, None);
    }

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

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> impl Stream<Item = Result<Event>> + use<C> {
        event::into_stream(self.subscribe())
    }
}

impl<C: Connector> Drop for PlainInner<C> {
    fn drop(&mut self) {
        if !self.transport.ready_state().is_closing_or_closed() {
            self.transport
                .terminate(close_code::NORMAL, "connection dropped");
        }
    }
}
