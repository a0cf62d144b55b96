#![expect(
    clippy::module_name_repetitions,
    reason = "Socket types expose their domain in the name for clarity"
)]

use futures::Stream;
use futures::future::Either;
use serde::Serialize;
use tokio::sync::broadcast;
use url::Url;

use crate::Result;
use crate::config::Config;
use crate::connection::{ReconnectingConnection, WeakConnection};
use crate::event::{Event, EventKind, EventMask, ListenerId, Payload};
use crate::plain::{PlainConnection, WeakPlainConnection};
use crate::transport::Connector;

/// A connection chosen from [`Config::reconnect`].
///
/// Both variants share the same event surface, so callers that only consume
/// events and send messages do not need to care which one they got.
#[non_exhaustive]
pub enum Socket<C: Connector> {
    /// `reconnect` was off: one transport, no retries
    Plain(PlainConnection<C>),
    Reconnecting(ReconnectingConnection<C>),
}

impl<C: Connector> Clone for Socket<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Plain(connection) => Self::Plain(connection.clone()),
            Self::Reconnecting(connection) => Self::Reconnecting(connection.clone()),
        }
    }
}

/// A non-owning handle to a [`Socket`].
///
/// Callbacks are owned by the socket they are registered on; capturing this
/// instead of a clone lets the socket close when its last handle is dropped.
#[non_exhaustive]
pub enum WeakSocket<C: Connector> {
    Plain(WeakPlainConnection<C>),
    Reconnecting(WeakConnection<C>),
}

impl<C: Connector> Clone for WeakSocket<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Plain(connection) => Self::Plain(connection.clone()),
            Self::Reconnecting(connection) => Self::Reconnecting(connection.clone()),
        }
    }
}

impl<C: Connector> WeakSocket<C> {
    #[must_use]
    pub fn upgrade(&self) -> Option<Socket<C>> {
        match self {
            Self::Plain(connection) => connection.upgrade().map(Socket::Plain),
            Self::Reconnecting(connection) => connection.upgrade().map(Socket::Reconnecting),
        }
    }
}

impl<C: Connector> Socket<C> {
    /// Open a connection to `target`, reconnecting unless `config.reconnect` is false.
    pub fn open(
        connector: C,
        target: &str,
        protocols: Vec<String>,
        config: Config,
    ) -> Result<Self> {
        if config.reconnect {
            ReconnectingConnection::with_protocols(connector, target, protocols, config)
                .map(Self::Reconnecting)
        } else {
            PlainConnection::with_protocols(&connector, target, protocols, config).map(Self::Plain)
        }
    }

    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        matches!(self, Self::Reconnecting(_))
    }

    #[must_use]
    pub fn as_reconnecting(&self) -> Option<&ReconnectingConnection<C>> {
        match self {
            Self::Reconnecting(connection) => Some(connection),
            Self::Plain(_) => None,
        }
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakSocket<C> {
        match self {
            Self::Plain(connection) => WeakSocket::Plain(connection.downgrade()),
            Self::Reconnecting(connection) => WeakSocket::Reconnecting(connection.downgrade()),
        }
    }

    pub fn send<P: Into<Payload>>(&self, payload: P) -> Result<()> {
        match self {
            Self::Plain(connection) => connection.send(payload),
            Self::Reconnecting(connection) => connection.send(payload),
        }
    }

    pub fn send_json<R: Serialize>(&self, request: &R) -> Result<()> {
        match self {
            Self::Plain(connection) => connection.send_json(request),
            Self::Reconnecting(connection) => connection.send_json(request),
        }
    }

    pub fn close(&self) {
        match self {
            Self::Plain(connection) => connection.close(),
            Self::Reconnecting(connection) => connection.close(),
        }
    }

    #[must_use]
    pub fn target(&self) -> &Url {
        match self {
            Self::Plain(connection) => connection.target(),
            Self::Reconnecting(connection) => connection.target(),
        }
    }

    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        match self {
            Self::Plain(connection) => connection.on(kind, callback),
            Self::Reconnecting(connection) => connection.on(kind, callback),
        }
    }

    pub fn off(&self, kind: EventKind) {
        match self {
            Self::Plain(connection) => connection.off(kind),
            Self::Reconnecting(connection) => connection.off(kind),
        }
    }

    pub fn add_listener<F>(&self, mask: EventMask, callback: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        match self {
            Self::Plain(connection) => connection.add_listener(mask, callback),
            Self::Reconnecting(connection) => connection.add_listener(mask, callback),
        }
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        match self {
            Self::Plain(connection) => connection.remove_listener(id),
            Self::Reconnecting(connection) => connection.remove_listener(id),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        match self {
            Self::Plain(connection) => connection.subscribe(),
            Self::Reconnecting(connection) => connection.subscribe(),
        }
    }

    pub fn events(&self) -> impl Stream<Item = Result<Event>> + use<C> {
        match self {
            Self::Plain(connection) => Either::Left(connection.events()),
            Self::Reconnecting(connection) => Either::Right(connection.events()),
        }
    }
}
