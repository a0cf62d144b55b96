//! The transport seam.
//!
//! A [`Transport`] is one underlying connection attempt. It is created by a
//! [`Connector`], reports what happens to it through the [`SignalSink`] it was
//! given, and is thrown away once it closes. Connections in this crate only ever
//! talk to transports through these traits, so any message-stream socket can be
//! plugged in.
//!
//! With the `tungstenite` feature a ready-made implementation on top of
//! `tokio-tungstenite` lives in [`tungstenite`].

pub mod error;
#[cfg(feature = "tungstenite")]
pub mod tungstenite;

use tokio::sync::mpsc;
use url::Url;

pub use self::error::TransportError;
use crate::Result;
use crate::config::Config;
use crate::error::Error;
use crate::event::{CloseEvent, Event, Payload};

/// Close codes the connection itself relies on.
pub mod close_code {
    /// Normal closure. Never reconnected.
    pub const NORMAL: u16 = 1000;
    /// The endpoint is going away.
    pub const GOING_AWAY: u16 = 1001;
    /// The connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
    /// A superseded transport is being restarted.
    pub const RESTART: u16 = 1012;
}

/// Ready state of a single transport.
#[non_exhaustive]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    #[must_use]
    pub const fn is_closing_or_closed(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

/// Parse and check a WebSocket endpoint.
pub fn parse_target(target: &str) -> Result<Url> {
    let url = Url::parse(target)?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(Error::validation(format!(
            "unsupported scheme `{other}`, expected `ws` or `wss`"
        ))),
    }
}

/// Something that happened to a transport.
#[non_exhaustive]
#[derive(Debug)]
pub enum Signal {
    Opened,
    Closed(CloseEvent),
    Error(Error),
    Message(Payload),
}

/// Work items for a connection's worker task, in arrival order.
#[derive(Debug)]
pub(crate) enum Command {
    /// A signal from the transport bound as `generation`
    Signal { generation: u64, signal: Signal },
    /// The retry timer armed while `generation` was bound has fired
    Retry { generation: u64 },
    /// An event produced outside the worker that must still be emitted in order
    Emit(Event),
}

/// Delivers a transport's signals to the connection that bound it.
///
/// Every sink is tagged with the binding it belongs to. Once the connection has
/// moved on to a newer transport, anything sent through an older sink is dropped.
#[derive(Debug, Clone)]
pub struct SignalSink {
    tx: mpsc::UnboundedSender<Command>,
    generation: u64,
}

impl SignalSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>, generation: u64) -> Self {
        Self { tx, generation }
    }

    /// Binding number this sink reports for.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn opened(&self) {
        self.emit(Signal::Opened);
    }

    pub fn closed(&self, event: CloseEvent) {
        self.emit(Signal::Closed(event));
    }

    pub fn error(&self, error: Error) {
        self.emit(Signal::Error(error));
    }

    pub fn message(&self, payload: Payload) {
        self.emit(Signal::Message(payload));
    }

    pub fn emit(&self, signal: Signal) {
        // The owner may already be gone; late signals are meaningless then.
        _ = self.tx.send(Command::Signal {
            generation: self.generation,
            signal,
        });
    }
}

/// One underlying connection attempt.
pub trait Transport: Send + Sync + 'static {
    /// Queue `payload` for delivery. Fails unless the transport is open.
    fn send(&self, payload: Payload) -> Result<()>;

    /// Ask the transport to close with `code` and `reason`.
    ///
    /// The transport reports the outcome through its sink as a `closed` signal.
    fn terminate(&self, code: u16, reason: &str);

    fn ready_state(&self) -> ReadyState;
}

/// Creates transports for a connection.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// Start a new connection attempt against `target`.
    ///
    /// Must not block: the attempt proceeds in the background and reports through `sink`.
    fn connect(
        &self,
        target: &Url,
        protocols: &[String],
        config: &Config,
        sink: SignalSink,
    ) -> Self::Transport;
}
