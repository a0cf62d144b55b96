#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod machine;
pub mod plain;
pub mod socket;
pub mod transport;

pub use config::Config;
pub use connection::{ReconnectingConnection, WeakConnection};
use error::Error;
pub use event::{CloseEvent, Event, EventKind, EventMask, ListenerId, Payload};
pub use machine::Status;
pub use plain::{PlainConnection, WeakPlainConnection};
pub use socket::{Socket, WeakSocket};
#[cfg(feature = "tungstenite")]
pub use transport::tungstenite::{WsConnector, WsTransport};
pub use transport::{Connector, ReadyState, Signal, SignalSink, Transport};

pub type Result<T> = std::result::Result<T, Error>;

/// Connect to `target` over `tokio-tungstenite`.
///
/// Returns a reconnecting connection unless `config.reconnect` is false.
#[cfg(feature = "tungstenite")]
pub fn connect(target: &str, config: Config) -> Result<Socket<WsConnector>> {
    Socket::open(WsConnector, target, Vec::new(), config)
}

/// Connect to `target` over `tokio-tungstenite`, offering `protocols` during the handshake.
#[cfg(feature = "tungstenite")]
pub fn connect_with_protocols<I, S>(
    target: &str,
    protocols: I,
    config: Config,
) -> Result<Socket<WsConnector>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let protocols = protocols.into_iter().map(Into::into).collect();
    Socket::open(WsConnector, target, protocols, config)
}
