//! [`Transport`] implementation on `tokio-tungstenite`.
//!
//! Each [`WsTransport`] is one connection attempt driven by its own background
//! task. The task performs the handshake, forwards frames in both directions and
//! reports everything through the [`SignalSink`] it was created with.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use super::{Connector, ReadyState, SignalSink, Transport, TransportError, close_code};
use crate::Result;
use crate::config::Config;
use crate::error::{Error, Kind};
use crate::event::{CloseEvent, Payload};

/// How long to wait for the peer to answer our close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Close status reported when the peer's close frame carried no code.
const NO_STATUS_RECEIVED: u16 = 1005;

/// Creates [`WsTransport`]s.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    type Transport = WsTransport;

    fn connect(
        &self,
        target: &Url,
        protocols: &[String],
        _config: &Config,
        sink: SignalSink,
    ) -> WsTransport {
        WsTransport::spawn(target.clone(), protocols.to_vec(), sink)
    }
}

enum Outgoing {
    Message(Message),
    Close { code: u16, reason: String },
}

/// Ready state shared between a transport handle and its task.
#[derive(Debug, Clone)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ReadyState::Connecting as u8)))
    }

    fn get(&self) -> ReadyState {
        match self.0.load(Ordering::Acquire) {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }

    fn set(&self, state: ReadyState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// One WebSocket connection attempt.
#[derive(Debug)]
pub struct WsTransport {
    outgoing_tx: mpsc::UnboundedSender<Outgoing>,
    state: SharedState,
}

impl WsTransport {
    fn spawn(target: Url, protocols: Vec<String>, sink: SignalSink) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let state = SharedState::new();

        tokio::spawn(Self::run(target, protocols, sink, state.clone(), outgoing_rx));

        Self { outgoing_tx, state }
    }

    async fn run(
        target: Url,
        protocols: Vec<String>,
        sink: SignalSink,
        state: SharedState,
        mut outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
    ) {
        let request = match client_request(&target, &protocols) {
            Ok(request) => request,
            Err(e) => {
                state.set(ReadyState::Closed);
                sink.error(e);
                sink.closed(CloseEvent::abnormal());
                return;
            }
        };

        let ws_stream = tokio::select! {
            result = connect_async(request) => match result {
                Ok((ws_stream, _)) => ws_stream,
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(endpoint = %target, error = %e, "Unable to connect");
                    state.set(ReadyState::Closed);
                    sink.error(e.into());
                    sink.closed(CloseEvent::abnormal());
                    return;
                }
            },
            (code, reason) = next_close(&mut outgoing_rx) => {
                // Terminated before the handshake finished
                state.set(ReadyState::Closed);
                sink.closed(CloseEvent::new(code, reason, false));
                return;
            }
        };

        state.set(ReadyState::Open);
        sink.opened();

        let (mut write, mut read) = ws_stream.split();
        let mut received: Option<CloseEvent> = None;
        let mut requested: Option<(u16, String)> = None;
        let mut close_deadline: Option<Instant> = None;
        let mut outgoing_open = true;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            sink.message(Payload::Text(text.as_str().to_owned()));
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            sink.message(Payload::Binary(bytes.to_vec()));
                        }
                        Some(Ok(Message::Close(frame))) => {
                            state.set(ReadyState::Closing);
                            received = Some(match frame {
                                Some(frame) => CloseEvent::new(
                                    u16::from(frame.code),
                                    frame.reason.as_str(),
                                    true,
                                ),
                                None => CloseEvent::new(NO_STATUS_RECEIVED, "", true),
                            });
                        }
                        Some(Ok(_)) => {
                            // Ping and pong are answered by tungstenite itself.
                        }
                        Some(Err(WsError::ConnectionClosed)) | None => break,
                        Some(Err(e)) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(
                                endpoint = %target,
                                error = %e,
                                "WebSocket stream failed"
                            );
                            sink.error(e.into());
                            break;
                        }
                    }
                }

                command = outgoing_rx.recv(), if outgoing_open => {
                    let (code, reason) = match command {
                        Some(Outgoing::Message(message)) => {
                            if let Err(e) = write.send(message).await {
                                sink.error(e.into());
                                break;
                            }
                            continue;
                        }
                        Some(Outgoing::Close { code, reason }) => (code, reason),
                        None => {
                            outgoing_open = false;
                            (close_code::GOING_AWAY, String::new())
                        }
                    };

                    if requested.is_some() || received.is_some() {
                        continue;
                    }

                    state.set(ReadyState::Closing);
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    requested = Some((code, reason));
                    close_deadline = Some(Instant::now() + CLOSE_TIMEOUT);

                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(error = %e, "Failed to send close frame");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;
                        break;
                    }
                }

                () = sleep_until(close_deadline.unwrap_or_else(Instant::now)),
                    if close_deadline.is_some() =>
                {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(endpoint = %target, "Peer did not answer close frame in time");
                    break;
                }
            }
        }

        state.set(ReadyState::Closed);

        let close = match (received, requested) {
            (Some(close), _) => close,
            (None, Some((code, reason))) => CloseEvent::new(code, reason, false),
            (None, None) => CloseEvent::abnormal(),
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            endpoint = %target,
            code = close.code,
            clean = close.was_clean,
            "WebSocket closed"
        );

        sink.closed(close);
    }
}

impl Transport for WsTransport {
    fn send(&self, payload: Payload) -> Result<()> {
        let state = self.state.get();
        if state != ReadyState::Open {
            return Err(TransportError::NotOpen { state }.into());
        }

        let message = match payload {
            Payload::Text(text) => Message::Text(text.into()),
            Payload::Binary(bytes) => Message::Binary(bytes.into()),
        };
        self.outgoing_tx
            .send(Outgoing::Message(message))
            .map_err(|_e| TransportError::ChannelClosed)?;
        Ok(())
    }

    fn terminate(&self, code: u16, reason: &str) {
        if self.state.get().is_closing_or_closed() {
            return;
        }

        self.state.set(ReadyState::Closing);
        _ = self.outgoing_tx.send(Outgoing::Close {
            code,
            reason: reason.to_owned(),
        });
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }
}

/// Wait for a close request while the handshake is in flight.
async fn next_close(outgoing_rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> (u16, String) {
    loop {
        match outgoing_rx.recv().await {
            Some(Outgoing::Close { code, reason }) => return (code, reason),
            // Sends are refused until open
            Some(Outgoing::Message(_)) => {}
            None => return (close_code::GOING_AWAY, String::new()),
        }
    }
}

fn client_request(target: &Url, protocols: &[String]) -> Result<Request> {
    let mut request = target.as_str().into_client_request()?;

    if !protocols.is_empty() {
        let value = HeaderValue::from_str(&protocols.join(", "))
            .map_err(|e| Error::with_source(Kind::Validation, e))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    Ok(request)
}
