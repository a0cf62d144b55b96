//! Echo round trip against a public echo server.
//!
//! Sends "Hello World!" every time the connection opens or reconnects and logs
//! every lifecycle event until the connection closes or gives up.
//!
//! Run with:
//! ```sh
//! RUST_LOG=info,reconnecting_websocket=debug cargo run --example echo --features tracing
//! ```

use std::time::Duration;

use futures::StreamExt as _;
use reconnecting_websocket::{Config, Event, EventKind, EventMask, connect};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ENDPOINT: &str = "wss://echo.websocket.org";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::builder()
        .reconnect_interval(Duration::from_secs(2))
        .max_reconnect_attempts(5)
        .build();
    let socket = connect(ENDPOINT, config)?;

    let sender = socket.downgrade();
    socket.add_listener(EventMask::OPEN | EventMask::RECONNECT, move |event| {
        info!(%event, "WebSocket is open");
        let Some(sender) = sender.upgrade() else {
            return;
        };
        if let Err(e) = sender.send("Hello World!") {
            warn!(error = %e, "Unable to send greeting");
        }
    });
    socket.on(EventKind::Disconnect, |event| {
        if let Some(close) = event.close_event() {
            warn!(code = close.code, reason = %close.reason, "Disconnected");
        }
    });

    let mut events = Box::pin(socket.events());
    let mut received = 0_usize;

    while let Some(event) = events.next().await {
        match event? {
            Event::Message(payload) => {
                info!(message = ?payload.as_text(), "Received message");
                received += 1;
                if received == 2 {
                    // The first frame from the echo server is a banner
                    socket.close();
                }
            }
            Event::Close(close) | Event::ConnectionTimeout(close) => {
                info!(code = close.code, reason = %close.reason, "Finished");
            }
            Event::Error(e) => warn!(error = %e, "Transport error"),
            event => info!(%event),
        }
    }

    Ok(())
}
