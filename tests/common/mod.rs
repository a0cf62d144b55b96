#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reconnecting_websocket::error::{Error, Kind};
use reconnecting_websocket::transport::TransportError;
use reconnecting_websocket::{
    CloseEvent, Config, Connector, Event, EventKind, Payload, ReadyState, SignalSink, Transport,
};
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use url::Url;

pub const TARGET: &str = "ws://mock.test/feed";

/// How long a test waits for something that should happen.
pub const WAIT: Duration = Duration::from_secs(2);

/// One scripted connection attempt.
#[derive(Clone)]
pub struct MockAttempt {
    sink: SignalSink,
    state: Arc<Mutex<ReadyState>>,
    sent: Arc<Mutex<Vec<Payload>>>,
    terminated: Arc<Mutex<Option<(u16, String)>>>,
    pub protocols: Vec<String>,
}

impl MockAttempt {
    pub fn open(&self) {
        *self.state.lock().unwrap() = ReadyState::Open;
        self.sink.opened();
    }

    pub fn close(&self, code: u16) {
        *self.state.lock().unwrap() = ReadyState::Closed;
        self.sink.closed(CloseEvent::new(code, "", code == 1000));
    }

    /// Report a closure while the transport still claims to be open.
    pub fn close_signal_only(&self, code: u16) {
        self.sink.closed(CloseEvent::new(code, "", false));
    }

    pub fn error(&self) {
        self.sink
            .error(Error::with_source(Kind::Transport, TransportError::ChannelClosed));
    }

    pub fn message(&self, text: &str) {
        self.sink.message(Payload::from(text));
    }

    pub fn sent(&self) -> Vec<Payload> {
        self.sent.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> Option<(u16, String)> {
        self.terminated.lock().unwrap().clone()
    }

    pub fn generation(&self) -> u64 {
        self.sink.generation()
    }
}

pub struct MockTransport {
    attempt: MockAttempt,
}

impl Transport for MockTransport {
    fn send(&self, payload: Payload) -> reconnecting_websocket::Result<()> {
        let state = *self.attempt.state.lock().unwrap();
        if state != ReadyState::Open {
            return Err(TransportError::NotOpen { state }.into());
        }
        self.attempt.sent.lock().unwrap().push(payload);
        Ok(())
    }

    fn terminate(&self, code: u16, reason: &str) {
        *self.attempt.state.lock().unwrap() = ReadyState::Closing;
        *self.attempt.terminated.lock().unwrap() = Some((code, reason.to_owned()));
    }

    fn ready_state(&self) -> ReadyState {
        *self.attempt.state.lock().unwrap()
    }
}

/// Connector whose attempts are driven by the test.
#[derive(Clone)]
pub struct MockConnector {
    attempts: Arc<Mutex<Vec<MockAttempt>>>,
    count_tx: Arc<watch::Sender<usize>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            attempts: Arc::default(),
            count_tx: Arc::new(count_tx),
        }
    }
}

impl MockConnector {
    pub fn attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn attempt(&self, index: usize) -> MockAttempt {
        self.attempts.lock().unwrap()[index].clone()
    }

    /// Wait until at least `count` attempts were started and return the latest one.
    pub async fn wait_for_attempt(&self, count: usize) -> MockAttempt {
        let mut rx = self.count_tx.subscribe();
        timeout(WAIT, rx.wait_for(|&n| n >= count))
            .await
            .expect("timed out waiting for a connection attempt")
            .unwrap();
        self.attempt(count - 1)
    }
}

impl Connector for MockConnector {
    type Transport = MockTransport;

    fn connect(
        &self,
        _target: &Url,
        protocols: &[String],
        _config: &Config,
        sink: SignalSink,
    ) -> MockTransport {
        let attempt = MockAttempt {
            sink,
            state: Arc::new(Mutex::new(ReadyState::Connecting)),
            sent: Arc::default(),
            terminated: Arc::default(),
            protocols: protocols.to_vec(),
        };

        let mut attempts = self.attempts.lock().unwrap();
        attempts.push(attempt.clone());
        self.count_tx.send_replace(attempts.len());

        MockTransport { attempt }
    }
}

/// Zero-delay config with the given attempt budget.
pub fn config(max_reconnect_attempts: Option<u32>) -> Config {
    Config::builder()
        .reconnect_interval(Duration::ZERO)
        .maybe_max_reconnect_attempts(max_reconnect_attempts)
        .build()
}

pub async fn next_event(rx: &mut broadcast::Receiver<Event>) -> Event {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .unwrap()
}

/// Receive events up to and including the first terminal one.
pub async fn until_terminal(rx: &mut broadcast::Receiver<Event>) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    loop {
        let kind = next_event(rx).await.kind();
        kinds.push(kind);
        if kind.is_terminal() {
            return kinds;
        }
    }
}

pub async fn expect_kind(rx: &mut broadcast::Receiver<Event>, expected: EventKind) -> Event {
    let event = next_event(rx).await;
    assert_eq!(event.kind(), expected, "unexpected event {event:?}");
    event
}
