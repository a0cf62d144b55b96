//! Lifecycle events and their dispatch.
//!
//! Every event is delivered in the same order: the single callback registered for
//! its kind with `on`, then each general listener whose [`EventMask`] matches, then
//! every broadcast subscriber.

#![expect(
    clippy::module_name_repetitions,
    reason = "Event types read better with the domain in the name"
)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_stream::try_stream;
use bitflags::bitflags;
use futures::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::Result;
use crate::error::Error;
use crate::transport::TransportError;
use crate::transport::close_code;

/// Broadcast channel capacity for emitted events.
const BROADCAST_CAPACITY: usize = 1024;

/// Raw message content carried by a transport.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

/// Details of a transport closing.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
    /// Whether the closing handshake completed
    pub was_clean: bool,
}

impl CloseEvent {
    #[must_use]
    pub fn new<S: Into<String>>(code: u16, reason: S, was_clean: bool) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean,
        }
    }

    /// A closure without any close frame.
    #[must_use]
    pub fn abnormal() -> Self {
        Self::new(close_code::ABNORMAL, "", false)
    }

    #[must_use]
    pub const fn is_normal(&self) -> bool {
        self.code == close_code::NORMAL
    }
}

/// The kinds of lifecycle event, named as they are emitted.
#[non_exhaustive]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Open = 0,
    Close = 1,
    Error = 2,
    Message = 3,
    Reconnect = 4,
    Disconnect = 5,
    ConnectionRetry = 6,
    ConnectionTimeout = 7,
}

impl EventKind {
    pub const COUNT: usize = 8;

    pub const ALL: [Self; Self::COUNT] = [
        Self::Open,
        Self::Close,
        Self::Error,
        Self::Message,
        Self::Reconnect,
        Self::Disconnect,
        Self::ConnectionRetry,
        Self::ConnectionTimeout,
    ];

    /// Whether no further events follow this one.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Close | Self::ConnectionTimeout)
    }

    const fn index(self) -> usize {
        self as usize
    }
}

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u8 {
        const NONE = 0;
        const OPEN = 1;
        const CLOSE = 1 << 1;
        const ERROR = 1 << 2;
        const MESSAGE = 1 << 3;
        const RECONNECT = 1 << 4;
        const DISCONNECT = 1 << 5;
        const CONNECTION_RETRY = 1 << 6;
        const CONNECTION_TIMEOUT = 1 << 7;

        /// Everything except messages.
        const LIFECYCLE = Self::OPEN.bits()
            | Self::CLOSE.bits()
            | Self::ERROR.bits()
            | Self::RECONNECT.bits()
            | Self::DISCONNECT.bits()
            | Self::CONNECTION_RETRY.bits()
            | Self::CONNECTION_TIMEOUT.bits();

        const ALL = Self::LIFECYCLE.bits() | Self::MESSAGE.bits();
    }
}

impl From<EventKind> for EventMask {
    fn from(kind: EventKind) -> Self {
        Self::from_bits_truncate(1 << kind.index())
    }
}

impl Default for EventMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// A lifecycle event.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Event {
    /// First successful connection
    Open,
    /// Final, intentional closure
    Close(CloseEvent),
    /// Transport error; never terminal by itself
    Error(Arc<Error>),
    Message(Payload),
    /// Connection re-established after a disconnect
    Reconnect,
    /// An established connection was lost; fires once per episode
    Disconnect(CloseEvent),
    /// A retry is about to be scheduled
    ConnectionRetry(CloseEvent),
    /// Attempts exhausted; no further retries
    ConnectionTimeout(CloseEvent),
}

impl Event {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Open => EventKind::Open,
            Self::Close(_) => EventKind::Close,
            Self::Error(_) => EventKind::Error,
            Self::Message(_) => EventKind::Message,
            Self::Reconnect => EventKind::Reconnect,
            Self::Disconnect(_) => EventKind::Disconnect,
            Self::ConnectionRetry(_) => EventKind::ConnectionRetry,
            Self::ConnectionTimeout(_) => EventKind::ConnectionTimeout,
        }
    }

    #[must_use]
    pub fn close_event(&self) -> Option<&CloseEvent> {
        match self {
            Self::Close(close)
            | Self::Disconnect(close)
            | Self::ConnectionRetry(close)
            | Self::ConnectionTimeout(close) => Some(close),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())
    }
}

pub type Callback = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

/// Handle for removing a listener added with `add_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    mask: EventMask,
    callback: Callback,
}

/// Per-connection callback registry and broadcaster.
pub(crate) struct Emitter {
    slots: RwLock<[Option<Callback>; EventKind::COUNT]>,
    listeners: RwLock<Vec<Listener>>,
    next_id: AtomicU64,
    broadcast_tx: broadcast::Sender<Event>,
}

impl Emitter {
    pub(crate) fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            slots: RwLock::new(Default::default()),
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            broadcast_tx,
        }
    }

    // Slots and listeners hold no cross-entry invariants, so poisoned locks are recovered.
    pub(crate) fn set_slot(&self, kind: EventKind, callback: Option<Callback>) {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)[kind.index()] = callback;
    }

    pub(crate) fn add_listener(&self, mask: EventMask, callback: Callback) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Listener { id, mask, callback });
        id
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        listeners.len() != before
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast_tx.subscribe()
    }

    /// Deliver `event` to the named slot, the matching listeners and the subscribers.
    ///
    /// Callbacks are cloned out of the locks first, so they may register or remove
    /// callbacks themselves.
    pub(crate) fn emit(&self, event: &Event) {
        let kind = event.kind();

        let slot = self.slots.read().unwrap_or_else(PoisonError::into_inner)[kind.index()].clone();
        if let Some(callback) = slot {
            callback(event);
        }

        let listeners: Vec<Callback> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|listener| listener.mask.contains(kind.into()))
            .map(|listener| Arc::clone(&listener.callback))
            .collect();
        for callback in listeners {
            callback(event);
        }

        // No receivers is fine
        _ = self.broadcast_tx.send(event.clone());
    }
}

/// Turn a broadcast receiver into a stream of events, reporting lag as an error.
pub(crate) fn into_stream(
    mut rx: broadcast::Receiver<Event>,
) -> impl Stream<Item = Result<Event>> {
    try_stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let terminal = event.kind().is_terminal();
                    yield event;
                    if terminal {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Event stream lagged, missed {n} events");
                    Err(TransportError::Lagged { count: n })?;
                }
                Err(RecvError::Closed) => {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::StreamExt as _;

    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Callback {
        let log = Arc::clone(log);
        Arc::new(move |event: &Event| log.lock().unwrap().push(format!("{tag}:{event}")))
    }

    #[test]
    fn kind_names_are_lowercase() {
        assert_eq!(EventKind::ConnectionRetry.to_string(), "connectionretry");
        assert_eq!(EventKind::ConnectionTimeout.to_string(), "connectiontimeout");
        assert_eq!(EventKind::Open.to_string(), "open");
    }

    #[test]
    fn every_kind_has_its_own_bit() {
        let mut seen = EventMask::NONE;
        for kind in EventKind::ALL {
            let bit = EventMask::from(kind);
            assert_eq!(bit.bits().count_ones(), 1, "{kind} should map to a single bit");
            assert!(!seen.intersects(bit), "{kind} bit is shared");
            seen |= bit;
        }
        assert_eq!(seen, EventMask::ALL);
        assert!(!EventMask::LIFECYCLE.contains(EventMask::MESSAGE));
    }

    #[test]
    fn slot_runs_before_listeners() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let emitter = Emitter::new();
        emitter.add_listener(EventMask::ALL, recorder(&log, "listener"));
        emitter.set_slot(EventKind::Open, Some(recorder(&log, "slot")));

        emitter.emit(&Event::Open);

        assert_eq!(*log.lock().unwrap(), ["slot:open", "listener:open"]);
    }

    #[test]
    fn slot_is_replaced_and_cleared() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let emitter = Emitter::new();
        emitter.set_slot(EventKind::Reconnect, Some(recorder(&log, "first")));
        emitter.set_slot(EventKind::Reconnect, Some(recorder(&log, "second")));

        emitter.emit(&Event::Reconnect);
        emitter.set_slot(EventKind::Reconnect, None);
        emitter.emit(&Event::Reconnect);

        assert_eq!(*log.lock().unwrap(), ["second:reconnect"]);
    }

    #[test]
    fn listeners_filter_by_mask_and_can_be_removed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let emitter = Emitter::new();
        let lifecycle = emitter.add_listener(EventMask::LIFECYCLE, recorder(&log, "lifecycle"));
        emitter.add_listener(EventMask::MESSAGE, recorder(&log, "messages"));

        emitter.emit(&Event::Message(Payload::from("x")));
        emitter.emit(&Event::Open);
        assert!(emitter.remove_listener(lifecycle));
        assert!(!emitter.remove_listener(lifecycle));
        emitter.emit(&Event::Reconnect);

        assert_eq!(*log.lock().unwrap(), ["messages:message", "lifecycle:open"]);
    }

    #[test]
    fn callbacks_may_register_callbacks() {
        let emitter = Arc::new(Emitter::new());
        let inner = Arc::clone(&emitter);
        emitter.set_slot(
            EventKind::Open,
            Some(Arc::new(move |_: &Event| {
                inner.add_listener(EventMask::ALL, Arc::new(|_: &Event| {}));
            })),
        );

        emitter.emit(&Event::Open);

        assert_eq!(emitter.listeners.read().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stream_ends_after_terminal_event() {
        let emitter = Emitter::new();
        let stream = into_stream(emitter.subscribe());

        emitter.emit(&Event::Open);
        emitter.emit(&Event::Close(CloseEvent::new(close_code::NORMAL, "bye", true)));
        emitter.emit(&Event::Open);

        let kinds: Vec<EventKind> = stream
            .map(|event| event.unwrap().kind())
            .collect()
            .await;
        assert_eq!(kinds, [EventKind::Open, EventKind::Close]);
    }

    #[test]
    fn close_event_accessors() {
        let close = CloseEvent::new(close_code::NORMAL, "done", true);
        assert!(close.is_normal());
        assert!(!CloseEvent::abnormal().is_normal());

        let event = Event::ConnectionRetry(CloseEvent::abnormal());
        assert_eq!(event.close_event().map(|c| c.code), Some(close_code::ABNORMAL));
        assert!(Event::Open.close_event().is_none());
    }

    #[test]
    fn payload_views() {
        assert_eq!(Payload::from("abc").as_text(), Some("abc"));
        assert_eq!(Payload::from(vec![1_u8, 2]).as_text(), None);
        assert_eq!(Payload::from(vec![1_u8, 2]).as_bytes(), [1, 2]);
    }
}
