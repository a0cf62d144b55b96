//! The reconnection state machine.
//!
//! [`Machine`] owns the bookkeeping that survives across transports: the current
//! [`Status`], the count of consecutive failed attempts and whether a connection
//! ever succeeded. It performs no I/O; the connection driver feeds it transport
//! signals and acts on what it returns.

use serde_repr::Serialize_repr;

use crate::transport::close_code;

/// Externally observable lifecycle phase of a reconnecting connection.
#[non_exhaustive]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, strum_macros::Display)]
pub enum Status {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
    Reconnecting = 4,
}

impl Status {
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// How an `opened` signal is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opened {
    First,
    Reconnected,
}

/// What a `closed` signal resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    /// Clean or caller-requested closure. Terminal.
    Graceful,
    /// Schedule another attempt.
    Retry {
        /// Whether this closure ended an established connection
        disconnect: bool,
        attempt: u32,
    },
    /// The attempt budget is spent. Terminal.
    Exhausted { attempts: u32 },
}

/// What a caller's `close()` requires of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseRequest {
    /// Ask the bound transport to close with code 1000.
    Terminate,
    /// The transport is not open yet and is left alone; its `closed` signal
    /// resolves to `close`, and if it opens first the close is carried out then.
    Defer,
    /// No transport is live; stop the pending retry and report the closure directly.
    CancelRetry,
    /// Already closing or closed.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct Machine {
    status: Status,
    attempt_number: u32,
    has_connected_once: bool,
    max_attempts: Option<u32>,
    /// `close()` arrived while connecting
    close_pending: bool,
}

impl Machine {
    #[must_use]
    pub const fn new(max_attempts: Option<u32>) -> Self {
        Self {
            status: Status::Connecting,
            attempt_number: 0,
            has_connected_once: false,
            max_attempts,
            close_pending: false,
        }
    }

    #[must_use]
    pub const fn status(&self) -> Status {
        self.status
    }

    #[must_use]
    pub const fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    #[must_use]
    pub const fn has_connected_once(&self) -> bool {
        self.has_connected_once
    }

    pub fn opened(&mut self) -> Opened {
        let opened = if self.status == Status::Connecting || !self.has_connected_once {
            Opened::First
        } else {
            Opened::Reconnected
        };

        self.has_connected_once = true;
        self.status = Status::Open;
        self.attempt_number = 0;

        opened
    }

    /// Take a close deferred while connecting, moving an open connection to Closing.
    ///
    /// Returns whether the driver must now ask the transport to close.
    pub fn take_pending_close(&mut self) -> bool {
        if !self.close_pending || self.status != Status::Open {
            return false;
        }

        self.close_pending = false;
        self.status = Status::Closing;
        true
    }

    pub fn closed(&mut self, code: u16) -> Closure {
        self.close_pending = false;
        self.attempt_number = self.attempt_number.saturating_add(1);

        if code == close_code::NORMAL || self.status == Status::Closing {
            self.status = Status::Closed;
            return Closure::Graceful;
        }

        // The budget counts retries, so `max` retries are scheduled before giving up.
        if self
            .max_attempts
            .is_none_or(|max| self.attempt_number <= max)
        {
            self.status = Status::Reconnecting;
            Closure::Retry {
                disconnect: self.attempt_number == 1 && self.has_connected_once,
                attempt: self.attempt_number,
            }
        } else {
            self.status = Status::Closed;
            Closure::Exhausted {
                attempts: self.attempt_number,
            }
        }
    }

    pub fn request_close(&mut self) -> CloseRequest {
        match self.status {
            Status::Open => {
                self.status = Status::Closing;
                CloseRequest::Terminate
            }
            Status::Connecting => {
                self.status = Status::Closing;
                self.close_pending = true;
                CloseRequest::Defer
            }
            Status::Reconnecting => {
                self.status = Status::Closed;
                CloseRequest::CancelRetry
            }
            Status::Closing | Status::Closed => CloseRequest::Ignore,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABNORMAL: u16 = close_code::ABNORMAL;
    const NORMAL: u16 = close_code::NORMAL;

    #[test]
    fn starts_connecting() {
        let machine = Machine::new(None);

        assert_eq!(machine.status(), Status::Connecting);
        assert_eq!(machine.attempt_number(), 0);
        assert!(!machine.has_connected_once());
    }

    #[test]
    fn attempts_exhaust_after_budget() {
        let mut machine = Machine::new(Some(2));

        assert_eq!(
            machine.closed(ABNORMAL),
            Closure::Retry {
                disconnect: false,
                attempt: 1
            }
        );
        assert_eq!(machine.status(), Status::Reconnecting);
        assert_eq!(
            machine.closed(ABNORMAL),
            Closure::Retry {
                disconnect: false,
                attempt: 2
            }
        );
        assert_eq!(
            machine.closed(ABNORMAL),
            Closure::Exhausted { attempts: 3 }
        );
        assert_eq!(machine.status(), Status::Closed);
    }

    #[test]
    fn zero_budget_never_retries() {
        let mut machine = Machine::new(Some(0));

        assert_eq!(
            machine.closed(ABNORMAL),
            Closure::Exhausted { attempts: 1 }
        );
    }

    #[test]
    fn unbounded_budget_keeps_retrying() {
        let mut machine = Machine::new(None);

        for attempt in 1..=1000 {
            assert_eq!(
                machine.closed(ABNORMAL),
                Closure::Retry {
                    disconnect: false,
                    attempt
                }
            );
        }
        assert_eq!(machine.status(), Status::Reconnecting);
    }

    #[test]
    fn normal_close_is_graceful_regardless_of_attempts() {
        for max in [None, Some(0), Some(1), Some(5)] {
            let mut machine = Machine::new(max);
            machine.opened();

            assert_eq!(machine.closed(NORMAL), Closure::Graceful, "max = {max:?}");
            assert_eq!(machine.status(), Status::Closed);
        }
    }

    #[test]
    fn open_then_reconnect() {
        let mut machine = Machine::new(None);

        assert_eq!(machine.opened(), Opened::First);
        assert_eq!(
            machine.closed(ABNORMAL),
            Closure::Retry {
                disconnect: true,
                attempt: 1
            }
        );
        assert_eq!(machine.opened(), Opened::Reconnected);
        assert_eq!(machine.attempt_number(), 0);
        assert_eq!(machine.status(), Status::Open);
    }

    #[test]
    fn disconnect_fires_once_per_episode() {
        let mut machine = Machine::new(None);
        machine.opened();

        let disconnects = (0..5)
            .filter(|_| matches!(machine.closed(ABNORMAL), Closure::Retry { disconnect: true, .. }))
            .count();
        assert_eq!(disconnects, 1);

        machine.opened();
        assert!(matches!(
            machine.closed(ABNORMAL),
            Closure::Retry {
                disconnect: true,
                ..
            }
        ));
    }

    #[test]
    fn failed_first_connect_is_not_a_disconnect() {
        let mut machine = Machine::new(None);

        assert!(matches!(
            machine.closed(ABNORMAL),
            Closure::Retry {
                disconnect: false,
                ..
            }
        ));
        assert_eq!(machine.opened(), Opened::First);
    }

    #[test]
    fn close_while_open_wins_over_abnormal_code() {
        let mut machine = Machine::new(None);
        machine.opened();

        assert_eq!(machine.request_close(), CloseRequest::Terminate);
        assert_eq!(machine.status(), Status::Closing);
        assert_eq!(machine.closed(ABNORMAL), Closure::Graceful);
        assert_eq!(machine.status(), Status::Closed);
    }

    #[test]
    fn close_while_reconnecting_cancels() {
        let mut machine = Machine::new(None);
        machine.opened();
        machine.closed(ABNORMAL);

        assert_eq!(machine.request_close(), CloseRequest::CancelRetry);
        assert_eq!(machine.status(), Status::Closed);
        assert_eq!(machine.request_close(), CloseRequest::Ignore);
    }

    #[test]
    fn close_while_connecting_is_deferred() {
        let mut machine = Machine::new(None);

        assert_eq!(machine.request_close(), CloseRequest::Defer);
        assert_eq!(machine.status(), Status::Closing);
        assert_eq!(machine.request_close(), CloseRequest::Ignore);
        assert_eq!(machine.closed(ABNORMAL), Closure::Graceful);
        assert!(!machine.take_pending_close());
    }

    #[test]
    fn deferred_close_applies_once_open() {
        let mut machine = Machine::new(None);
        machine.request_close();

        assert_eq!(machine.opened(), Opened::First);
        assert_eq!(machine.status(), Status::Open);
        assert!(machine.take_pending_close());
        assert_eq!(machine.status(), Status::Closing);
        assert!(!machine.take_pending_close());
        assert_eq!(machine.closed(ABNORMAL), Closure::Graceful);
    }

    #[test]
    fn no_pending_close_without_request() {
        let mut machine = Machine::new(None);
        machine.opened();

        assert!(!machine.take_pending_close());
        assert_eq!(machine.status(), Status::Open);
    }

    #[test]
    fn status_values_match_ready_states() {
        assert_eq!(Status::Connecting as u8, 0);
        assert_eq!(Status::Open as u8, 1);
        assert_eq!(Status::Closing as u8, 2);
        assert_eq!(Status::Closed as u8, 3);
        assert_eq!(Status::Reconnecting as u8, 4);
        assert_eq!(serde_json::to_string(&Status::Reconnecting).unwrap(), "4");
    }
}
