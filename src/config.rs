use std::time::Duration;

use backoff::backoff::Constant;
use bon::Builder;
use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};

const DEFAULT_RECONNECT_INTERVAL_DURATION: Duration = Duration::from_millis(1000);

/// Configuration for a connection and its reconnection behavior.
///
/// Deserializes from the camel-cased option names used on the wire, e.g.
/// `{"reconnect": true, "reconnectIntervalMs": 250, "maxReconnectAttempts": 5}`.
#[serde_as]
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Builder, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Whether to reconnect at all. When `false` only a plain connection is created.
    #[builder(default = true)]
    pub reconnect: bool,
    /// Fixed wait between an unintentional close and the next attempt
    #[serde(rename = "reconnectIntervalMs")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[builder(default = DEFAULT_RECONNECT_INTERVAL_DURATION)]
    pub reconnect_interval: Duration,
    /// Maximum number of consecutive attempts before giving up.
    /// `None` means infinite retries.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reconnect: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL_DURATION,
            max_reconnect_attempts: None, // Infinite reconnection by default
        }
    }
}

impl From<&Config> for Constant {
    fn from(config: &Config) -> Self {
        Constant::new(config.reconnect_interval)
    }
}
