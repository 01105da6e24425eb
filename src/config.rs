//! Runtime configuration.
//!
//! Every section deserialises from JSON with defaults for missing fields, so
//! a config file only names what it changes:
//!
//! ```ignore
//! let config = CourierConfig::from_json_str(r#"{
//!     "dispatcher": { "ack_timeout_ms": 500 },
//!     "transport": { "inbound": ["orders.OrderPlaced"] }
//! }"#)?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for one [`QueuedHandler`](crate::QueuedHandler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Drop an item that is the same allocation as the one just handled.
    pub idempotent: bool,
    /// Processing time above which a consumer is reported as slow.
    pub slow_threshold_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            idempotent: false,
            slow_threshold_ms: 1_000,
        }
    }
}

impl QueueConfig {
    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold_ms = threshold.as_millis() as u64;
        self
    }

    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_threshold_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub ack_timeout_ms: u64,
    /// Measured from the moment the ack is observed.
    pub response_timeout_ms: u64,
    /// Queue settings for every per-command-type handler queue.
    pub handler_queue: QueueConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 2_000,
            response_timeout_ms: 10_000,
            handler_queue: QueueConfig::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_handler_queue(mut self, queue: QueueConfig) -> Self {
        self.handler_queue = queue;
        self
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Exponential reconnect backoff for the TCP client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub delay_initial_ms: u64,
    pub delay_max_ms: u64,
    pub factor: f64,
    pub jitter_ms: u64,
    /// First reconnect attempt happens without delay.
    pub immediate_first: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            delay_initial_ms: 100,
            delay_max_ms: 5_000,
            factor: 2.0,
            jitter_ms: 100,
            immediate_first: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// `host:port` to bind (server) or connect to (client).
    pub address: String,
    /// Type names forwarded from the peer into the local bus. A name also
    /// admits every registered descendant.
    pub inbound: Vec<String>,
    /// Type names sent from the local bus to the peer.
    pub outbound: Vec<String>,
    pub read_buffer_size: usize,
    pub max_frame_len: usize,
    pub connect_timeout_ms: u64,
    pub backoff: BackoffConfig,
    /// Queue settings for each connection's inbound and outbound queue.
    pub queue: QueueConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:0".to_string(),
            inbound: Vec::new(),
            outbound: Vec::new(),
            read_buffer_size: 8 * 1024,
            max_frame_len: 16 * 1024 * 1024,
            connect_timeout_ms: 1_000,
            backoff: BackoffConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn with_inbound<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inbound = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outbound<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outbound = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub dispatcher: DispatcherConfig,
    pub transport: TransportConfig,
}

impl CourierConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
