//! Client configuration.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    error::{TransportError, TransportResult},
    reconnect::Backoff,
};

/// WebSocket URL scheme. Always explicit, never guessed from the host name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Plain-text WebSocket.
    Ws,
    /// WebSocket over TLS.
    Wss,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }
}

/// One candidate WebSocket endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    "/ws".to_string()
}

impl Endpoint {
    /// Create an endpoint with the default `/ws` path.
    pub fn new(scheme: Scheme, host: impl Into<String>) -> Self {
        Self {
            scheme,
            host: host.into(),
            port: None,
            path: default_path(),
        }
    }

    /// Set the port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the request path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Parse an endpoint from a full `ws://` or `wss://` URL.
    pub fn parse(url: &str) -> TransportResult<Self> {
        let parsed =
            Url::parse(url).map_err(|e| TransportError::config(format!("Invalid URL {url}: {e}")))?;
        let scheme = match parsed.scheme() {
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            other => {
                return Err(TransportError::config(format!(
                    "Unsupported URL scheme: {other}"
                )));
            }
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| TransportError::config(format!("URL has no host: {url}")))?;

        let mut path = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port: parsed.port(),
            path,
        })
    }

    /// Full URL for this endpoint.
    pub fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        match self.port {
            Some(port) => format!("{}://{}:{}{}", self.scheme.as_str(), self.host, port, path),
            None => format!("{}://{}{}", self.scheme.as_str(), self.host, path),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Outbound batching settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// When false every send is transmitted directly.
    pub enabled: bool,
    /// Batch delay for normal priority; high uses half, low uses double.
    pub base_delay: Duration,
    /// A batch flushes as soon as it holds this many messages.
    pub max_batch_size: usize,
    /// Whether large batches are deflate-compressed.
    pub compression: bool,
    /// Minimum batch length eligible for compression.
    pub compression_threshold: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: Duration::from_millis(50),
            max_batch_size: 10,
            compression: true,
            compression_threshold: 5,
        }
    }
}

impl BatchConfig {
    /// Enable or disable batching.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the base batch delay.
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum batch size.
    #[must_use]
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Enable or disable compression.
    #[must_use]
    pub fn compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    /// Set the compression threshold.
    #[must_use]
    pub fn compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }
}

/// Configuration for [`RealtimeClient`](crate::RealtimeClient).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    // Endpoints
    /// Candidate endpoints, tried in order. The first is the primary.
    pub endpoints: Vec<Endpoint>,
    /// How long each candidate may take to open before it is abandoned.
    pub probe_timeout: Duration,

    // Reconnection settings
    /// Delay before the first reconnection attempt.
    pub reconnect_base_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub reconnect_max_delay: Duration,
    /// Backoff multiplier for reconnection delays.
    pub reconnect_backoff_factor: f64,
    /// Random jitter factor (0.0-1.0) for reconnection delays.
    pub reconnect_jitter: f64,
    /// Number of automatic retries before the client gives up.
    pub max_reconnect_attempts: u32,

    // Delivery
    /// Capacity of the pending outbound queue.
    pub max_pending_messages: usize,
    /// Capacity of each processed-id tracker.
    pub max_processed_ids: usize,
    /// Share of the tracker evicted in one pass on overflow.
    pub processed_ids_eviction_ratio: f64,
    /// Inbound frames larger than this are dropped.
    pub max_message_size: usize,

    /// Outbound batching.
    pub batch: BatchConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            probe_timeout: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_millis(1000),
            reconnect_max_delay: Duration::from_millis(30_000),
            reconnect_backoff_factor: 2.0,
            reconnect_jitter: 0.0,
            max_reconnect_attempts: 5,
            max_pending_messages: 100,
            max_processed_ids: 1000,
            processed_ids_eviction_ratio: 0.2,
            max_message_size: 1024 * 1024, // 1 MiB
            batch: BatchConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a new configuration with the given primary endpoint.
    pub fn new(primary: Endpoint) -> Self {
        Self {
            endpoints: vec![primary],
            ..Default::default()
        }
    }

    /// Append a fallback endpoint.
    #[must_use]
    pub fn fallback(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Set the per-endpoint probe timeout.
    #[must_use]
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the reconnection base delay.
    #[must_use]
    pub fn reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay = delay;
        self
    }

    /// Set the maximum reconnection delay.
    #[must_use]
    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = delay;
        self
    }

    /// Set the reconnection jitter.
    #[must_use]
    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Set the maximum reconnection attempts.
    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the pending queue capacity.
    #[must_use]
    pub fn max_pending_messages(mut self, max: usize) -> Self {
        self.max_pending_messages = max;
        self
    }

    /// Set the processed-id tracker capacity.
    #[must_use]
    pub fn max_processed_ids(mut self, max: usize) -> Self {
        self.max_processed_ids = max;
        self
    }

    /// Set the maximum inbound frame size.
    #[must_use]
    pub fn max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Replace the batching configuration.
    #[must_use]
    pub fn batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoints.is_empty() {
            return Err("At least one endpoint is required".to_string());
        }
        if self.endpoints.iter().any(|e| e.host.is_empty()) {
            return Err("Endpoint host cannot be empty".to_string());
        }
        if self.probe_timeout.is_zero() {
            return Err("Probe timeout must be > 0".to_string());
        }
        Backoff::from_config(self).validate()?;
        if self.max_pending_messages == 0 {
            return Err("Max pending messages must be > 0".to_string());
        }
        if self.max_processed_ids == 0 {
            return Err("Max processed ids must be > 0".to_string());
        }
        if !(self.processed_ids_eviction_ratio > 0.0 && self.processed_ids_eviction_ratio <= 1.0) {
            return Err("Eviction ratio must be in (0.0, 1.0]".to_string());
        }
        if self.batch.enabled {
            if self.batch.base_delay.is_zero() {
                return Err("Batch delay must be > 0".to_string());
            }
            if self.batch.max_batch_size == 0 {
                return Err("Max batch size must be > 0".to_string());
            }
        }
        Ok(())
    }
}
