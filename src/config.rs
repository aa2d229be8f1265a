//! Client configuration.
//!
//! All knobs are fixed at construction; the client never mutates its
//! configuration afterwards.

use std::time::Duration;

use crate::errors::{ClientError, Result};
use crate::types::Endpoint;

/// Client configuration options.
///
/// Built with [`ClientConfig::new`] plus the `with_*` setters, then validated
/// once by [`Client::new`](crate::Client::new).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Ordered list of tracker endpoints. Trackers are tried in this order
    /// (starting from a rotating cursor) when one refuses connections.
    pub trackers: Vec<Endpoint>,
    /// Text encoding for string fields. Only UTF-8 is supported.
    pub charset: String,
    /// Deadline for establishing a TCP connection.
    pub connect_timeout: Duration,
    /// Deadline for a single read from a server.
    pub read_timeout: Duration,
    /// Deadline for a single write to a server.
    pub write_timeout: Duration,
    /// How long an acquire may wait for a free connection before failing
    /// with [`ClientError::PoolExhausted`].
    pub acquire_timeout: Duration,
    /// Maximum idle connections kept per endpoint.
    pub max_idle_per_pool: usize,
    /// Maximum live (idle + in-use) connections per endpoint.
    pub max_total_per_pool: usize,
    /// Idle connections older than this are evicted.
    pub idle_timeout: Duration,
    /// Whether connect failures are retried before giving up.
    pub enable_reconnect: bool,
    /// Maximum number of reconnect attempts after the initial one.
    pub max_reconnect: u32,
    /// Pause between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Whether `TCP_NODELAY` is set on new connections.
    pub tcp_nodelay: bool,
    /// Write high-water mark: upper bound on bytes buffered per write, also
    /// applied as the socket send-buffer size.
    pub write_high_water: usize,
    /// Write low-water mark. Must not exceed the high-water mark.
    pub write_low_water: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            trackers: Vec::new(),
            charset: "UTF-8".to_string(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(5),
            max_idle_per_pool: 8,
            max_total_per_pool: 32,
            idle_timeout: Duration::from_secs(60),
            enable_reconnect: false,
            max_reconnect: 3,
            reconnect_interval: Duration::from_millis(500),
            tcp_nodelay: true,
            write_high_water: 64 * 1024,
            write_low_water: 16 * 1024,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration with the given tracker endpoints and default
    /// settings for everything else.
    pub fn new(trackers: Vec<Endpoint>) -> Self {
        Self {
            trackers,
            ..Default::default()
        }
    }

    /// Parses `"host:port"` strings into tracker endpoints.
    pub fn from_tracker_addrs<I, S>(addrs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let trackers = addrs
            .into_iter()
            .map(|a| a.as_ref().parse())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(trackers))
    }

    pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_max_idle_per_pool(mut self, n: usize) -> Self {
        self.max_idle_per_pool = n;
        self
    }

    pub fn with_max_total_per_pool(mut self, n: usize) -> Self {
        self.max_total_per_pool = n;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, max_attempts: u32, interval: Duration) -> Self {
        self.enable_reconnect = true;
        self.max_reconnect = max_attempts;
        self.reconnect_interval = interval;
        self
    }

    pub fn with_tcp_nodelay(mut self, on: bool) -> Self {
        self.tcp_nodelay = on;
        self
    }

    pub fn with_write_watermarks(mut self, low: usize, high: usize) -> Self {
        self.write_low_water = low;
        self.write_high_water = high;
        self
    }

    /// Checks the configuration for contradictions. Called once at client
    /// construction; failures are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.trackers.is_empty() {
            return Err(ClientError::Config(
                "at least one tracker endpoint is required".to_string(),
            ));
        }
        if !self.charset.eq_ignore_ascii_case("utf-8") {
            return Err(ClientError::Config(format!(
                "unsupported charset {:?} (only UTF-8 is available)",
                self.charset
            )));
        }
        if self.max_total_per_pool == 0 {
            return Err(ClientError::Config(
                "max_total_per_pool must be at least 1".to_string(),
            ));
        }
        if self.max_idle_per_pool > self.max_total_per_pool {
            return Err(ClientError::Config(
                "max_idle_per_pool cannot exceed max_total_per_pool".to_string(),
            ));
        }
        if self.write_high_water == 0 || self.write_low_water > self.write_high_water {
            return Err(ClientError::Config(
                "write watermarks must satisfy 0 < low <= high".to_string(),
            ));
        }
        Ok(())
    }
}
