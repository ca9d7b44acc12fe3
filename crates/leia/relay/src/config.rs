//! Relay configuration

use std::time::Duration;

/// Default vpcd port
pub const DEFAULT_PORT: u16 = 0x8C7B;

/// Default vpcd host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Configuration of the relay worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Host running the virtual reader service
    pub host: String,
    /// Port of the virtual reader service
    pub port: u16,
    /// How often the stop and reconfiguration flags are checked while idle
    pub poll_interval: Duration,
    /// Timeout for reading the body of a request once its length arrived
    pub read_timeout: Duration,
    /// Pause between card presence checks while no card is inserted
    pub no_card_backoff: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            poll_interval: Duration::from_millis(100),
            read_timeout: Duration::from_secs(10),
            no_card_backoff: Duration::from_millis(500),
        }
    }
}

impl RelayConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the virtual reader host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the virtual reader port
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the idle polling interval
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the request body timeout
    pub const fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the backoff used while no card is inserted
    pub const fn with_no_card_backoff(mut self, backoff: Duration) -> Self {
        self.no_card_backoff = backoff;
        self
    }

    /// `host:port` of the virtual reader service
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
