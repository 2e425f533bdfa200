//! Tunables for clients and servers.
//!
//! Defaults mirror the crate's fixed-by-design constants: a 2 MiB receive
//! buffer, a 3 second connect timeout, a 1 second reconnect interval, and a
//! ~1 ms write backoff capped at 3000 retries per stall. Use the builders for
//! anything else.

use std::time::Duration;

pub const DEFAULT_BUFFER_SIZE: usize = 2 * 1024 * 1024;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(1);
pub const DEFAULT_SEND_RETRY_LIMIT: usize = 3000;
pub const DEFAULT_BACKLOG: u32 = 512;

/// Configuration for a TCP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Capacity of the receive buffer drained per breathe call.
    pub buffer_size: usize,
    /// How long a non-immediate connect may wait for writability.
    pub connect_timeout: Duration,
    /// Pause between reconnect attempts while disconnected.
    pub reconnect_interval: Duration,
    /// Backoff between write retries on a full send buffer.
    pub retry_backoff: Duration,
    /// Write retries per stall before a send reports backpressure.
    pub send_retry_limit: usize,
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            send_retry_limit: DEFAULT_SEND_RETRY_LIMIT,
        }
    }
}

/// Builder for [`ClientConfig`]; unset fields fall back to the defaults.
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    buffer_size: Option<usize>,
    connect_timeout: Option<Duration>,
    reconnect_interval: Option<Duration>,
    retry_backoff: Option<Duration>,
    send_retry_limit: Option<usize>,
}

impl ClientConfigBuilder {
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = Some(interval);
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    pub fn send_retry_limit(mut self, limit: usize) -> Self {
        self.send_retry_limit = Some(limit);
        self
    }

    pub fn build(self) -> ClientConfig {
        let default = ClientConfig::default();
        ClientConfig {
            buffer_size: self.buffer_size.unwrap_or(default.buffer_size).max(1),
            connect_timeout: self.connect_timeout.unwrap_or(default.connect_timeout),
            reconnect_interval: self
                .reconnect_interval
                .unwrap_or(default.reconnect_interval),
            retry_backoff: self.retry_backoff.unwrap_or(default.retry_backoff),
            send_retry_limit: self.send_retry_limit.unwrap_or(default.send_retry_limit),
        }
    }
}

/// Configuration for a TCP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Capacity of the shared receive buffer reused per drained peer.
    pub buffer_size: usize,
    /// Listen backlog.
    pub backlog: u32,
    /// Hard cap on concurrent connections; `None` means unlimited.
    pub max_connections: Option<usize>,
    /// Apply `TCP_NODELAY` to accepted sockets.
    pub no_delay: bool,
    /// Backoff between write retries on a full send buffer.
    pub retry_backoff: Duration,
    /// Write retries per stall before a send reports backpressure.
    pub send_retry_limit: usize,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            backlog: DEFAULT_BACKLOG,
            max_connections: None,
            no_delay: true,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            send_retry_limit: DEFAULT_SEND_RETRY_LIMIT,
        }
    }
}

/// Builder for [`ServerConfig`]; unset fields fall back to the defaults.
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    buffer_size: Option<usize>,
    backlog: Option<u32>,
    max_connections: Option<usize>,
    no_delay: Option<bool>,
    retry_backoff: Option<Duration>,
    send_retry_limit: Option<usize>,
}

impl ServerConfigBuilder {
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    pub fn send_retry_limit(mut self, limit: usize) -> Self {
        self.send_retry_limit = Some(limit);
        self
    }

    pub fn build(self) -> ServerConfig {
        let default = ServerConfig::default();
        ServerConfig {
            buffer_size: self.buffer_size.unwrap_or(default.buffer_size).max(1),
            backlog: self.backlog.unwrap_or(default.backlog),
            max_connections: self.max_connections.or(default.max_connections),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            retry_backoff: self.retry_backoff.unwrap_or(default.retry_backoff),
            send_retry_limit: self.send_retry_limit.unwrap_or(default.send_retry_limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.buffer_size, 2 * 1024 * 1024);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.reconnect_interval, Duration::from_secs(1));
        assert_eq!(config.send_retry_limit, 3000);
    }

    #[test]
    fn server_builder_merges_defaults() {
        let config = ServerConfig::builder()
            .buffer_size(4096)
            .max_connections(100)
            .build();
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.max_connections, Some(100));
        assert_eq!(config.backlog, DEFAULT_BACKLOG);
        assert!(config.no_delay);
    }

    #[test]
    fn zero_buffer_is_clamped() {
        let config = ClientConfig::builder().buffer_size(0).build();
        assert_eq!(config.buffer_size, 1);
    }
}
