use std::{net::Ipv4Addr, time::Duration};

pub const DEFAULT_PORT: u16 = 12345;
pub const DEFAULT_BACKLOG: i32 = 16;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Tunables for [`TcpServer`](super::TcpServer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Address the listener binds to.
    pub address: Ipv4Addr,
    pub port: u16,
    pub backlog: i32,
    pub non_blocking: bool,
    /// Disable Nagle's algorithm on the listener and accepted sockets.
    pub no_delay: bool,
    /// Upper bound on a single poll; also bounds how long `stop` waits.
    pub poll_timeout: Duration,
    /// Size of the buffer used for each read in the transfer loop.
    pub read_buffer_size: usize,
    /// Packets the transfer loop may queue before it blocks on the process loop.
    pub inbound_queue_capacity: usize,
    /// Pause after a readiness event that yields no connection.
    pub accept_retry_delay: Duration,
    /// Pause after a listener error before polling again.
    pub accept_error_backoff: Duration,
    /// Pause when the transfer loop has no clients to poll.
    pub idle_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED,
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
            non_blocking: true,
            no_delay: true,
            poll_timeout: Duration::from_millis(100),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            inbound_queue_capacity: DEFAULT_INBOUND_QUEUE_CAPACITY,
            accept_retry_delay: Duration::from_millis(2),
            accept_error_backoff: Duration::from_millis(20),
            idle_delay: Duration::from_millis(10),
        }
    }
}

impl TransportConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn with_address(mut self, address: Ipv4Addr) -> Self {
        self.address = address;
        self
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    pub fn with_inbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.inbound_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_accept_retry_delay(mut self, delay: Duration) -> Self {
        self.accept_retry_delay = delay;
        self
    }

    pub fn with_accept_error_backoff(mut self, delay: Duration) -> Self {
        self.accept_error_backoff = delay;
        self
    }

    pub fn with_idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay;
        self
    }
}
