//! Per-socket configuration.

use std::time::Duration;

/// The knobs a socket layer would set on an endpoint before or while using
/// it. Timeouts of `None` block forever; a zero timeout makes the operation
/// non-blocking.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Soft cap of the send queue in bytes.
    pub send_buffer_size: usize,
    /// Soft cap of the receive queue in bytes.
    pub receive_buffer_size: usize,
    /// `send_data` blocks until at least this much queue space is free.
    pub send_low_water_mark: usize,
    /// `read_data` blocks until at least this many bytes are deliverable.
    pub receive_low_water_mark: usize,
    /// Timeout for blocking sends (and `connect`).
    pub send_timeout: Option<Duration>,
    /// Timeout for blocking reads (and `accept`).
    pub receive_timeout: Option<Duration>,
    /// When set, `close` waits this long for queued data to be acknowledged.
    pub linger: Option<Duration>,
    /// SO_REUSEADDR: relax the bind collision rules.
    pub reuse_address: bool,
    /// TCP_NODELAY: disable Nagle's algorithm.
    pub no_delay: bool,
    /// TCP_NOOPT: do not emit TCP options.
    pub no_options: bool,
    /// Whether the caller may bind reserved ports (below 1024).
    pub privileged: bool,
    /// Make waiting for connection establishment fail as soon as the state
    /// machine falls back to CLOSED, instead of relying on the latched
    /// socket error to break the wait.
    pub strict_wait_for_established: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: 32768,
            receive_buffer_size: 65536,
            send_low_water_mark: 2048,
            receive_low_water_mark: 1,
            send_timeout: None,
            receive_timeout: None,
            linger: None,
            reuse_address: false,
            no_delay: false,
            no_options: false,
            privileged: false,
            strict_wait_for_established: false,
        }
    }
}

impl SocketConfig {
    /// A configuration whose blocking operations fail immediately with
    /// `WouldBlock` instead of waiting.
    pub fn non_blocking() -> Self {
        Self {
            send_timeout: Some(Duration::ZERO),
            receive_timeout: Some(Duration::ZERO),
            ..Self::default()
        }
    }
}
