//! An RFC 793 TCP endpoint core.
//!
//! This crate implements the connection-level heart of a TCP stack: the
//! per-connection state machine with reassembly and retransmission queues,
//! Reno congestion control, and the demultiplexer that maps incoming
//! segments to endpoints. It deliberately stops at narrow interfaces on
//! both sides — IP routing and datagram output are behind [`Router`], and
//! socket-layer readiness is behind [`SocketEvents`] — so it can sit under
//! any socket façade and over any datagram transport.
//!
//! # Organization
//!
//! - [`Seq`] and [`Message`] are the basic currencies: modular sequence
//!   numbers and chunked byte buffers.
//! - [`SegmentHeader`](segment::SegmentHeader) encodes and decodes the wire
//!   format, options included.
//! - [`BufferQueue`] stores sequence-addressed byte ranges for both the
//!   receive (reassembly) and send (retransmission) directions.
//! - [`TcpEndpoint`] is one connection: state machine, timers, congestion
//!   control, and the blocking user operations.
//! - [`EndpointManager`] and [`TcpStack`] tie endpoints to address pairs,
//!   allocate ports, dispatch inbound segments, and answer stray traffic
//!   with resets.
//!
//! # Concurrency
//!
//! The core is parallel-threaded: receiver threads, timer callbacks, and
//! user calls may all enter it at once. Each endpoint serializes its state
//! behind one mutex and blocks with condition variables; the manager's
//! tables sit behind a readers-writer lock that is never held while an
//! endpoint lock is taken.

use std::time::Duration;

pub mod buffer_queue;
pub mod config;
pub mod endpoint;
pub mod errors;
pub mod manager;
pub mod message;
pub mod segment;
pub mod seq;
pub mod timer;

pub use buffer_queue::BufferQueue;
pub use config::SocketConfig;
pub use endpoint::{
    EndpointInfo, ReadFlags, SendFlags, Shutdown, SocketEvents, State, TcpEndpoint,
};
pub use errors::{SegmentError, TcpError};
pub use manager::{EndpointManager, Family, Route, Router, TcpStack};
pub use message::Message;
pub use seq::Seq;

/// The fallback maximum segment size when the peer advertises none.
pub const DEFAULT_MAX_SEGMENT_SIZE: u32 = 536;

/// The largest window expressible without window scaling.
pub const MAX_WINDOW: u32 = 65_535;

/// The largest window shift we advertise or accept.
pub const MAX_WINDOW_SHIFT: u8 = 14;

/// TCP's protocol number in the IP header.
pub const PROTOCOL_NUMBER: u8 = 6;

/// Ephemeral port allocation starts here.
pub const FIRST_EPHEMERAL_PORT: u16 = 40_000;

/// Ports up to this one need a privileged caller.
pub const LAST_RESERVED_PORT: u16 = 1_023;

/// How long a `connect` keeps trying before giving up.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(75);

/// How long an ACK may be delayed for coalescing.
pub const DELAYED_ACKNOWLEDGE_TIMEOUT: Duration = Duration::from_millis(100);

/// The interval between zero-window probes.
pub const PERSIST_TIMEOUT: Duration = Duration::from_secs(1);

/// The maximum segment lifetime; TIME_WAIT lasts twice this.
pub const MAX_SEGMENT_LIFETIME: Duration = Duration::from_secs(60);

/// The lower bound of the retransmission timeout (leaves room for delayed
/// ACKs at the peer).
pub const MIN_RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(200);

/// The upper bound of the retransmission timeout, per RFC 6298.
pub const MAX_RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(60);

/// The retransmission timeout while the SYN is being retransmitted, per
/// RFC 6298.
pub const SYN_RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(1);

/// The retransmission timeout before the first round-trip sample.
pub const INITIAL_RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(3);

#[cfg(test)]
mod tests;
