//! Error types surfaced by the TCP core.
//!
//! [`TcpError`] covers the user-facing operations on an endpoint;
//! [`SegmentError`] covers failures to decode an incoming segment. Parse
//! failures never reach the user: the dispatch path drops the offending
//! datagram, replying with a reset only where RFC 793 requires one.

/// An error returned by an operation on a [`TcpEndpoint`](crate::TcpEndpoint)
/// or by the [`EndpointManager`](crate::EndpointManager).
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    #[error("The endpoint is not connected")]
    NotConnected,
    #[error("The endpoint is already connected")]
    AlreadyConnected,
    #[error("The connection attempt is still in progress")]
    ConnectionInProgress,
    #[error("A destination address is required")]
    DestinationRequired,
    #[error("The connection has been shut down for writing")]
    BrokenPipe,
    #[error("The address is already in use")]
    AddressInUse,
    #[error("The address family is not supported")]
    AddressFamilyUnsupported,
    #[error("No route to the destination network")]
    NetworkUnreachable,
    #[error("The operation requires privileges the caller does not hold")]
    PermissionDenied,
    #[error("The peer refused the connection")]
    ConnectionRefused,
    #[error("The connection was reset by the peer")]
    ConnectionReset,
    #[error("The connection was aborted")]
    ConnectionAborted,
    #[error("The operation timed out")]
    TimedOut,
    #[error("The operation would block")]
    WouldBlock,
    #[error("The operation was interrupted")]
    Interrupted,
    #[error("Invalid argument")]
    Invalid,
    #[error("No buffer space available")]
    NoBufferSpace,
}

/// A failure to decode an incoming TCP segment.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum SegmentError {
    #[error("The segment is shorter than the fixed TCP header")]
    HeaderTooShort,
    #[error("The data offset field points outside the segment")]
    BadDataOffset,
    #[error("Expected the checksum {expected:#06x} but computed {actual:#06x}")]
    InvalidChecksum { expected: u16, actual: u16 },
}
