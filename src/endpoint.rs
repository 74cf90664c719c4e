//! The per-connection TCP endpoint.
//!
//! [`TcpEndpoint`] is the state machine of RFC 793 Figure 6 together with
//! everything a connection needs around it: the send and receive
//! [`BufferQueue`]s, the four timers, round-trip estimation, and Reno
//! congestion control (slow start, congestion avoidance, fast retransmit,
//! and fast recovery with limited transmit).
//!
//! Every endpoint is shared as `Arc<TcpEndpoint>`. All protocol state lives
//! under one mutex; the blocking entry points (`connect`, `accept`,
//! `send_data`, `read_data`, `close` with linger) drop that lock while they
//! wait on a condition variable with an absolute deadline. Timer callbacks
//! re-acquire the lock and bail out if they were canceled or overtaken in
//! the meantime.
//!
//! References:
//! - RFC 793 - Transmission Control Protocol
//! - RFC 813 - Window and Acknowledgement Strategy in TCP
//! - RFC 1323 - TCP Extensions for High Performance
//! - RFC 1337 - TIME_WAIT Assassination Hazards in TCP
//! - RFC 2581, RFC 3042 - congestion control, limited transmit
//! - RFC 6298 - retransmission timer computation

use crate::buffer_queue::BufferQueue;
use crate::config::SocketConfig;
use crate::errors::TcpError;
use crate::manager::{EndpointManager, Family, Route};
use crate::message::Message;
use crate::segment::{Control, SegmentAction, SegmentHeader, SegmentOptions};
use crate::seq::Seq;
use crate::timer::Timer;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

mod state;
pub use state::State;

mod accept;
use accept::AcceptQueue;

bitflags::bitflags! {
    /// Sticky per-endpoint condition flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct EndpointFlags: u16 {
        /// Window scaling was negotiated.
        const WINDOW_SCALE = 0x0001;
        /// Timestamps were negotiated.
        const TIMESTAMP = 0x0002;
        /// `shutdown(Read)` was called; inbound payload is discarded.
        const NO_RECEIVE = 0x0004;
        /// The owner released the endpoint; it only lingers for TIME_WAIT.
        const CLOSED = 0x0008;
        /// The endpoint may leave the manager's tables once also CLOSED.
        const DELETE_ON_CLOSE = 0x0010;
        /// The connection runs over a local (loopback) route.
        const LOCAL = 0x0020;
        /// Fast recovery is in progress.
        const RECOVERY = 0x0040;
    }
}

bitflags::bitflags! {
    /// Flags accepted by [`TcpEndpoint::read_data`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReadFlags: u8 {
        /// Clone data out of the receive queue instead of consuming it.
        const PEEK = 0x01;
        /// Never block; return `WouldBlock` when nothing is deliverable.
        const DONT_WAIT = 0x02;
        /// Block until the full requested amount can be returned.
        const WAIT_ALL = 0x04;
    }
}

bitflags::bitflags! {
    /// Flags accepted by [`TcpEndpoint::send_data`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SendFlags: u8 {
        /// Mark the end of the buffer as urgent data and push it out.
        const OOB = 0x01;
        /// Close the sending direction once the buffer is queued.
        const EOF = 0x02;
        /// Suppress SIGPIPE at the socket layer. The core reports
        /// `BrokenPipe` either way; the flag exists for the façade.
        const NO_SIGNAL = 0x04;
    }
}

/// Which direction(s) of the connection to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Read,
    Write,
    Both,
}

/// Readiness callbacks for a socket layer sitting on top of an endpoint.
/// All methods default to no-ops.
pub trait SocketEvents: Send + Sync {
    fn on_readable(&self, _available: usize) {}
    fn on_writable(&self, _free: usize) {}
    fn on_error(&self, _error: TcpError) {}
}

/// A point-in-time snapshot of an endpoint for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct EndpointInfo {
    pub state: State,
    pub local_address: SocketAddr,
    pub peer_address: SocketAddr,
    pub send_queued: usize,
    pub receive_available: usize,
    pub send_unacknowledged: Seq,
    pub send_next: Seq,
    pub send_max: Seq,
    pub receive_next: Seq,
    pub send_window: u32,
    pub congestion_window: u32,
    pub slow_start_threshold: u32,
    pub max_segment_size: u32,
    pub retransmit_timeout: Duration,
    pub duplicate_acknowledge_count: u32,
    pub in_recovery: bool,
}

/// The millisecond timestamp clock used for RFC 1323 timestamps and RTT
/// measurement. Only differences of this clock are meaningful.
fn tcp_now() -> u32 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    let origin = *ORIGIN.get_or_init(Instant::now);
    Instant::now().duration_since(origin).as_millis() as u32
}

fn tcp_diff_timestamp(base: u32) -> u32 {
    tcp_now().wrapping_sub(base)
}

/// Microseconds of wall-clock time, used to derive initial sequence numbers
/// and the ephemeral port step.
pub(crate) fn system_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

fn in_window(sequence: Seq, receive_next: Seq, receive_window: u32) -> bool {
    sequence >= receive_next && sequence < receive_next + receive_window
}

/// The RFC 793 segment acceptability test.
fn segment_in_sequence(
    segment: &SegmentHeader,
    size: usize,
    receive_next: Seq,
    receive_window: u32,
) -> bool {
    let sequence = segment.sequence;
    if size == 0 {
        if receive_window == 0 {
            sequence == receive_next
        } else {
            in_window(sequence, receive_next, receive_window)
        }
    } else if receive_window == 0 {
        false
    } else {
        in_window(sequence, receive_next, receive_window)
            || in_window(sequence + size as u32 - 1, receive_next, receive_window)
    }
}

struct Inner {
    state: State,
    flags: EndpointFlags,
    config: SocketConfig,
    route: Option<Route>,
    error: Option<TcpError>,

    send_unacknowledged: Seq,
    send_next: Seq,
    send_max: Seq,
    send_urgent_offset: Seq,
    send_window: u32,
    send_max_window: u32,
    send_max_segment_size: u32,
    send_max_segments: u32,
    send_queue: BufferQueue,
    last_acknowledge_sent: Seq,
    initial_send_sequence: Seq,
    previous_highest_acknowledge: Seq,
    duplicate_acknowledge_count: u32,
    previous_flight_size: u32,
    recover: Seq,
    send_window_shift: u8,
    receive_window_shift: u8,

    receive_next: Seq,
    receive_max_advertised: Seq,
    receive_window: u32,
    receive_max_segment_size: u32,
    receive_queue: BufferQueue,
    finish_received: bool,
    finish_received_at: Seq,
    initial_receive_sequence: Seq,

    smoothed_round_trip_time: i32,
    round_trip_variation: i32,
    send_time: u32,
    round_trip_start_sequence: Seq,
    retransmit_timeout: Duration,
    received_timestamp: u32,

    congestion_window: u32,
    slow_start_threshold: u32,

    accept_queue: Option<Arc<AcceptQueue>>,
    /// Set on endpoints spawned by a listener; they report to the parent's
    /// accept queue when established or aborted.
    spawned: bool,
    events: Option<Arc<dyn SocketEvents>>,
    interrupt_generation: u64,
}

impl Inner {
    fn new(config: SocketConfig) -> Self {
        Self {
            state: State::Closed,
            flags: EndpointFlags::WINDOW_SCALE | EndpointFlags::TIMESTAMP,
            route: None,
            error: None,
            send_unacknowledged: Seq::ZERO,
            send_next: Seq::ZERO,
            send_max: Seq::ZERO,
            send_urgent_offset: Seq::ZERO,
            send_window: 0,
            send_max_window: 0,
            send_max_segment_size: crate::DEFAULT_MAX_SEGMENT_SIZE,
            send_max_segments: 0,
            send_queue: BufferQueue::new(config.send_buffer_size),
            last_acknowledge_sent: Seq::ZERO,
            initial_send_sequence: Seq::ZERO,
            previous_highest_acknowledge: Seq::ZERO,
            duplicate_acknowledge_count: 0,
            previous_flight_size: 0,
            recover: Seq::ZERO,
            send_window_shift: 0,
            receive_window_shift: 0,
            receive_next: Seq::ZERO,
            receive_max_advertised: Seq::ZERO,
            receive_window: config.receive_buffer_size as u32,
            receive_max_segment_size: crate::DEFAULT_MAX_SEGMENT_SIZE,
            receive_queue: BufferQueue::new(config.receive_buffer_size),
            finish_received: false,
            finish_received_at: Seq::ZERO,
            initial_receive_sequence: Seq::ZERO,
            smoothed_round_trip_time: 0,
            round_trip_variation: 0,
            send_time: 0,
            round_trip_start_sequence: Seq::ZERO,
            retransmit_timeout: crate::INITIAL_RETRANSMIT_TIMEOUT,
            received_timestamp: 0,
            congestion_window: 0,
            slow_start_threshold: 0,
            accept_queue: None,
            spawned: false,
            events: None,
            interrupt_generation: 0,
            config,
        }
    }

    fn should_receive(&self) -> bool {
        if self.flags.contains(EndpointFlags::NO_RECEIVE) {
            return false;
        }
        matches!(
            self.state,
            State::Established | State::FinWait1 | State::FinWait2
        )
    }

    fn notify_reader(&self, receive_condition: &Condvar) {
        receive_condition.notify_all();
        if let Some(events) = &self.events {
            events.on_readable(self.receive_queue.available());
        }
    }
}

/// A TCP connection endpoint.
pub struct TcpEndpoint {
    manager: Arc<EndpointManager>,
    inner: Mutex<Inner>,
    receive_condition: Condvar,
    send_condition: Condvar,

    /// Local and peer addresses, separate from the main lock so the
    /// manager can inspect them during bind collision scans without
    /// acquiring endpoint locks. This is a leaf lock: never take another
    /// lock while holding it.
    addresses: Mutex<(SocketAddr, SocketAddr)>,
    /// Lock-free mirror of the state, for the same bind-scan purpose.
    state_hint: AtomicU8,
    /// Lock-free mirror of the LOCAL flag.
    local_hint: AtomicBool,

    retransmit_timer: Timer,
    persist_timer: Timer,
    delayed_acknowledge_timer: Timer,
    time_wait_timer: Timer,
}

impl TcpEndpoint {
    pub(crate) fn new(manager: Arc<EndpointManager>, config: SocketConfig) -> Arc<Self> {
        let unspecified = manager.family().unspecified();
        Arc::new_cyclic(|weak: &Weak<TcpEndpoint>| {
            let endpoint = weak.clone();
            let retransmit_timer = Timer::new("retransmit", move || {
                if let Some(endpoint) = endpoint.upgrade() {
                    endpoint.retransmit_timer_fired();
                }
            });
            let endpoint = weak.clone();
            let persist_timer = Timer::new("persist", move || {
                if let Some(endpoint) = endpoint.upgrade() {
                    endpoint.persist_timer_fired();
                }
            });
            let endpoint = weak.clone();
            let delayed_acknowledge_timer = Timer::new("delayed ack", move || {
                if let Some(endpoint) = endpoint.upgrade() {
                    endpoint.delayed_acknowledge_timer_fired();
                }
            });
            let endpoint = weak.clone();
            let time_wait_timer = Timer::new("time-wait", move || {
                if let Some(endpoint) = endpoint.upgrade() {
                    endpoint.time_wait_timer_fired();
                }
            });

            TcpEndpoint {
                manager,
                inner: Mutex::new(Inner::new(config)),
                receive_condition: Condvar::new(),
                send_condition: Condvar::new(),
                addresses: Mutex::new((unspecified, unspecified)),
                state_hint: AtomicU8::new(State::Closed as u8),
                local_hint: AtomicBool::new(false),
                retransmit_timer,
                persist_timer,
                delayed_acknowledge_timer,
                time_wait_timer,
            }
        })
    }

    // # Addresses and lock-free inspection

    pub fn local_address(&self) -> SocketAddr {
        self.addresses.lock().unwrap().0
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.addresses.lock().unwrap().1
    }

    pub(crate) fn set_local_address(&self, address: SocketAddr) {
        self.addresses.lock().unwrap().0 = address;
    }

    pub(crate) fn set_peer_address(&self, address: SocketAddr) {
        self.addresses.lock().unwrap().1 = address;
    }

    pub fn is_bound(&self) -> bool {
        let local = self.local_address();
        !local.ip().is_unspecified() || local.port() != 0
    }

    /// The current state, as last published by a transition. Usable without
    /// the endpoint lock; may be momentarily stale.
    pub(crate) fn state_hint(&self) -> State {
        State::from_u8(self.state_hint.load(Ordering::Acquire))
    }

    /// Whether the connection runs over a loopback route. Usable without
    /// the endpoint lock.
    pub fn is_local(&self) -> bool {
        self.local_hint.load(Ordering::Acquire)
    }

    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    /// The error a failed connection latched, if any. Mirrors the socket
    /// error a façade would report.
    pub fn error(&self) -> Option<TcpError> {
        self.inner.lock().unwrap().error
    }

    pub fn manager(&self) -> &Arc<EndpointManager> {
        &self.manager
    }

    fn set_state(&self, inner: &mut Inner, state: State) {
        if inner.state != state {
            tracing::debug!(from = %inner.state, to = %state, "state transition");
            inner.state = state;
            self.state_hint.store(state as u8, Ordering::Release);
        }
    }

    // # Configuration

    pub fn set_events(&self, events: Arc<dyn SocketEvents>) {
        self.inner.lock().unwrap().events = Some(events);
    }

    pub fn set_send_buffer_size(&self, size: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.config.send_buffer_size = size;
        inner.send_queue.set_max_bytes(size);
    }

    pub fn set_receive_buffer_size(&self, size: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.config.receive_buffer_size = size;
        inner.receive_queue.set_max_bytes(size);
    }

    pub fn set_no_delay(&self, no_delay: bool) {
        self.inner.lock().unwrap().config.no_delay = no_delay;
    }

    pub fn max_segment_size(&self) -> u32 {
        self.inner.lock().unwrap().receive_max_segment_size
    }

    pub fn info(&self) -> EndpointInfo {
        let inner = self.inner.lock().unwrap();
        EndpointInfo {
            state: inner.state,
            local_address: self.local_address(),
            peer_address: self.peer_address(),
            send_queued: inner.send_queue.used(),
            receive_available: inner.receive_queue.available(),
            send_unacknowledged: inner.send_unacknowledged,
            send_next: inner.send_next,
            send_max: inner.send_max,
            receive_next: inner.receive_next,
            send_window: inner.send_window,
            congestion_window: inner.congestion_window,
            slow_start_threshold: inner.slow_start_threshold,
            max_segment_size: inner.send_max_segment_size,
            retransmit_timeout: inner.retransmit_timeout,
            duplicate_acknowledge_count: inner.duplicate_acknowledge_count,
            in_recovery: inner.flags.contains(EndpointFlags::RECOVERY),
        }
    }

    // # Waiting

    /// Drops the endpoint lock, waits on `condvar` until woken or past the
    /// absolute `deadline`, and re-acquires the lock. An [`interrupt`]
    /// delivered during the wait surfaces as `Interrupted`.
    ///
    /// [`interrupt`]: TcpEndpoint::interrupt
    fn wait_on<'a>(
        &self,
        condvar: &Condvar,
        mut inner: MutexGuard<'a, Inner>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, Inner>, Result<(), TcpError>) {
        let generation = inner.interrupt_generation;
        match deadline {
            None => inner = condvar.wait(inner).unwrap(),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return (inner, Err(TcpError::TimedOut));
                }
                inner = condvar.wait_timeout(inner, deadline - now).unwrap().0;
            }
        }
        if inner.interrupt_generation != generation {
            return (inner, Err(TcpError::Interrupted));
        }
        (inner, Ok(()))
    }

    /// Wakes every caller blocked on this endpoint with `Interrupted`.
    pub fn interrupt(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.interrupt_generation += 1;
        let accept_queue = inner.accept_queue.clone();
        drop(inner);
        self.receive_condition.notify_all();
        self.send_condition.notify_all();
        if let Some(queue) = accept_queue {
            queue.interrupt();
        }
    }

    fn wait_for_established<'a>(
        &self,
        mut inner: MutexGuard<'a, Inner>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, Inner>, Result<(), TcpError>) {
        // This deliberately keeps waiting when the state has fallen back to
        // CLOSED: the wait is broken by the latched socket error instead.
        // `strict_wait_for_established` tightens the loop for callers that
        // prefer failing fast.
        while inner.state < State::Established {
            if let Some(error) = inner.error {
                return (inner, Err(error));
            }
            if inner.config.strict_wait_for_established && inner.state == State::Closed {
                return (inner, Err(TcpError::NotConnected));
            }
            let (guard, result) = self.wait_on(&self.send_condition, inner, deadline);
            inner = guard;
            if let Err(error) = result {
                return (inner, Err(error));
            }
        }
        (inner, Ok(()))
    }

    // # Connection setup

    /// Starts the three-way handshake toward `peer` and, on a blocking
    /// endpoint, waits until the connection is established.
    pub fn connect(self: &Arc<Self>, peer: SocketAddr) -> Result<(), TcpError> {
        if Family::of(&peer) != self.manager.family() {
            return Err(TcpError::AddressFamilyUnsupported);
        }

        let mut inner = self.inner.lock().unwrap();
        tracing::debug!(%peer, "connect");

        match inner.state {
            State::Listen => {
                // this socket stops listening; drop pending connections
                if let Some(queue) = inner.accept_queue.take() {
                    for orphan in queue.close() {
                        orphan.abort();
                    }
                }
            }
            State::Established => return Err(TcpError::AlreadyConnected),
            State::Closed => {}
            _ => return Err(TcpError::ConnectionInProgress),
        }

        // an unspecified destination means loopback
        let peer = if peer.ip().is_unspecified() {
            SocketAddr::new(self.manager.family().loopback(), peer.port())
        } else {
            peer
        };

        self.prepare_send_path(&mut inner, peer)?;

        self.set_state(&mut inner, State::SynSent);
        if let Err(error) = self.send_queued(&mut inner, false) {
            self.close_internal(self, &mut inner);
            return Err(error);
        }

        // over loopback the answer may already have been processed
        if inner.state == State::Established {
            return Ok(());
        }

        let timeout = match inner.config.send_timeout {
            Some(Duration::ZERO) => return Err(TcpError::ConnectionInProgress),
            Some(timeout) => timeout.min(crate::CONNECTION_TIMEOUT),
            None => crate::CONNECTION_TIMEOUT,
        };
        let deadline = Instant::now() + timeout;

        let (inner, result) = self.wait_for_established(inner, Some(deadline));
        drop(inner);
        result
    }

    /// Route lookup, connection registration, and send-side variable setup
    /// for an active or spawned connection.
    fn prepare_send_path(
        self: &Arc<Self>,
        inner: &mut Inner,
        peer: SocketAddr,
    ) -> Result<(), TcpError> {
        if inner.route.is_none() {
            let route = self
                .manager
                .router()
                .route(&peer)
                .ok_or(TcpError::NetworkUnreachable)?;
            if route.is_local {
                inner.flags |= EndpointFlags::LOCAL;
                self.local_hint.store(true, Ordering::Release);
            }
            inner.route = Some(route);
        }
        let route = inner.route.clone().unwrap();

        // an unbound endpoint gets an ephemeral port first
        if self.local_address().port() == 0 {
            let local = self.local_address();
            self.manager.bind(self, local, &inner.config)?;
        }

        // make sure the connection does not already exist
        self.manager
            .set_connection(self, peer, route.interface_address)?;

        let initial = Seq::new((system_time() >> 4) as u32);
        inner.initial_send_sequence = initial;
        inner.send_next = initial;
        inner.send_unacknowledged = initial;
        inner.send_max = initial;
        inner.send_urgent_offset = initial;
        inner.recover = initial;

        // the SYN occupies the first sequence number
        inner.send_queue.set_initial_sequence(initial + 1);

        inner.receive_max_segment_size = (route.mtu - crate::segment::HEADER_LENGTH) as u32;

        // compute the window shift we advertise; the peer's SYN resets it
        // to zero if scaling is not supported on the other side
        inner.receive_window_shift = 0;
        while inner.receive_window_shift < crate::MAX_WINDOW_SHIFT
            && ((crate::MAX_WINDOW as usize) << inner.receive_window_shift)
                < inner.config.receive_buffer_size
        {
            inner.receive_window_shift += 1;
        }

        Ok(())
    }

    /// Receive-side variable setup from the peer's SYN, and the initial
    /// congestion window of RFC 2581.
    fn prepare_receive_path(&self, inner: &mut Inner, segment: &mut SegmentHeader) {
        inner.initial_receive_sequence = segment.sequence;
        inner.finish_received = false;

        // count the received SYN
        segment.sequence += 1;

        inner.receive_next = segment.sequence;
        inner.receive_queue.set_initial_sequence(segment.sequence);

        if !inner.config.no_options {
            if segment.max_segment_size > 0 {
                inner.send_max_segment_size = segment.max_segment_size as u32;
            }

            if segment.options.contains(SegmentOptions::WINDOW_SCALE) {
                inner.flags |= EndpointFlags::WINDOW_SCALE;
                inner.send_window_shift = segment.window_shift;
            } else {
                inner.flags.remove(EndpointFlags::WINDOW_SCALE);
                inner.receive_window_shift = 0;
            }

            if segment.options.contains(SegmentOptions::TIMESTAMPS) {
                inner.flags |= EndpointFlags::TIMESTAMP;
                inner.received_timestamp = segment.timestamp_value;
            } else {
                inner.flags.remove(EndpointFlags::TIMESTAMP);
            }
        } else {
            inner
                .flags
                .remove(EndpointFlags::WINDOW_SCALE | EndpointFlags::TIMESTAMP);
            inner.receive_window_shift = 0;
        }

        let mss = inner.send_max_segment_size;
        inner.congestion_window = if mss > 2190 {
            2 * mss
        } else if mss > 1095 {
            3 * mss
        } else {
            4 * mss
        };
        inner.send_max_segments = inner.congestion_window / mss;
        inner.slow_start_threshold =
            (segment.advertised_window as u32) << inner.send_window_shift;
    }

    fn mark_established(self: &Arc<Self>, inner: &mut Inner) {
        self.set_state(inner, State::Established);

        if inner.spawned {
            if let Some(queue) = &inner.accept_queue {
                queue.deliver(Arc::clone(self));
            }
        }

        self.send_condition.notify_all();
        if let Some(events) = &inner.events {
            events.on_writable(inner.send_queue.free());
        }
    }

    // # Listening and accepting

    /// Binds (ephemerally, when not yet bound) and starts listening with
    /// the given backlog.
    pub fn listen(self: &Arc<Self>, backlog: usize) -> Result<(), TcpError> {
        let mut inner = self.inner.lock().unwrap();
        tracing::debug!(backlog, "listen");

        match inner.state {
            State::Closed => {
                self.manager.set_passive(self)?;
                inner.accept_queue = Some(AcceptQueue::new(backlog));
                self.set_state(&mut inner, State::Listen);
            }
            State::Listen => {
                if let Some(queue) = &inner.accept_queue {
                    queue.set_max_backlog(backlog);
                }
            }
            _ => return Err(TcpError::Invalid),
        }
        Ok(())
    }

    /// Dequeues the next established connection spawned off this listening
    /// endpoint, blocking per the receive timeout.
    pub fn accept(&self) -> Result<Arc<TcpEndpoint>, TcpError> {
        let (queue, deadline, non_blocking) = {
            let inner = self.inner.lock().unwrap();
            if inner.state != State::Listen {
                return Err(TcpError::Invalid);
            }
            let non_blocking = inner.config.receive_timeout == Some(Duration::ZERO);
            let deadline = inner
                .config
                .receive_timeout
                .filter(|timeout| !timeout.is_zero())
                .map(|timeout| Instant::now() + timeout);
            (inner.accept_queue.clone().unwrap(), deadline, non_blocking)
        };

        match queue.dequeue(deadline, non_blocking) {
            Err(TcpError::TimedOut) => Err(TcpError::WouldBlock),
            other => other,
        }
    }

    /// Binds the endpoint to a concrete (or ephemeral, when the port is
    /// zero) local address.
    pub fn bind(self: &Arc<Self>, address: SocketAddr) -> Result<(), TcpError> {
        let inner = self.inner.lock().unwrap();
        tracing::debug!(%address, "bind");

        if inner.state != State::Closed {
            return Err(TcpError::AlreadyConnected);
        }
        self.manager.bind(self, address, &inner.config)
    }

    /// Handles a segment arriving on a listening endpoint: only a bare SYN
    /// is acceptable, and it spawns a child endpoint in SYN_RECEIVED.
    fn listen_receive(
        self: &Arc<Self>,
        inner: &mut Inner,
        segment: &mut SegmentHeader,
        buffer: Message,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> SegmentAction {
        if segment.control.contains(Control::RST) {
            return SegmentAction::DROP;
        }
        if segment.control.contains(Control::ACK) {
            return SegmentAction::DROP | SegmentAction::RESET;
        }
        if !segment.control.contains(Control::SYN) {
            return SegmentAction::DROP;
        }

        let queue = inner.accept_queue.as_ref().unwrap();
        if !queue.try_reserve() {
            tracing::debug!("backlog full, dropping connection attempt");
            return SegmentAction::DROP;
        }

        let child = TcpEndpoint::new(Arc::clone(&self.manager), inner.config.clone());
        child.spawn(inner, segment, buffer, local, peer)
    }

    /// Second half of passive connection setup, running on the freshly
    /// created child endpoint while the parent's lock is held.
    fn spawn(
        self: &Arc<Self>,
        parent: &Inner,
        segment: &mut SegmentHeader,
        buffer: Message,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> SegmentAction {
        let mut inner = self.inner.lock().unwrap();
        tracing::debug!(%local, %peer, "spawning connection");

        self.set_state(&mut inner, State::SynReceived);
        self.set_local_address(local);
        self.set_peer_address(peer);

        inner.spawned = true;
        inner.accept_queue = parent.accept_queue.clone();
        inner.config = parent.config.clone();
        inner.flags |= parent.flags & EndpointFlags::NO_RECEIVE;

        let abort = |queue: &Option<Arc<AcceptQueue>>| {
            if let Some(queue) = queue {
                queue.abort(self);
            }
            SegmentAction::DROP
        };

        if self.manager.bind_child(self).is_err() {
            tracing::debug!("binding the spawned endpoint failed");
            return abort(&inner.accept_queue);
        }
        if self.prepare_send_path(&mut inner, peer).is_err() {
            tracing::debug!("preparing the send path failed");
            return abort(&inner.accept_queue);
        }

        self.prepare_receive_path(&mut inner, segment);

        // send SYN+ACK
        if self.send_queued(&mut inner, false).is_err() {
            return abort(&inner.accept_queue);
        }

        // the SYN is handled now; it must not be processed again
        segment.control.remove(Control::SYN);

        self.receive(&mut inner, segment, buffer)
    }

    /// Segment processing in SYN_SENT, per RFC 793's rules for that state
    /// (including simultaneous open).
    fn synchronize_sent_receive(
        self: &Arc<Self>,
        inner: &mut Inner,
        segment: &mut SegmentHeader,
        buffer: Message,
    ) -> SegmentAction {
        if segment.control.contains(Control::ACK)
            && (inner.initial_send_sequence >= segment.acknowledge
                || inner.send_max < segment.acknowledge)
        {
            return SegmentAction::DROP | SegmentAction::RESET;
        }

        if segment.control.contains(Control::RST) {
            self.handle_reset(inner, TcpError::ConnectionRefused);
            return SegmentAction::DROP;
        }

        if !segment.control.contains(Control::SYN) {
            return SegmentAction::DROP;
        }

        if segment.control.contains(Control::ACK) {
            // the SYN is acknowledged; stop retransmitting it
            inner.send_unacknowledged = segment.acknowledge;
            self.retransmit_timer.cancel();
        }
        self.prepare_receive_path(inner, segment);

        if segment.control.contains(Control::ACK) {
            self.mark_established(inner);
        } else {
            // simultaneous open
            self.set_state(inner, State::SynReceived);
        }

        segment.control.remove(Control::SYN);
        self.receive(inner, segment, buffer) | SegmentAction::IMMEDIATE_ACKNOWLEDGE
    }

    // # Segment reception

    /// Entry point for an incoming, already decoded segment. Returns the
    /// action set the dispatcher must honor.
    pub(crate) fn segment_received(
        self: &Arc<Self>,
        segment: &mut SegmentHeader,
        buffer: Message,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> SegmentAction {
        let mut inner = self.inner.lock().unwrap();
        tracing::trace!(
            state = %inner.state,
            size = buffer.len(),
            flags = ?segment.control,
            sequence = %segment.sequence,
            acknowledge = %segment.acknowledge,
            "segment received"
        );

        let action = match inner.state {
            State::Listen => self.listen_receive(&mut inner, segment, buffer, local, peer),
            State::SynSent => self.synchronize_sent_receive(&mut inner, segment, buffer),
            _ => self.receive(&mut inner, segment, buffer),
        };

        // process the acknowledge action as asked for by the handlers
        if action.contains(SegmentAction::IMMEDIATE_ACKNOWLEDGE) {
            let _ = self.send_acknowledge(&mut inner, true);
        } else if action.contains(SegmentAction::ACKNOWLEDGE) {
            self.delayed_acknowledge(&mut inner);
        }

        if inner
            .flags
            .contains(EndpointFlags::CLOSED | EndpointFlags::DELETE_ON_CLOSE)
        {
            drop(inner);
            if self.manager.unbind(self) {
                return action | SegmentAction::DELETED_ENDPOINT;
            }
        }

        action
    }

    /// The standard segment processing pipeline for every synchronized
    /// state: PAWS, acceptability, RST, SYN, trimming, ACK bookkeeping,
    /// data queueing, and FIN handling, in that order.
    fn receive(
        self: &Arc<Self>,
        inner: &mut Inner,
        segment: &mut SegmentHeader,
        mut buffer: Message,
    ) -> SegmentAction {
        // PAWS takes precedence over the regular acceptability check
        if inner.flags.contains(EndpointFlags::TIMESTAMP)
            && !segment.control.contains(Control::RST)
        {
            if !segment.options.contains(SegmentOptions::TIMESTAMPS) {
                return SegmentAction::DROP;
            }
            let age = inner.received_timestamp.wrapping_sub(segment.timestamp_value);
            if age as i32 > 0 && age <= i32::MAX as u32 {
                return SegmentAction::DROP | SegmentAction::IMMEDIATE_ACKNOWLEDGE;
            }
        }

        let advertised_window =
            (segment.advertised_window as u32) << inner.send_window_shift;
        let mut segment_length = buffer.len();

        // Header prediction: the common case of uni-directional transfer.
        // The segment must not change the window, must carry the expected
        // sequence, and must have no control flags besides ACK.
        if inner.state == State::Established
            && segment.acknowledge_only()
            && inner.receive_next == segment.sequence
            && advertised_window > 0
            && advertised_window == inner.send_window
            && inner.send_next == inner.send_max
        {
            self.update_timestamps(inner, segment, segment_length);

            if segment_length == 0 {
                // a pure acknowledgement - we are on the sending end
                if inner.send_unacknowledged < segment.acknowledge
                    && inner.send_max >= segment.acknowledge
                {
                    self.acknowledged(inner, segment);
                    return SegmentAction::DROP;
                }
            } else if segment.acknowledge == inner.send_unacknowledged
                && inner.receive_queue.is_contiguous()
                && inner.receive_queue.free() >= segment_length
                && !inner.flags.contains(EndpointFlags::NO_RECEIVE)
            {
                let push = segment.control.contains(Control::PSH);
                if self.add_data(inner, segment, buffer) {
                    inner.notify_reader(&self.receive_condition);
                }
                return if push {
                    SegmentAction::IMMEDIATE_ACKNOWLEDGE
                } else {
                    SegmentAction::ACKNOWLEDGE
                };
            }
        }

        // the fast path was not applicable; standard processing follows

        if inner.state != State::Closed && inner.state != State::TimeWait {
            if !segment_in_sequence(segment, segment_length, inner.receive_next, inner.receive_window)
            {
                tracing::trace!(
                    receive_next = %inner.receive_next,
                    window = inner.receive_window,
                    "segment out of window"
                );
                if segment.control.contains(Control::RST) {
                    return SegmentAction::DROP;
                }
                return SegmentAction::DROP | SegmentAction::IMMEDIATE_ACKNOWLEDGE;
            }
        }

        if segment.control.contains(Control::RST) {
            // Resets in TIME_WAIT are ignored entirely (RFC 1337).
            if inner.last_acknowledge_sent <= segment.sequence
                && segment.sequence < inner.last_acknowledge_sent + inner.receive_window
                && inner.state != State::TimeWait
            {
                let error = match inner.state {
                    State::SynReceived => TcpError::ConnectionRefused,
                    State::Closing | State::LastAck => TcpError::NotConnected,
                    _ => TcpError::ConnectionReset,
                };
                self.handle_reset(inner, error);
            }
            return SegmentAction::DROP;
        }

        if segment.control.contains(Control::SYN)
            || (inner.state == State::SynReceived
                && (inner.initial_receive_sequence > segment.sequence
                    || (segment.control.contains(Control::ACK)
                        && (inner.send_unacknowledged > segment.acknowledge
                            || inner.send_max < segment.acknowledge))))
        {
            // either the initial SYN was faulty, or a SYN showed up within
            // the data stream
            return SegmentAction::DROP | SegmentAction::RESET;
        }

        // the advertised window must not appear to shrink
        inner.receive_window = (inner.receive_queue.free() as u32).max(inner.receive_window);

        let mut action = SegmentAction::empty();

        // trim anything preceding what we already received
        let mut head_drop = (inner.receive_next - segment.sequence) as i32;
        if head_drop > 0 {
            if head_drop as usize > buffer.len()
                || (head_drop as usize == buffer.len()
                    && !segment.control.contains(Control::FIN))
            {
                if inner.state == State::TimeWait && segment.control.contains(Control::FIN) {
                    // the peer retransmitted its FIN because our ACK got
                    // lost; acknowledge again and restart the quiet time
                    self.update_time_wait(inner);
                    action |= SegmentAction::IMMEDIATE_ACKNOWLEDGE;
                }
                // don't accidentally swallow a FIN we should keep
                segment.control.remove(Control::FIN);
                head_drop = buffer.len() as i32;
            }
            buffer.remove_front(head_drop as usize);
            segment.sequence += head_drop as u32;
        }

        // an out-of-order segment is acknowledged immediately to trigger
        // fast retransmit at the sender
        if head_drop != 0 {
            action |= SegmentAction::IMMEDIATE_ACKNOWLEDGE;
        }

        let tail_excess = (segment.sequence + buffer.len() as u32
            - (inner.receive_next + inner.receive_window)) as i32;
        if tail_excess > 0 {
            let mut tail_drop = tail_excess as usize;
            if tail_drop >= buffer.len() {
                // unless this is a window probe right at the expected
                // sequence, the whole segment is beyond the window
                if inner.receive_window != 0 || segment.sequence != inner.receive_next {
                    return SegmentAction::DROP | SegmentAction::IMMEDIATE_ACKNOWLEDGE;
                }
                action |= SegmentAction::IMMEDIATE_ACKNOWLEDGE;
            }
            if segment.control.contains(Control::FIN) {
                // the FIN counts as part of the excess
                tail_drop -= 1;
            }
            segment.control.remove(Control::FIN | Control::PSH);
            buffer.remove_back(tail_drop.min(buffer.len()));
        }

        if advertised_window > inner.send_window {
            tracing::trace!(
                from = inner.send_window,
                to = advertised_window,
                "window update"
            );
            action |= SegmentAction::IMMEDIATE_ACKNOWLEDGE;
        }
        inner.send_window = advertised_window;
        if advertised_window > inner.send_max_window {
            inner.send_max_window = advertised_window;
        }

        // look at the acknowledgement for any updates

        if segment.control.contains(Control::ACK) {
            if inner.state == State::SynReceived {
                self.mark_established(inner);
            }

            if inner.send_max < segment.acknowledge {
                return SegmentAction::DROP | SegmentAction::IMMEDIATE_ACKNOWLEDGE;
            }

            if segment.acknowledge == inner.send_unacknowledged {
                if buffer.is_empty()
                    && advertised_window == inner.send_window
                    && !segment.control.contains(Control::FIN)
                    && inner.send_unacknowledged != inner.send_max
                {
                    self.duplicate_acknowledge(inner, segment);
                }
            } else if segment.acknowledge < inner.send_unacknowledged {
                return SegmentAction::DROP;
            } else {
                // this segment acknowledges in-flight data

                if inner.duplicate_acknowledge_count >= 3
                    && segment.acknowledge > inner.recover
                {
                    // deflate the window
                    let flight_size = inner.send_max - inner.send_unacknowledged;
                    inner.congestion_window = inner.slow_start_threshold.min(
                        flight_size.max(inner.send_max_segment_size)
                            + inner.send_max_segment_size,
                    );
                    inner.flags.remove(EndpointFlags::RECOVERY);
                }

                if segment.acknowledge > inner.send_queue.last_sequence()
                    && inner.state > State::Established
                {
                    // our FIN has been acknowledged
                    match inner.state {
                        State::FinWait1 => self.set_state(inner, State::FinWait2),
                        State::Closing => {
                            self.set_state(inner, State::TimeWait);
                            self.enter_time_wait(inner);
                            return SegmentAction::DROP;
                        }
                        State::LastAck => {
                            self.close_internal(self, inner);
                        }
                        _ => {}
                    }
                }

                if inner.state != State::Closed {
                    self.acknowledged(inner, segment);
                }
            }
        }

        // urgent data is acknowledged but not delivered out of band

        let mut notify = false;
        let buffer_size = buffer.len();

        if (buffer_size > 0 || segment.control.contains(Control::FIN)) && inner.should_receive()
        {
            notify = self.add_data(inner, segment, buffer);
        } else {
            if inner.flags.contains(EndpointFlags::NO_RECEIVE) {
                inner.receive_next += buffer_size as u32;
            }
            action |= SegmentAction::DROP;
        }

        if segment.control.contains(Control::FIN) {
            segment_length += 1;
            if !matches!(inner.state, State::Closed | State::Listen | State::SynSent) {
                tracing::trace!("peer is finishing the connection");
                inner.receive_next += 1;
                notify = true;

                // FIN implies push
                inner.receive_queue.set_push_pointer();

                action |= SegmentAction::IMMEDIATE_ACKNOWLEDGE;

                match inner.state {
                    State::Established | State::SynReceived => {
                        self.set_state(inner, State::CloseWait)
                    }
                    State::FinWait1 => {
                        // simultaneous close
                        self.set_state(inner, State::Closing)
                    }
                    State::FinWait2 => {
                        self.set_state(inner, State::TimeWait);
                        self.enter_time_wait(inner);
                    }
                    State::TimeWait => self.update_time_wait(inner),
                    _ => {}
                }
            }
        }

        if notify {
            inner.notify_reader(&self.receive_condition);
        }

        if buffer_size > 0 || segment.control.contains(Control::SYN) {
            action |= SegmentAction::ACKNOWLEDGE;
        }

        self.update_timestamps(inner, segment, segment_length);

        tracing::trace!(?action, "segment processed");
        action
    }

    /// Queues received payload, advances `rcv.nxt` across whatever is now
    /// contiguous, and tracks a FIN that may still be beyond a hole.
    fn add_data(&self, inner: &mut Inner, segment: &mut SegmentHeader, buffer: Message) -> bool {
        if segment.control.contains(Control::FIN) {
            // remember where the finish belongs in the stream
            inner.finish_received = true;
            inner.finish_received_at = segment.sequence + buffer.len() as u32;
        }

        inner.receive_queue.add(buffer, segment.sequence);
        inner.receive_next = inner.receive_queue.next_sequence();

        if inner.finish_received {
            // only honor the FIN once the stream has caught up with it
            if inner.receive_next < inner.finish_received_at {
                segment.control.remove(Control::FIN);
            } else {
                segment.control.insert(Control::FIN);
            }
        }

        if segment.control.contains(Control::PSH) {
            inner.receive_queue.set_push_pointer();
        }

        inner.receive_queue.available() > 0
    }

    fn update_timestamps(&self, inner: &mut Inner, segment: &SegmentHeader, segment_length: usize) {
        if inner.flags.contains(EndpointFlags::TIMESTAMP) {
            let sequence = segment.sequence;
            if inner.last_acknowledge_sent >= sequence
                && inner.last_acknowledge_sent < sequence + segment_length as u32
            {
                inner.received_timestamp = segment.timestamp_value;
            }
        }
    }

    // # Acknowledgement processing and congestion control

    /// Handles an ACK that advances `snd.una`: retires data from the send
    /// queue, grows the congestion window, samples the round-trip time, and
    /// re-arms or cancels the retransmission timer.
    fn acknowledged(&self, inner: &mut Inner, segment: &SegmentHeader) {
        tracing::trace!(
            acknowledge = %segment.acknowledge,
            unacknowledged = %inner.send_unacknowledged,
            next = %inner.send_next,
            max = %inner.send_max,
            "acknowledged"
        );
        debug_assert!(inner.send_unacknowledged <= segment.acknowledge);

        if inner.send_unacknowledged < segment.acknowledge {
            inner.send_queue.remove_until(segment.acknowledge);

            let bytes_acknowledged = segment.acknowledge - inner.send_unacknowledged;
            inner.previous_highest_acknowledge = inner.send_unacknowledged;
            inner.send_unacknowledged = segment.acknowledge;
            let flight_size = inner.send_max - inner.send_unacknowledged;
            let expected_samples = (flight_size / (inner.send_max_segment_size << 1)) as i32;

            if inner.previous_highest_acknowledge > inner.send_unacknowledged {
                // sequence wraparound; refresh the recovery marker
                inner.recover = segment.acknowledge - 1;
            }

            // the acknowledgement of our SYN must not grow the congestion
            // window
            if inner.previous_highest_acknowledge != inner.initial_send_sequence {
                let mss = inner.send_max_segment_size;
                if inner.congestion_window < inner.slow_start_threshold {
                    inner.congestion_window += bytes_acknowledged.min(mss);
                } else {
                    let mut increment = mss * mss;
                    if increment < inner.congestion_window {
                        increment = 1;
                    } else {
                        increment /= inner.congestion_window;
                    }
                    inner.congestion_window += increment;
                }
                inner.send_max_segments = u32::MAX;
            }

            if inner.flags.contains(EndpointFlags::RECOVERY) {
                // partial acknowledgement during fast recovery: retransmit
                // the next hole and deflate by what was acknowledged
                inner.send_next = inner.send_unacknowledged;
                let _ = self.send_queued(inner, false);
                inner.congestion_window =
                    inner.congestion_window.saturating_sub(bytes_acknowledged);
                if bytes_acknowledged > inner.send_max_segment_size {
                    inner.congestion_window += inner.send_max_segment_size;
                }
                inner.send_next = inner.send_max;
            } else {
                inner.duplicate_acknowledge_count = 0;
            }

            if inner.send_next < inner.send_unacknowledged {
                inner.send_next = inner.send_unacknowledged;
            }

            if inner.flags.contains(EndpointFlags::TIMESTAMP) {
                self.update_round_trip_time(
                    inner,
                    tcp_diff_timestamp(segment.timestamp_reply) as i32,
                    expected_samples.max(1),
                );
            } else if inner.send_time != 0 && inner.round_trip_start_sequence < segment.acknowledge
            {
                let sample = tcp_diff_timestamp(inner.send_time) as i32;
                self.update_round_trip_time(inner, sample, 1);
                inner.send_time = 0;
            }

            if inner.send_unacknowledged == inner.send_max {
                tracing::trace!("all in-flight data acknowledged");
                self.retransmit_timer.cancel();
            } else {
                self.retransmit_timer.schedule(inner.retransmit_timeout);
            }

            if inner.state.is_writable() {
                self.send_condition.notify_all();
                if let Some(events) = &inner.events {
                    events.on_writable(inner.send_queue.free());
                }
            }
        }

        // if there is data left to be sent, send it now
        if inner.send_queue.used() > 0 {
            let _ = self.send_queued(inner, false);
        }
    }

    /// Duplicate-ACK accounting: limited transmit on the first two, fast
    /// retransmit on the third, window inflation afterwards.
    fn duplicate_acknowledge(&self, inner: &mut Inner, segment: &SegmentHeader) {
        let mss = inner.send_max_segment_size;

        if inner.duplicate_acknowledge_count == 0 {
            inner.previous_flight_size = inner.send_max - inner.send_unacknowledged;
        }

        inner.duplicate_acknowledge_count += 1;
        if inner.duplicate_acknowledge_count < 3 {
            if inner.send_queue.available_from(inner.send_max) != 0 && inner.send_window != 0 {
                // limited transmit: briefly inflate the window to get one
                // new segment out
                inner.send_next = inner.send_max;
                let inflation = inner.duplicate_acknowledge_count * mss;
                inner.congestion_window += inflation;
                let _ = self.send_queued(inner, false);
                inner.congestion_window -= inflation;
                tracing::trace!("limited transmit on duplicate acknowledge");
            }
        }

        if inner.duplicate_acknowledge_count == 3 {
            if segment.acknowledge - 1 > inner.recover
                || (inner.congestion_window > mss
                    && inner.send_unacknowledged - inner.previous_highest_acknowledge
                        <= 4 * mss)
            {
                // fast retransmit
                inner.flags |= EndpointFlags::RECOVERY;
                inner.recover = inner.send_max - 1;
                inner.slow_start_threshold = (inner.previous_flight_size / 2).max(2 * mss);
                inner.congestion_window = inner.slow_start_threshold + 3 * mss;
                inner.send_next = segment.acknowledge;
                let _ = self.send_queued(inner, false);
                tracing::trace!("fast retransmit on third duplicate acknowledge");
            }
        } else if inner.duplicate_acknowledge_count > 3 {
            let flight_size = inner.send_max - inner.send_unacknowledged;
            if (inner.duplicate_acknowledge_count - 3) * mss <= flight_size {
                inner.congestion_window += mss;
            }
            if inner.send_queue.available_from(inner.send_max) != 0 {
                inner.send_next = inner.send_max;
                let _ = self.send_queued(inner, false);
            }
        }
    }

    fn update_round_trip_time(&self, inner: &mut Inner, round_trip_time: i32, expected_samples: i32) {
        if inner.smoothed_round_trip_time == 0 {
            inner.smoothed_round_trip_time = round_trip_time;
            inner.round_trip_variation = round_trip_time / 2;
        } else {
            let delta = (inner.smoothed_round_trip_time - round_trip_time).abs();
            inner.round_trip_variation +=
                (delta - inner.round_trip_variation) / (expected_samples * 4);
            inner.smoothed_round_trip_time +=
                (round_trip_time - inner.smoothed_round_trip_time) / (expected_samples * 8);
        }
        let millis = inner.smoothed_round_trip_time + 100.max(inner.round_trip_variation * 4);
        let timeout = Duration::from_millis(millis.max(0) as u64);
        inner.retransmit_timeout = timeout.clamp(
            crate::MIN_RETRANSMIT_TIMEOUT,
            crate::MAX_RETRANSMIT_TIMEOUT,
        );

        tracing::trace!(
            round_trip_time,
            timeout = ?inner.retransmit_timeout,
            "round trip time updated"
        );
    }

    fn reset_slow_start(&self, inner: &mut Inner) {
        inner.slow_start_threshold = ((inner.send_max - inner.send_unacknowledged) / 2)
            .max(2 * inner.send_max_segment_size);
        inner.congestion_window = inner.send_max_segment_size;
    }

    // # Resets and teardown

    fn handle_reset(self: &Arc<Self>, inner: &mut Inner, error: TcpError) {
        inner.error = Some(error);
        self.close_internal(self, inner);

        if let Some(events) = &inner.events {
            events.on_error(error);
        }
    }

    /// Hard-closes the endpoint: cancels the connection timers, latches the
    /// CLOSED state, and wakes everyone.
    fn close_internal(&self, this: &Arc<Self>, inner: &mut Inner) {
        self.cancel_connection_timers();
        self.set_state(inner, State::Closed);
        inner.flags |= EndpointFlags::DELETE_ON_CLOSE;

        self.send_condition.notify_all();
        inner.notify_reader(&self.receive_condition);

        if inner.spawned {
            // nobody accepted us yet, so nobody could ever close us
            if let Some(queue) = &inner.accept_queue {
                queue.abort(this);
            }
        }
    }

    fn cancel_connection_timers(&self) {
        self.retransmit_timer.cancel();
        self.persist_timer.cancel();
        self.delayed_acknowledge_timer.cancel();
    }

    fn enter_time_wait(&self, inner: &mut Inner) {
        tracing::trace!("entering time-wait");
        if inner.state == State::TimeWait {
            self.cancel_connection_timers();
        }
        self.update_time_wait(inner);
    }

    fn update_time_wait(&self, _inner: &mut Inner) {
        self.time_wait_timer
            .schedule(crate::MAX_SEGMENT_LIFETIME * 2);
    }

    /// Sends our FIN (when the state calls for one) and advances the state
    /// machine accordingly.
    fn disconnect(&self, inner: &mut Inner, _closing: bool) -> Result<(), TcpError> {
        let previous_state = inner.state;

        match inner.state {
            State::SynReceived | State::Established => self.set_state(inner, State::FinWait1),
            State::CloseWait => self.set_state(inner, State::LastAck),
            _ => return Ok(()),
        }

        if let Err(error) = self.send_queued(inner, false) {
            self.set_state(inner, previous_state);
            return Err(error);
        }
        Ok(())
    }

    /// Gracefully closes the connection; with a linger configured, waits up
    /// to that long for the send queue to drain. Running into the linger
    /// timeout is not an error.
    pub fn close(self: &Arc<Self>) -> Result<(), TcpError> {
        let mut inner = self.inner.lock().unwrap();
        tracing::debug!("close");

        if inner.state == State::Listen {
            if let Some(queue) = inner.accept_queue.take() {
                let orphans = queue.close();
                drop(inner);
                for orphan in orphans {
                    orphan.abort();
                }
                inner = self.inner.lock().unwrap();
            }
        }

        if inner.state == State::SynSent || inner.state == State::Listen {
            self.set_state(&mut inner, State::Closed);
            return Ok(());
        }

        self.disconnect(&mut inner, true)?;

        if let Some(linger) = inner.config.linger {
            let deadline = Instant::now() + linger;
            while inner.send_queue.used() > 0 {
                let (guard, result) = self.wait_on(&self.send_condition, inner, Some(deadline));
                inner = guard;
                match result {
                    Err(TcpError::TimedOut) | Err(TcpError::WouldBlock) => break,
                    Err(error) => return Err(error),
                    Ok(()) => {}
                }
            }
            tracing::debug!(
                remaining = inner.send_queue.used(),
                "linger wait finished"
            );
        }
        Ok(())
    }

    /// Declares that the owner is done with this endpoint. A connection
    /// that got past the handshake lingers in the manager's tables for
    /// 2 MSL before the last references are dropped; everything else is
    /// released immediately.
    pub fn release(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        tracing::debug!("release");

        if inner.state <= State::SynSent {
            drop(inner);
            self.manager.unbind(self);
            return;
        }

        self.enter_time_wait(&mut inner);
        inner.flags |= EndpointFlags::CLOSED;
        if inner.flags.contains(EndpointFlags::DELETE_ON_CLOSE) {
            drop(inner);
            self.manager.unbind(self);
        }
    }

    /// Resets the connection without waiting for anything.
    pub fn abort(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        self.abort_locked(&mut inner);
    }

    fn abort_locked(self: &Arc<Self>, inner: &mut Inner) {
        if matches!(
            inner.state,
            State::SynReceived
                | State::Established
                | State::FinWait1
                | State::FinWait2
                | State::CloseWait
        ) {
            let mut segment = SegmentHeader::new(Control::RST | Control::ACK);
            segment.sequence = inner.send_next;
            segment.acknowledge = inner.receive_next;
            let (local, peer) = *self.addresses.lock().unwrap();
            segment.source_port = local.port();
            segment.destination_port = peer.port();
            let mut reply = Message::empty();
            segment.write_to(&mut reply, local.ip(), peer.ip());
            let _ = self.manager.router().send(local, peer, reply);
        }

        inner.error = Some(TcpError::ConnectionAborted);
        self.close_internal(self, inner);
    }

    /// Half-closes the connection: `Read` stops delivery of further
    /// payload, `Write` sends our FIN.
    pub fn shutdown(&self, direction: Shutdown) -> Result<(), TcpError> {
        let mut inner = self.inner.lock().unwrap();
        tracing::debug!(?direction, "shutdown");

        if matches!(direction, Shutdown::Read | Shutdown::Both) {
            inner.flags |= EndpointFlags::NO_RECEIVE;
            inner.notify_reader(&self.receive_condition);
        }
        if matches!(direction, Shutdown::Write | Shutdown::Both) {
            self.disconnect(&mut inner, false)?;
        }
        Ok(())
    }

    // # Sending

    /// Queues `data` for transmission, blocking while less than the
    /// low-water mark of queue space is free.
    pub fn send_data(&self, data: Message, flags: SendFlags) -> Result<(), TcpError> {
        let mut inner = self.inner.lock().unwrap();
        tracing::trace!(
            size = data.len(),
            queued = inner.send_queue.used(),
            "send data"
        );

        match inner.state {
            State::Closed => return Err(TcpError::NotConnected),
            State::Listen => return Err(TcpError::DestinationRequired),
            state if !state.is_writable() && !state.is_establishing() => {
                return Err(TcpError::BrokenPipe)
            }
            _ => {}
        }

        let deadline = inner
            .config
            .send_timeout
            .map(|timeout| Instant::now() + timeout);

        let mut data = data;
        loop {
            while inner.send_queue.free() < inner.config.send_low_water_mark {
                let (guard, result) = self.wait_on(&self.send_condition, inner, deadline);
                inner = guard;
                match result {
                    Err(TcpError::TimedOut) => return Err(TcpError::WouldBlock),
                    Err(error) => return Err(error),
                    Ok(()) => {}
                }
                if !inner.state.is_writable() && !inner.state.is_establishing() {
                    return Err(TcpError::BrokenPipe);
                }
            }

            let free = inner.send_queue.free();
            if free < data.len() {
                let head = data.cut(free);
                inner.send_queue.add_back(head);
            } else {
                inner.send_queue.add_back(data);
                break;
            }
        }

        let mut force = false;
        if flags.contains(SendFlags::OOB) {
            // the urgent offset points to the first byte after the urgent
            // data, as commonly implemented
            inner.send_urgent_offset = inner.send_queue.last_sequence();
            force = true;
        }
        if flags.contains(SendFlags::EOF) {
            self.disconnect(&mut inner, false)?;
        }

        if inner.state.is_writable() {
            let _ = self.send_queued(&mut inner, force);
        }
        Ok(())
    }

    /// Free space in the send queue, or an error when the connection can no
    /// longer be written to.
    pub fn send_available(&self) -> Result<usize, TcpError> {
        let inner = self.inner.lock().unwrap();
        if inner.state.is_writable() {
            Ok(inner.send_queue.free())
        } else if inner.state.is_establishing() {
            Ok(0)
        } else {
            Err(TcpError::BrokenPipe)
        }
    }

    /// The control flags a freshly built segment carries in the current
    /// state. FIN is attached separately when the segment reaches the end
    /// of the send queue.
    fn current_flags(state: State) -> Control {
        match state {
            State::Closed => Control::RST | Control::ACK,
            State::Listen => Control::empty(),
            State::SynSent => Control::SYN,
            State::SynReceived => Control::SYN | Control::ACK,
            _ => Control::ACK,
        }
    }

    /// The silly-window avoidance rules: whether a segment of `length`
    /// payload bytes is worth sending right now.
    fn should_send_segment(
        &self,
        inner: &Inner,
        segment: &SegmentHeader,
        length: usize,
        segment_max_size: usize,
        _flight_size: u32,
    ) -> bool {
        if inner.state == State::Established && inner.send_max_segments == 0 {
            return false;
        }

        if length > 0 {
            // send a data segment only in case:
            // - we have a full segment to send, or
            // - Nagle is disabled, or
            // - we are at the end of the buffer queue, or
            // - the buffer is at least as large as half the peer's largest
            //   window
            if length == segment_max_size
                || inner.config.no_delay
                || inner.send_next + length as u32 == inner.send_queue.last_sequence()
                || (inner.send_max_window > 0
                    && length as u32 >= inner.send_max_window / 2)
            {
                return true;
            }
        }

        // check if the window update is worth a segment of its own
        if segment.advertised_window > 0 {
            let advertised =
                (segment.advertised_window as u32) << inner.receive_window_shift;
            let window = advertised
                .wrapping_sub(inner.receive_max_advertised - inner.receive_next);
            if window >= inner.receive_max_segment_size * 2
                || window as usize >= inner.config.receive_buffer_size / 2
            {
                return true;
            }
        }

        if segment
            .control
            .intersects(Control::SYN | Control::FIN | Control::RST)
        {
            return true;
        }

        if inner.send_urgent_offset > inner.send_next {
            return true;
        }

        false
    }

    fn send_acknowledge(&self, inner: &mut Inner, force: bool) -> Result<(), TcpError> {
        self.send_queued_window(inner, force, 0)
    }

    fn send_queued(&self, inner: &mut Inner, force: bool) -> Result<(), TcpError> {
        let window = inner.send_window;
        self.send_queued_window(inner, force, window)
    }

    /// Sends one or more segments with the data waiting in the queue, or
    /// whatever control flags the current state requires.
    fn send_queued_window(
        &self,
        inner: &mut Inner,
        force: bool,
        send_window: u32,
    ) -> Result<(), TcpError> {
        if inner.route.is_none() {
            return Err(TcpError::NetworkUnreachable);
        }
        if inner.state == State::Listen {
            return Err(TcpError::Invalid);
        }

        let (local, peer) = *self.addresses.lock().unwrap();

        let mut segment = SegmentHeader::new(Self::current_flags(inner.state));
        segment.source_port = local.port();
        segment.destination_port = peer.port();

        if !inner.config.no_options {
            if inner.flags.contains(EndpointFlags::TIMESTAMP) {
                segment.options |= SegmentOptions::TIMESTAMPS;
                segment.timestamp_reply = inner.received_timestamp;
                segment.timestamp_value = tcp_now();
            }

            if segment.control.contains(Control::SYN)
                && inner.send_next == inner.initial_send_sequence
            {
                // connection establishment options
                segment.max_segment_size = inner.receive_max_segment_size as u16;
                if inner.flags.contains(EndpointFlags::WINDOW_SCALE) {
                    segment.options |= SegmentOptions::WINDOW_SCALE;
                    segment.window_shift = inner.receive_window_shift;
                }
            }
        }

        // the advertised window must stay put while duplicate
        // acknowledgements are outstanding
        let mut available_bytes = inner.receive_queue.free();
        if !inner.receive_queue.is_contiguous() {
            available_bytes = (inner.receive_max_advertised - inner.receive_next) as usize;
        }
        let shift = if inner.flags.contains(EndpointFlags::WINDOW_SCALE) {
            inner.receive_window_shift
        } else {
            0
        };
        segment.set_advertised_window(available_bytes, shift);

        segment.acknowledge = inner.receive_next;

        if inner.send_urgent_offset > inner.send_next {
            segment.control |= Control::URG;
            segment.urgent_offset = (inner.send_urgent_offset - inner.send_next) as u16;
        } else {
            // keep the urgent offset from reaching into the send window
            inner.send_urgent_offset = inner.send_unacknowledged;
            segment.urgent_offset = 0;
        }

        let mut send_window = send_window;
        if inner.congestion_window > 0 && inner.congestion_window < send_window {
            send_window = inner.congestion_window;
        }

        // The flight is what is on the wire right now; it must never grow
        // beyond the effective window, though the window itself may shrink
        // under it when congestion strikes.
        let flight_size = inner.send_max - inner.send_unacknowledged;
        let consumed_window = inner.send_next - inner.send_unacknowledged;
        if consumed_window > send_window {
            send_window = 0;
        } else {
            send_window -= consumed_window;
        }

        let mut length = inner
            .send_queue
            .available_from(inner.send_next)
            .min(send_window as usize);
        let mut should_start_retransmit_timer = inner.send_next == inner.send_unacknowledged;
        let retransmit = inner.send_next < inner.send_max;

        if inner.duplicate_acknowledge_count != 0 {
            // at most one segment under limited transmit / fast recovery
            length = length.min(inner.send_max_segment_size as usize);
        }

        loop {
            let segment_max_size =
                inner.send_max_segment_size as usize - segment.options_length();
            let segment_length = length.min(segment_max_size);

            if inner.send_next + segment_length as u32 == inner.send_queue.last_sequence()
                && !force
            {
                if inner.state.needs_finish() {
                    segment.control |= Control::FIN;
                }
                if length > 0 {
                    segment.control |= Control::PSH;
                }
            }

            if !force
                && !retransmit
                && !self.should_send_segment(
                    inner,
                    &segment,
                    segment_length,
                    segment_max_size,
                    flight_size,
                )
            {
                if inner.send_queue.available() > 0
                    && !self.persist_timer.is_armed()
                    && !self.retransmit_timer.is_armed()
                {
                    self.persist_timer.schedule(crate::PERSIST_TIMEOUT);
                }
                break;
            }

            let mut buffer = if segment_length > 0 {
                inner.send_queue.get(inner.send_next, segment_length)?
            } else {
                Message::empty()
            };

            segment.sequence = inner.send_next;

            tracing::trace!(
                size = buffer.len(),
                flags = ?segment.control,
                sequence = %segment.sequence,
                acknowledge = %segment.acknowledge,
                window = segment.advertised_window,
                congestion_window = inner.congestion_window,
                "sending segment"
            );

            segment.write_to(&mut buffer, local.ip(), peer.ip());

            let mut size = segment_length;
            if segment.control.contains(Control::SYN) {
                // establishment options go out once per connection attempt
                segment.options.remove(SegmentOptions::WINDOW_SCALE);
                segment.max_segment_size = 0;
                size += 1;
            }
            if segment.control.contains(Control::FIN) {
                size += 1;
            }

            // update the send status before handing the segment off; for
            // local connections the answer may arrive immediately
            let send_max_before = inner.send_max;
            inner.send_next += size as u32;
            if inner.send_max < inner.send_next {
                inner.send_max = inner.send_next;
            }

            inner.receive_max_advertised = inner.receive_next
                + ((segment.advertised_window as u32) << inner.receive_window_shift);

            if segment_length != 0 && inner.state == State::Established {
                inner.send_max_segments = inner.send_max_segments.saturating_sub(1);
            }

            if let Err(error) = self.manager.router().send(local, peer, buffer) {
                // restore the send status
                inner.send_next = segment.sequence;
                inner.send_max = send_max_before;
                return Err(error);
            }

            if inner.send_time == 0
                && !retransmit
                && (segment_length != 0 || segment.control.contains(Control::SYN))
            {
                inner.send_time = tcp_now();
                inner.round_trip_start_sequence = segment.sequence;
            }

            if should_start_retransmit_timer && size > 0 {
                tracing::trace!(timeout = ?inner.retransmit_timeout, "starting retransmit timer");
                self.retransmit_timer.schedule(inner.retransmit_timeout);
                should_start_retransmit_timer = false;
            }

            if segment.control.contains(Control::ACK) {
                inner.last_acknowledge_sent = segment.acknowledge;
            }

            length -= segment_length;
            segment
                .control
                .remove(Control::SYN | Control::RST | Control::FIN);

            if retransmit || length == 0 {
                break;
            }
        }

        Ok(())
    }

    // # Reading

    /// Delivers up to `bytes` contiguous bytes to the caller, blocking per
    /// the configured low-water mark and timeout. A return of zero bytes
    /// means the peer half-closed the connection.
    pub fn read_data(&self, bytes: usize, flags: ReadFlags) -> Result<Message, TcpError> {
        let mut inner = self.inner.lock().unwrap();
        tracing::trace!(bytes, ?flags, "read data");

        if inner.state == State::Closed {
            return Err(TcpError::NotConnected);
        }

        let non_blocking = flags.contains(ReadFlags::DONT_WAIT)
            || inner.config.receive_timeout == Some(Duration::ZERO);
        let deadline = inner
            .config
            .receive_timeout
            .filter(|timeout| !timeout.is_zero())
            .map(|timeout| Instant::now() + timeout);

        if inner.state.is_establishing() {
            if non_blocking {
                return Err(TcpError::WouldBlock);
            }
            let (guard, result) = self.wait_for_established(inner, deadline);
            inner = guard;
            if let Err(error) = result {
                return Err(match error {
                    TcpError::TimedOut => TcpError::WouldBlock,
                    other => other,
                });
            }
        }

        let mut data_needed = inner.config.receive_low_water_mark;
        if flags.contains(ReadFlags::WAIT_ALL) {
            data_needed = bytes;
        }

        loop {
            if matches!(
                inner.state,
                State::Closing | State::LastAck | State::TimeWait
            ) {
                // connection closing
                return Ok(Message::empty());
            }

            let available = inner.receive_queue.available();
            if available > 0 {
                let pushed = inner.receive_queue.pushed_data();
                if available >= data_needed || (pushed > 0 && pushed >= available) {
                    break;
                }
            } else if inner.state == State::CloseWait {
                // no text awaiting delivery: the half-close indication
                return Ok(Message::empty());
            }

            if non_blocking {
                return Err(TcpError::WouldBlock);
            }
            if inner.flags.contains(EndpointFlags::NO_RECEIVE) {
                return Ok(Message::empty());
            }

            let (guard, result) = self.wait_on(&self.receive_condition, inner, deadline);
            inner = guard;
            if let Err(error) = result {
                // deliver what we have even when the wait was cut short
                if matches!(error, TcpError::TimedOut | TcpError::Interrupted)
                    && inner.receive_queue.available() > 0
                {
                    break;
                }
                return Err(match error {
                    TcpError::TimedOut => TcpError::WouldBlock,
                    other => other,
                });
            }
        }

        if bytes < inner.receive_queue.available() {
            // there is more; other readers need not keep waiting
            self.receive_condition.notify_all();
        }

        let peek = flags.contains(ReadFlags::PEEK);
        let data = inner.receive_queue.get_front(bytes, !peek);

        // if we just opened the window, check whether an ACK is due
        if !peek {
            let _ = self.send_acknowledge(&mut inner, false);
        }

        Ok(data)
    }

    /// Bytes that can be read right now; for a listening endpoint, the
    /// number of connections waiting to be accepted.
    pub fn read_available(&self) -> Result<usize, TcpError> {
        let inner = self.inner.lock().unwrap();
        if inner.state == State::Listen {
            return Ok(inner
                .accept_queue
                .as_ref()
                .map(|queue| queue.count())
                .unwrap_or(0));
        }
        if inner.state == State::SynSent {
            return Ok(0);
        }

        let available = inner.receive_queue.available();
        if available == 0 && !inner.should_receive() {
            return Err(TcpError::NotConnected);
        }
        Ok(available)
    }

    // # Timer callbacks

    pub(crate) fn retransmit_timer_fired(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if self.retransmit_timer.is_armed() {
            // re-armed while the callback was on its way
            return;
        }
        if inner.state == State::Closed {
            return;
        }
        tracing::debug!(state = %inner.state, "retransmission timeout");

        if inner.state < State::Established {
            // retransmitting the SYN
            inner.retransmit_timeout = crate::SYN_RETRANSMIT_TIMEOUT;
            inner.congestion_window = inner.send_max_segment_size;
        } else {
            self.reset_slow_start(&mut inner);
            inner.duplicate_acknowledge_count = 0;
            // exponential back off
            inner.retransmit_timeout =
                (inner.retransmit_timeout * 2).min(crate::MAX_RETRANSMIT_TIMEOUT);
        }

        inner.send_next = inner.send_unacknowledged;
        let _ = self.send_queued(&mut inner, false);

        inner.recover = inner.send_next - 1;
        inner.flags.remove(EndpointFlags::RECOVERY);
    }

    pub(crate) fn persist_timer_fired(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        // the timer might not have been canceled early enough
        if inner.state == State::Closed {
            return;
        }
        tracing::trace!("persist timeout, probing the window");
        let _ = self.send_queued(&mut inner, true);
    }

    pub(crate) fn delayed_acknowledge_timer_fired(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::Closed {
            return;
        }
        let _ = self.send_acknowledge(&mut inner, true);
    }

    pub(crate) fn time_wait_timer_fired(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        tracing::trace!("time-wait expired");

        if !inner.flags.contains(EndpointFlags::CLOSED) {
            // the owner still holds the endpoint; it leaves the tables when
            // it is released
            inner.flags |= EndpointFlags::DELETE_ON_CLOSE;
            return;
        }

        drop(inner);
        self.manager.unbind(self);
    }

    /// Forces a pending timer to run its expiry action now, as if its
    /// deadline had passed. Only tests drive timers by hand.
    #[cfg(test)]
    pub(crate) fn expire_retransmit_timer(self: &Arc<Self>) {
        self.retransmit_timer.cancel();
        self.retransmit_timer_fired();
    }

    #[cfg(test)]
    pub(crate) fn expire_persist_timer(self: &Arc<Self>) {
        self.persist_timer.cancel();
        self.persist_timer_fired();
    }

    #[cfg(test)]
    pub(crate) fn expire_time_wait_timer(self: &Arc<Self>) {
        self.time_wait_timer.cancel();
        self.time_wait_timer_fired();
    }

    #[cfg(test)]
    pub(crate) fn persist_timer_is_armed(&self) -> bool {
        self.persist_timer.is_armed()
    }

    /// Coalesces ACKs: every other ACK goes out immediately, the rest after
    /// the delayed-ACK timeout.
    fn delayed_acknowledge(&self, inner: &mut Inner) {
        if self.delayed_acknowledge_timer.cancel() {
            // the timer was armed: this is the second ACK, send it now
            let _ = self.send_acknowledge(inner, true);
            return;
        }
        self.delayed_acknowledge_timer
            .schedule(crate::DELAYED_ACKNOWLEDGE_TIMEOUT);
    }
}

impl std::fmt::Debug for TcpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info();
        f.debug_struct("TcpEndpoint")
            .field("state", &info.state)
            .field("local", &info.local_address)
            .field("peer", &info.peer_address)
            .field("send_queued", &info.send_queued)
            .field("receive_available", &info.receive_available)
            .finish()
    }
}
