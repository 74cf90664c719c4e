//! Connection demultiplexing, port allocation, and inbound dispatch.
//!
//! One [`EndpointManager`] exists per address family. It owns two tables: a
//! connection table keyed by the `(local, peer)` address pair, and a port
//! table mapping a local port to every endpoint bound to it (several
//! endpoints may share a port as long as their full tuples differ). Both
//! live under a single readers-writer lock: reads for packet lookup, writes
//! for bind, unbind, and connection registration.
//!
//! Lock ordering: the table lock is never held while acquiring an endpoint
//! lock. The bind collision scan therefore inspects other endpoints only
//! through their lock-free state and address accessors.

use crate::config::SocketConfig;
use crate::endpoint::{system_time, State, TcpEndpoint};
use crate::errors::TcpError;
use crate::message::Message;
use crate::segment::{Control, SegmentAction, SegmentHeader};
use dashmap::DashMap;
use rustc_hash::FxHashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

/// The address family a manager serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(address: &SocketAddr) -> Family {
        Self::of_ip(&address.ip())
    }

    pub fn of_ip(address: &IpAddr) -> Family {
        match address {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// The all-zero address with port zero; used both as "unbound" and as
    /// the wildcard side of a passive connection.
    pub fn unspecified(self) -> SocketAddr {
        match self {
            Family::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            Family::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        }
    }

    pub fn loopback(self) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Family::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }
}

/// What the routing layer knows about a destination.
#[derive(Debug, Clone)]
pub struct Route {
    /// The local address of the interface the route leaves through.
    pub interface_address: SocketAddr,
    /// Whether the destination is this host (loopback).
    pub is_local: bool,
    /// The path MTU; the maximum segment size is derived from it.
    pub mtu: usize,
}

/// The lower layer the core hands datagrams to.
///
/// `send` receives a fully encoded TCP segment. Implementations must not
/// call back into the stack synchronously from `send`: a loopback transport
/// queues the segment and delivers it from another context, otherwise the
/// sender's endpoint lock would still be held during delivery.
pub trait Router: Send + Sync {
    fn route(&self, peer: &SocketAddr) -> Option<Route>;
    fn send(
        &self,
        source: SocketAddr,
        destination: SocketAddr,
        segment: Message,
    ) -> Result<(), TcpError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ConnectionKey {
    local: SocketAddr,
    peer: SocketAddr,
}

struct Tables {
    connections: FxHashMap<ConnectionKey, Arc<TcpEndpoint>>,
    ports: FxHashMap<u16, Vec<Arc<TcpEndpoint>>>,
    last_ephemeral_port: u16,
}

enum PortScan {
    Free,
    InUse,
    /// A local connection on the same address is still draining; worth a
    /// short wait before giving up.
    ClosingLocal,
}

/// The per-family endpoint registry.
pub struct EndpointManager {
    family: Family,
    router: Arc<dyn Router>,
    tables: RwLock<Tables>,
}

impl EndpointManager {
    pub fn new(family: Family, router: Arc<dyn Router>) -> Arc<Self> {
        Arc::new(Self {
            family,
            router,
            tables: RwLock::new(Tables {
                connections: FxHashMap::default(),
                ports: FxHashMap::default(),
                last_ephemeral_port: crate::FIRST_EPHEMERAL_PORT,
            }),
        })
    }

    /// Creates a fresh endpoint owned by this manager.
    pub fn open(self: &Arc<Self>, config: SocketConfig) -> Arc<TcpEndpoint> {
        TcpEndpoint::new(Arc::clone(self), config)
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    // # Connections

    fn lookup_connection(
        tables: &Tables,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Option<Arc<TcpEndpoint>> {
        tables.connections.get(&ConnectionKey { local, peer }).cloned()
    }

    /// Registers the `(local, peer)` pair of an actively opened connection.
    /// A wildcard local address is completed from the route's interface,
    /// keeping the chosen port.
    pub(crate) fn set_connection(
        &self,
        endpoint: &Arc<TcpEndpoint>,
        peer: SocketAddr,
        interface_local: SocketAddr,
    ) -> Result<(), TcpError> {
        let mut tables = self.tables.write().unwrap();

        let mut local = endpoint.local_address();
        if local.ip().is_unspecified() {
            local = SocketAddr::new(interface_local.ip(), local.port());
        }

        let key = ConnectionKey { local, peer };
        if tables.connections.contains_key(&key) {
            return Err(TcpError::AddressInUse);
        }

        // The same endpoint may be reopened against a different peer after
        // a failed or closed connection; drop any stale registration first.
        tables
            .connections
            .retain(|_, entry| !Arc::ptr_eq(entry, endpoint));

        endpoint.set_local_address(local);
        endpoint.set_peer_address(peer);
        tracing::trace!(%local, %peer, "connection registered");

        tables.connections.insert(key, Arc::clone(endpoint));
        Ok(())
    }

    /// Registers a listening endpoint under `(local, *)`, binding it to an
    /// ephemeral port first when it is not yet bound.
    pub(crate) fn set_passive(&self, endpoint: &Arc<TcpEndpoint>) -> Result<(), TcpError> {
        let mut tables = self.tables.write().unwrap();

        if !endpoint.is_bound() {
            self.bind_ephemeral_locked(&mut tables, endpoint, self.family.unspecified())?;
        }

        let wildcard = self.family.unspecified();
        let key = ConnectionKey {
            local: endpoint.local_address(),
            peer: wildcard,
        };
        if tables.connections.contains_key(&key) {
            return Err(TcpError::AddressInUse);
        }

        endpoint.set_peer_address(wildcard);
        tables.connections.insert(key, Arc::clone(endpoint));
        Ok(())
    }

    /// Finds the endpoint an incoming segment belongs to: first the exact
    /// `(local, peer)` pair, then a listener on the local address, then a
    /// fully wildcard listener on the port.
    pub fn find_connection(
        &self,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Option<Arc<TcpEndpoint>> {
        let tables = self.tables.read().unwrap();
        let wildcard = self.family.unspecified();

        if let Some(endpoint) = Self::lookup_connection(&tables, local, peer) {
            return Some(endpoint);
        }
        if let Some(endpoint) = Self::lookup_connection(&tables, local, wildcard) {
            return Some(endpoint);
        }
        let local_wildcard = SocketAddr::new(wildcard.ip(), local.port());
        if let Some(endpoint) = Self::lookup_connection(&tables, local_wildcard, wildcard) {
            return Some(endpoint);
        }

        tracing::trace!(%local, %peer, "no matching endpoint");
        None
    }

    // # Binding

    /// Binds `endpoint` to `address`, allocating an ephemeral port when the
    /// requested port is zero.
    pub(crate) fn bind(
        &self,
        endpoint: &Arc<TcpEndpoint>,
        address: SocketAddr,
        config: &SocketConfig,
    ) -> Result<(), TcpError> {
        if Family::of(&address) != self.family {
            return Err(TcpError::AddressFamilyUnsupported);
        }

        if address.port() == 0 {
            let mut tables = self.tables.write().unwrap();
            return self.bind_ephemeral_locked(&mut tables, endpoint, address);
        }

        if address.port() <= crate::LAST_RESERVED_PORT && !config.privileged {
            return Err(TcpError::PermissionDenied);
        }

        let mut retries = 5;
        loop {
            let mut tables = self.tables.write().unwrap();
            match Self::scan_port_collisions(&tables, address, config) {
                PortScan::Free => return Self::bind_locked(&mut tables, endpoint, address),
                PortScan::InUse => return Err(TcpError::AddressInUse),
                PortScan::ClosingLocal if retries == 0 => {
                    // the local connection never went away; the port table
                    // tolerates the duplicate
                    return Self::bind_locked(&mut tables, endpoint, address);
                }
                PortScan::ClosingLocal => {
                    // wait for the closing connection to disappear. The
                    // table lock is dropped across the sleep; this is the
                    // only place that releases and re-acquires it.
                    drop(tables);
                    retries -= 1;
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    fn scan_port_collisions(
        tables: &Tables,
        address: SocketAddr,
        config: &SocketConfig,
    ) -> PortScan {
        let Some(users) = tables.ports.get(&address.port()) else {
            return PortScan::Free;
        };

        for user in users {
            let user_local = user.local_address();
            if !user_local.ip().is_unspecified() && user_local.ip() != address.ip() {
                continue;
            }

            // While the table lock is held the endpoint cannot go away; its
            // state and locality are read through the lock-free mirrors.
            let user_state = user.state_hint();
            if user.is_local() && (user_state > State::Established || user_state == State::Closed)
            {
                return PortScan::ClosingLocal;
            }

            if !config.reuse_address {
                return PortScan::InUse;
            }
            if user_state != State::TimeWait && user_state != State::Closed {
                return PortScan::InUse;
            }
        }
        PortScan::Free
    }

    /// Picks an ephemeral port, stepping pseudo-randomly from the previous
    /// allocation and skipping the reserved range.
    fn bind_ephemeral_locked(
        &self,
        tables: &mut Tables,
        endpoint: &Arc<TcpEndpoint>,
        address: SocketAddr,
    ) -> Result<(), TcpError> {
        let max = tables.last_ephemeral_port as u32 + 65536;

        for attempt in 1..5 {
            // a more or less random step; the last rotation goes port by
            // port so nothing is skipped
            let step = if attempt == 4 {
                1
            } else {
                (system_time() & 0x1f) as u32 + 1
            };
            let mut counter = tables.last_ephemeral_port as u32 + step;

            while counter < max {
                let mut port = (counter & 0xffff) as u16;
                if port <= crate::LAST_RESERVED_PORT {
                    port += crate::LAST_RESERVED_PORT;
                }

                tables.last_ephemeral_port = port;

                let occupied = tables
                    .ports
                    .get(&port)
                    .is_some_and(|users| !users.is_empty());
                if !occupied {
                    let address = SocketAddr::new(address.ip(), port);
                    tracing::trace!(%address, "ephemeral bind");
                    return Self::bind_locked(tables, endpoint, address);
                }

                counter += step;
            }
        }

        // every candidate was taken
        Err(TcpError::AddressInUse)
    }

    fn bind_locked(
        tables: &mut Tables,
        endpoint: &Arc<TcpEndpoint>,
        address: SocketAddr,
    ) -> Result<(), TcpError> {
        endpoint.set_local_address(address);
        tables
            .ports
            .entry(address.port())
            .or_default()
            .push(Arc::clone(endpoint));
        Ok(())
    }

    /// Inserts a spawned child endpoint, whose local address was already
    /// fixed by the listener, into the port table.
    pub(crate) fn bind_child(&self, endpoint: &Arc<TcpEndpoint>) -> Result<(), TcpError> {
        let mut tables = self.tables.write().unwrap();
        let address = endpoint.local_address();
        Self::bind_locked(&mut tables, endpoint, address)
    }

    /// Removes the endpoint from both tables. Returns whether it was still
    /// registered.
    pub(crate) fn unbind(&self, endpoint: &Arc<TcpEndpoint>) -> bool {
        if !endpoint.is_bound() {
            return false;
        }

        let mut tables = self.tables.write().unwrap();
        let port = endpoint.local_address().port();

        let mut removed = false;
        if let Some(users) = tables.ports.get_mut(&port) {
            if let Some(index) = users.iter().position(|user| Arc::ptr_eq(user, endpoint)) {
                users.remove(index);
                removed = true;
            }
            if users.is_empty() {
                tables.ports.remove(&port);
            }
        }
        tables
            .connections
            .retain(|_, entry| !Arc::ptr_eq(entry, endpoint));

        endpoint.set_local_address(self.family.unspecified());
        tracing::trace!(port, "endpoint unbound");
        removed
    }

    // # Inbound dispatch

    /// Synthesizes the RST reply RFC 793 prescribes for traffic that
    /// matches no connection. `source`/`destination` are the offending
    /// segment's addresses; `size` its payload length.
    pub fn reply_with_reset(
        &self,
        segment: &SegmentHeader,
        source: SocketAddr,
        destination: SocketAddr,
        size: usize,
    ) -> Result<(), TcpError> {
        tracing::trace!(%source, %destination, "sending reset");

        let mut reply = SegmentHeader::new(Control::RST);
        reply.source_port = destination.port();
        reply.destination_port = source.port();

        if !segment.control.contains(Control::ACK) {
            reply.control |= Control::ACK;
            reply.acknowledge = segment.sequence + size as u32;
            if segment
                .control
                .intersects(Control::SYN | Control::FIN)
            {
                reply.acknowledge += 1;
            }
        } else {
            reply.sequence = segment.acknowledge;
        }

        let mut buffer = Message::empty();
        reply.write_to(&mut buffer, destination.ip(), source.ip());
        self.router.send(destination, source, buffer)
    }

    /// Entry point for a received datagram whose IP header has already been
    /// stripped: decodes the segment, locates the endpoint, and obeys the
    /// action set the endpoint returns. Undecodable segments are dropped
    /// silently.
    pub fn receive_data(
        &self,
        source: IpAddr,
        destination: IpAddr,
        mut buffer: Message,
    ) -> Result<(), TcpError> {
        let mut segment = match SegmentHeader::parse(&mut buffer, source, destination) {
            Ok(segment) => segment,
            Err(error) => {
                tracing::debug!(%error, "dropping undecodable segment");
                return Err(TcpError::Invalid);
            }
        };

        let local = SocketAddr::new(destination, segment.destination_port);
        let peer = SocketAddr::new(source, segment.source_port);
        let size = buffer.len();

        let action = match self.find_connection(local, peer) {
            Some(endpoint) => endpoint.segment_received(&mut segment, buffer, local, peer),
            None if segment.control.contains(Control::RST) => SegmentAction::DROP,
            None => SegmentAction::DROP | SegmentAction::RESET,
        };

        if action.contains(SegmentAction::RESET) {
            self.reply_with_reset(&segment, peer, local, size)?;
        }
        // DROP needs no action of its own: the payload either moved into a
        // receive queue or goes out of scope here

        Ok(())
    }

    /// A diagnostic listing of every registered connection.
    pub fn snapshot(&self) -> Vec<crate::EndpointInfo> {
        let endpoints: Vec<_> = {
            let tables = self.tables.read().unwrap();
            tables.connections.values().cloned().collect()
        };
        endpoints.iter().map(|endpoint| endpoint.info()).collect()
    }
}

/// The per-host TCP instance: one [`EndpointManager`] per address family,
/// created on first use, plus the shared routing interface.
pub struct TcpStack {
    managers: DashMap<Family, Arc<EndpointManager>>,
    router: Arc<dyn Router>,
}

impl TcpStack {
    pub fn new(router: Arc<dyn Router>) -> Arc<Self> {
        Arc::new(Self {
            managers: DashMap::new(),
            router,
        })
    }

    pub fn manager_for(&self, family: Family) -> Arc<EndpointManager> {
        self.managers
            .entry(family)
            .or_insert_with(|| EndpointManager::new(family, Arc::clone(&self.router)))
            .clone()
    }

    /// Creates an endpoint for the given address family.
    pub fn open(&self, family: Family, config: SocketConfig) -> Arc<TcpEndpoint> {
        self.manager_for(family).open(config)
    }

    /// Dispatches a received datagram to the family's manager.
    pub fn receive_data(
        &self,
        source: IpAddr,
        destination: IpAddr,
        buffer: Message,
    ) -> Result<(), TcpError> {
        self.manager_for(Family::of_ip(&destination))
            .receive_data(source, destination, buffer)
    }

    /// A diagnostic listing across all families.
    pub fn snapshot(&self) -> Vec<crate::EndpointInfo> {
        self.managers
            .iter()
            .flat_map(|entry| entry.value().snapshot())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::Seq;
    use std::sync::Mutex;

    /// A router that accepts everything and records what was sent.
    struct RecordingRouter {
        sent: Mutex<Vec<(SocketAddr, SocketAddr, Message)>>,
    }

    impl RecordingRouter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<(SocketAddr, SocketAddr, Message)> {
            std::mem::take(&mut self.sent.lock().unwrap())
        }
    }

    impl Router for RecordingRouter {
        fn route(&self, _peer: &SocketAddr) -> Option<Route> {
            Some(Route {
                interface_address: "127.0.0.1:0".parse().unwrap(),
                is_local: true,
                mtu: 1500,
            })
        }

        fn send(
            &self,
            source: SocketAddr,
            destination: SocketAddr,
            segment: Message,
        ) -> Result<(), TcpError> {
            self.sent.lock().unwrap().push((source, destination, segment));
            Ok(())
        }
    }

    fn address(text: &str) -> SocketAddr {
        text.parse().unwrap()
    }

    #[test]
    fn explicit_bind_rejects_collisions() {
        let router = RecordingRouter::new();
        let manager = EndpointManager::new(Family::V4, router);

        let first = manager.open(SocketConfig::default());
        first.bind(address("127.0.0.1:5000")).unwrap();

        let second = manager.open(SocketConfig::default());
        assert_eq!(
            second.bind(address("127.0.0.1:5000")),
            Err(TcpError::AddressInUse)
        );

        // a different address on the same port is fine
        second.bind(address("127.0.0.2:5000")).unwrap();
    }

    #[test]
    fn wildcard_bind_conflicts_with_everything_on_the_port() {
        let router = RecordingRouter::new();
        let manager = EndpointManager::new(Family::V4, router);

        let bound = manager.open(SocketConfig::default());
        bound.bind(address("0.0.0.0:6000")).unwrap();

        let other = manager.open(SocketConfig::default());
        assert_eq!(
            other.bind(address("127.0.0.1:6000")),
            Err(TcpError::AddressInUse)
        );
    }

    #[test]
    fn reserved_ports_require_privilege() {
        let router = RecordingRouter::new();
        let manager = EndpointManager::new(Family::V4, router);

        let endpoint = manager.open(SocketConfig::default());
        assert_eq!(
            endpoint.bind(address("127.0.0.1:80")),
            Err(TcpError::PermissionDenied)
        );

        let privileged = manager.open(SocketConfig {
            privileged: true,
            ..SocketConfig::default()
        });
        privileged.bind(address("127.0.0.1:80")).unwrap();
    }

    #[test]
    fn ephemeral_ports_rotate() {
        let router = RecordingRouter::new();
        let manager = EndpointManager::new(Family::V4, router);

        let mut ports = Vec::new();
        let mut endpoints = Vec::new();
        for _ in 0..10 {
            let endpoint = manager.open(SocketConfig::default());
            endpoint.bind(address("127.0.0.1:0")).unwrap();
            ports.push(endpoint.local_address().port());
            endpoints.push(endpoint);
        }

        let mut distinct = ports.clone();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct.len(), ports.len());
        assert!(ports.iter().all(|&port| port > crate::FIRST_EPHEMERAL_PORT));
        assert!(ports.iter().any(|&port| port > crate::FIRST_EPHEMERAL_PORT + 32));
    }

    #[test]
    fn stray_segment_without_ack_gets_a_reset_acknowledging_it() {
        let router = RecordingRouter::new();
        let manager = EndpointManager::new(Family::V4, Arc::clone(&router) as Arc<dyn Router>);

        // a SYN to a port nobody listens on
        let mut syn = SegmentHeader::new(Control::SYN);
        syn.source_port = 4321;
        syn.destination_port = 9999;
        syn.sequence = Seq::new(1000);
        let mut datagram = Message::empty();
        syn.write_to(
            &mut datagram,
            "10.0.0.2".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
        );

        manager
            .receive_data(
                "10.0.0.2".parse().unwrap(),
                "10.0.0.1".parse().unwrap(),
                datagram,
            )
            .unwrap();

        let sent = router.take();
        assert_eq!(sent.len(), 1);
        let (source, destination, mut reply) = sent.into_iter().next().unwrap();
        assert_eq!(source, address("10.0.0.1:9999"));
        assert_eq!(destination, address("10.0.0.2:4321"));

        let header = SegmentHeader::parse(
            &mut reply,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
        )
        .unwrap();
        assert!(header.control.contains(Control::RST));
        assert!(header.control.contains(Control::ACK));
        // the SYN counts as one sequence unit
        assert_eq!(header.acknowledge, Seq::new(1001));
        assert_eq!(header.sequence, Seq::ZERO);
    }

    #[test]
    fn stray_segment_with_ack_gets_a_bare_reset() {
        let router = RecordingRouter::new();
        let manager = EndpointManager::new(Family::V4, Arc::clone(&router) as Arc<dyn Router>);

        let mut ack = SegmentHeader::new(Control::ACK);
        ack.source_port = 4321;
        ack.destination_port = 9999;
        ack.sequence = Seq::new(1000);
        ack.acknowledge = Seq::new(77_000);
        let mut datagram = Message::empty();
        ack.write_to(
            &mut datagram,
            "10.0.0.2".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
        );

        manager
            .receive_data(
                "10.0.0.2".parse().unwrap(),
                "10.0.0.1".parse().unwrap(),
                datagram,
            )
            .unwrap();

        let sent = router.take();
        assert_eq!(sent.len(), 1);
        let (_, _, mut reply) = sent.into_iter().next().unwrap();
        let header = SegmentHeader::parse(
            &mut reply,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
        )
        .unwrap();
        assert!(header.control.contains(Control::RST));
        assert!(!header.control.contains(Control::ACK));
        assert_eq!(header.sequence, Seq::new(77_000));
    }

    #[test]
    fn inbound_resets_to_nowhere_are_ignored() {
        let router = RecordingRouter::new();
        let manager = EndpointManager::new(Family::V4, Arc::clone(&router) as Arc<dyn Router>);

        let mut rst = SegmentHeader::new(Control::RST);
        rst.source_port = 4321;
        rst.destination_port = 9999;
        let mut datagram = Message::empty();
        rst.write_to(
            &mut datagram,
            "10.0.0.2".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
        );

        manager
            .receive_data(
                "10.0.0.2".parse().unwrap(),
                "10.0.0.1".parse().unwrap(),
                datagram,
            )
            .unwrap();
        assert!(router.take().is_empty());
    }

    #[test]
    fn corrupted_datagrams_are_dropped() {
        let router = RecordingRouter::new();
        let manager = EndpointManager::new(Family::V4, Arc::clone(&router) as Arc<dyn Router>);

        let mut syn = SegmentHeader::new(Control::SYN);
        syn.source_port = 4321;
        syn.destination_port = 9999;
        let mut datagram = Message::empty();
        syn.write_to(
            &mut datagram,
            "10.0.0.2".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
        );
        let mut bytes = datagram.to_vec();
        bytes[4] ^= 0xff;

        let result = manager.receive_data(
            "10.0.0.2".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            Message::new(bytes),
        );
        assert_eq!(result, Err(TcpError::Invalid));
        assert!(router.take().is_empty());
    }
}
