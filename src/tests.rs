//! End-to-end connection scenarios.
//!
//! The harness is a queued loopback transport: segments sent by an endpoint
//! are decoded into a trace and parked in a queue, and [`TestNet::pump`]
//! delivers them back into the manager one at a time. Delivery never
//! happens on the sending thread, so the endpoint locks are free by the
//! time a segment is processed, and tests decide exactly which segments
//! arrive, in which order, and which are lost.

use crate::config::SocketConfig;
use crate::endpoint::{ReadFlags, SendFlags, State, TcpEndpoint};
use crate::errors::TcpError;
use crate::manager::{EndpointManager, Family, Route, Router, TcpStack};
use crate::message::Message;
use crate::segment::{Control, SegmentHeader, SegmentOptions};
use crate::seq::Seq;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// A decoded copy of a segment that crossed the test network.
#[derive(Debug, Clone)]
struct Record {
    source: SocketAddr,
    destination: SocketAddr,
    header: SegmentHeader,
    size: usize,
    raw: Message,
}

struct TestNet {
    mtu: usize,
    manager: Mutex<Option<Arc<EndpointManager>>>,
    queue: Mutex<VecDeque<(SocketAddr, SocketAddr, Message)>>,
    trace: Mutex<Vec<Record>>,
}

impl TestNet {
    fn new(mtu: usize) -> Arc<Self> {
        Arc::new(Self {
            mtu,
            manager: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            trace: Mutex::new(Vec::new()),
        })
    }

    fn attach(&self, manager: Arc<EndpointManager>) {
        *self.manager.lock().unwrap() = Some(manager);
    }

    /// Delivers every queued segment (including ones queued as a result of
    /// the deliveries) and returns how many were processed.
    fn pump(&self) -> usize {
        self.pump_filtered(|_, _| true)
    }

    /// Like [`TestNet::pump`], but drops segments the filter rejects. The
    /// filter sees the decoded header and the payload length.
    fn pump_filtered(&self, mut keep: impl FnMut(&SegmentHeader, usize) -> bool) -> usize {
        let manager = self.manager.lock().unwrap().clone().expect("no manager attached");
        let mut delivered = 0;
        loop {
            let Some((source, destination, datagram)) = self.queue.lock().unwrap().pop_front()
            else {
                return delivered;
            };

            let mut copy = datagram.clone();
            let header = SegmentHeader::parse(&mut copy, source.ip(), destination.ip())
                .expect("undecodable segment on the loopback");
            if !keep(&header, copy.len()) {
                continue;
            }

            let _ = manager.receive_data(source.ip(), destination.ip(), datagram);
            delivered += 1;
        }
    }

    fn records(&self) -> Vec<Record> {
        self.trace.lock().unwrap().clone()
    }

    fn record_count(&self) -> usize {
        self.trace.lock().unwrap().len()
    }

    fn clear_queue(&self) {
        self.queue.lock().unwrap().clear();
    }
}

impl Router for TestNet {
    fn route(&self, _peer: &SocketAddr) -> Option<Route> {
        Some(Route {
            interface_address: "127.0.0.1:0".parse().unwrap(),
            is_local: true,
            mtu: self.mtu,
        })
    }

    fn send(
        &self,
        source: SocketAddr,
        destination: SocketAddr,
        segment: Message,
    ) -> Result<(), TcpError> {
        let mut copy = segment.clone();
        let header = SegmentHeader::parse(&mut copy, source.ip(), destination.ip())
            .expect("endpoint produced an undecodable segment");
        self.trace.lock().unwrap().push(Record {
            source,
            destination,
            header,
            size: copy.len(),
            raw: segment.clone(),
        });
        self.queue
            .lock()
            .unwrap()
            .push_back((source, destination, segment));
        Ok(())
    }
}

fn loopback(mtu: usize) -> (Arc<EndpointManager>, Arc<TestNet>) {
    let net = TestNet::new(mtu);
    let manager = EndpointManager::new(Family::V4, Arc::clone(&net) as Arc<dyn Router>);
    net.attach(Arc::clone(&manager));
    (manager, net)
}

/// Builds a raw segment and feeds it into the manager, as if a remote peer
/// had sent it.
fn inject(
    manager: &EndpointManager,
    from: SocketAddr,
    to: SocketAddr,
    payload: &[u8],
    build: impl FnOnce(&mut SegmentHeader),
) {
    let mut header = SegmentHeader::new(Control::empty());
    header.source_port = from.port();
    header.destination_port = to.port();
    build(&mut header);

    let mut datagram = Message::new(payload.to_vec());
    header.write_to(&mut datagram, from.ip(), to.ip());
    let _ = manager.receive_data(from.ip(), to.ip(), datagram);
}

/// Establishes a loopback connection pair: a listener child and a client.
fn established_pair(
    manager: &Arc<EndpointManager>,
    net: &TestNet,
    config: SocketConfig,
) -> (Arc<TcpEndpoint>, Arc<TcpEndpoint>) {
    let listener = manager.open(config.clone());
    listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.listen(8).unwrap();
    let server_address = listener.local_address();

    let client = manager.open(config);
    assert_eq!(
        client.connect(server_address),
        Err(TcpError::ConnectionInProgress)
    );
    net.pump();

    assert_eq!(client.state(), State::Established);
    let child = listener.accept().unwrap();
    assert_eq!(child.state(), State::Established);
    (client, child)
}

/// Establishes a connection against a hand-driven fake peer and returns the
/// client together with the peer's address and the client's ISS.
fn established_against_fake_peer(
    manager: &Arc<EndpointManager>,
    net: &TestNet,
    peer: SocketAddr,
    window: u16,
) -> (Arc<TcpEndpoint>, Seq) {
    let client = manager.open(SocketConfig::non_blocking());
    assert_eq!(client.connect(peer), Err(TcpError::ConnectionInProgress));

    let records = net.records();
    let syn = &records[records.len() - 1];
    assert!(syn.header.control.contains(Control::SYN));
    let iss = syn.header.sequence;
    net.clear_queue();

    let local = client.local_address();
    inject(manager, peer, local, &[], |header| {
        header.control = Control::SYN | Control::ACK;
        header.sequence = Seq::new(5_000);
        header.acknowledge = iss + 1;
        header.advertised_window = window;
        header.max_segment_size = 536;
    });
    assert_eq!(client.state(), State::Established);
    net.clear_queue();

    (client, iss)
}

#[test]
fn three_way_handshake_over_loopback() {
    let (manager, net) = loopback(1500);

    let listener = manager.open(SocketConfig::non_blocking());
    listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.listen(4).unwrap();
    let server_address = listener.local_address();
    assert!(server_address.port() > crate::FIRST_EPHEMERAL_PORT);

    let client = manager.open(SocketConfig::non_blocking());
    assert_eq!(
        client.connect(server_address),
        Err(TcpError::ConnectionInProgress)
    );
    assert_eq!(client.state(), State::SynSent);

    net.pump();

    assert_eq!(client.state(), State::Established);
    let child = listener.accept().unwrap();
    assert_eq!(child.state(), State::Established);
    assert_eq!(child.peer_address(), client.local_address());

    // the wire trace is SYN, SYN+ACK, ACK with matching sequence numbers
    let records = net.records();
    assert_eq!(records.len(), 3);

    let syn = &records[0].header;
    assert!(syn.control.contains(Control::SYN) && !syn.control.contains(Control::ACK));
    assert!(syn.max_segment_size > 0);

    let syn_ack = &records[1].header;
    assert!(syn_ack.control.contains(Control::SYN | Control::ACK));
    assert_eq!(syn_ack.acknowledge, syn.sequence + 1);

    let ack = &records[2].header;
    assert!(ack.control.contains(Control::ACK) && !ack.control.contains(Control::SYN));
    assert_eq!(ack.sequence, syn.sequence + 1);
    assert_eq!(ack.acknowledge, syn_ack.sequence + 1);

    // the initial congestion window is a small multiple of the negotiated
    // maximum segment size
    for endpoint in [&client, &child] {
        let info = endpoint.info();
        let expected = match info.max_segment_size {
            mss if mss > 2190 => 2 * mss,
            mss if mss > 1095 => 3 * mss,
            mss => 4 * mss,
        };
        assert_eq!(info.congestion_window, expected);
    }
}

#[test]
fn connecting_to_a_dead_port_is_refused() {
    let (manager, net) = loopback(1500);

    let client = manager.open(SocketConfig::non_blocking());
    assert_eq!(
        client.connect("127.0.0.1:44321".parse().unwrap()),
        Err(TcpError::ConnectionInProgress)
    );

    net.pump();

    assert_eq!(client.state(), State::Closed);
    assert_eq!(client.error(), Some(TcpError::ConnectionRefused));
}

#[test]
fn data_round_trip_preserves_order() {
    let (manager, net) = loopback(1500);
    let (client, child) = established_pair(&manager, &net, SocketConfig::non_blocking());

    let chunks: [&[u8]; 3] = [b"never ", b"gonna ", b"give you up"];
    for chunk in chunks {
        client.send_data(Message::new(chunk), SendFlags::empty()).unwrap();
        net.pump();
    }

    let mut received = Vec::new();
    loop {
        match child.read_data(4, ReadFlags::empty()) {
            Ok(data) if data.is_empty() => break,
            Ok(data) => received.extend(data.to_vec()),
            Err(TcpError::WouldBlock) => break,
            Err(error) => panic!("read failed: {error}"),
        }
    }
    assert_eq!(received, b"never gonna give you up");

    // and the other direction
    child
        .send_data(Message::new(b"hello back".as_slice()), SendFlags::empty())
        .unwrap();
    net.pump();
    let reply = client.read_data(64, ReadFlags::empty()).unwrap();
    assert_eq!(reply.to_vec(), b"hello back");

    // everything got acknowledged along the way
    net.pump();
    assert_eq!(client.info().send_queued, 0);
    assert_eq!(child.info().send_queued, 0);
}

#[test]
fn peeking_leaves_data_in_place() {
    let (manager, net) = loopback(1500);
    let (client, child) = established_pair(&manager, &net, SocketConfig::non_blocking());

    client
        .send_data(Message::new(b"payload".as_slice()), SendFlags::empty())
        .unwrap();
    net.pump();

    let peeked = child.read_data(64, ReadFlags::PEEK).unwrap();
    assert_eq!(peeked.to_vec(), b"payload");
    let read = child.read_data(64, ReadFlags::empty()).unwrap();
    assert_eq!(read.to_vec(), b"payload");
    assert_eq!(child.read_data(64, ReadFlags::empty()), Err(TcpError::WouldBlock));
}

#[test]
fn out_of_order_segments_are_reassembled() {
    let (manager, net) = loopback(1500);
    let (client, child) = established_pair(&manager, &net, SocketConfig::non_blocking());

    let first_sequence = client.info().send_next;
    client
        .send_data(Message::new(b"first-".as_slice()), SendFlags::empty())
        .unwrap();
    client
        .send_data(Message::new(b"second".as_slice()), SendFlags::empty())
        .unwrap();

    // lose the first chunk in transit; the second arrives out of order
    net.pump_filtered(|header, size| !(size > 0 && header.sequence == first_sequence));
    assert_eq!(child.info().receive_available, 0);

    // the receiver immediately re-acknowledged the old edge to provoke a
    // fast retransmit
    let duplicate_acks = net
        .records()
        .iter()
        .filter(|record| {
            record.size == 0
                && record.header.control == Control::ACK
                && record.header.acknowledge == first_sequence
        })
        .count();
    assert!(duplicate_acks >= 1);

    // replay the lost chunk; the stream heals
    let lost = net
        .records()
        .into_iter()
        .find(|record| record.size > 0 && record.header.sequence == first_sequence)
        .unwrap();
    let _ = manager.receive_data(lost.source.ip(), lost.destination.ip(), lost.raw);
    net.pump();

    let data = child.read_data(64, ReadFlags::empty()).unwrap();
    assert_eq!(data.to_vec(), b"first-second");
}

#[test]
fn graceful_close_and_half_close_indication() {
    let (manager, net) = loopback(1500);
    let (client, child) = established_pair(&manager, &net, SocketConfig::non_blocking());

    client
        .send_data(Message::new(b"last words".as_slice()), SendFlags::empty())
        .unwrap();
    client.close().unwrap();
    net.pump();

    // the peer sees the data, then the half-close
    assert_eq!(child.state(), State::CloseWait);
    let data = child.read_data(64, ReadFlags::empty()).unwrap();
    assert_eq!(data.to_vec(), b"last words");
    let end = child.read_data(64, ReadFlags::empty()).unwrap();
    assert!(end.is_empty());

    // our FIN is acknowledged
    assert_eq!(client.state(), State::FinWait2);

    // the peer closes too
    child.close().unwrap();
    net.pump();
    assert_eq!(client.state(), State::TimeWait);
    assert_eq!(child.state(), State::Closed);
}

#[test]
fn time_wait_ignores_resets_and_expires() {
    let (manager, net) = loopback(1500);
    let (client, child) = established_pair(&manager, &net, SocketConfig::non_blocking());
    let client_address = client.local_address();
    let child_address = child.local_address();

    client.close().unwrap();
    net.pump();
    child.close().unwrap();
    net.pump();
    assert_eq!(client.state(), State::TimeWait);

    client.release();

    // the endpoint stays reachable for stray segments of the old
    // connection
    assert!(manager
        .find_connection(client_address, child_address)
        .is_some());

    // a blind reset during the quiet time is ignored (RFC 1337)
    let expected = client.info().receive_next;
    inject(&manager, child_address, client_address, &[], |header| {
        header.control = Control::RST;
        header.sequence = expected;
    });
    assert_eq!(client.state(), State::TimeWait);

    // a retransmitted FIN restarts the quiet time and is acknowledged again
    let fin = net
        .records()
        .into_iter()
        .find(|record| {
            record.source == child_address && record.header.control.contains(Control::FIN)
        })
        .unwrap();
    let before = net.record_count();
    let _ = manager.receive_data(fin.source.ip(), fin.destination.ip(), fin.raw);
    assert_eq!(client.state(), State::TimeWait);
    assert!(net.record_count() > before);

    // once 2 MSL pass, the endpoint disappears and its port is free again
    client.expire_time_wait_timer();
    assert!(manager
        .find_connection(client_address, child_address)
        .is_none());

    let replacement = manager.open(SocketConfig::default());
    replacement.bind(client_address).unwrap();
}

#[test]
fn retransmission_resets_slow_start() {
    let (manager, net) = loopback(556);
    let peer: SocketAddr = "10.0.7.7:80".parse().unwrap();
    let (client, _iss) = established_against_fake_peer(&manager, &net, peer, u16::MAX);

    let info = client.info();
    let mss = info.max_segment_size;
    assert_eq!(mss, 536);
    assert_eq!(info.congestion_window, 4 * mss);
    let timeout_before = info.retransmit_timeout;

    // ten segments' worth of data; the initial window lets four out
    client
        .send_data(Message::new(vec![7u8; 10 * mss as usize]), SendFlags::empty())
        .unwrap();
    let sent: Vec<_> = net
        .records()
        .into_iter()
        .filter(|record| record.size > 0)
        .collect();
    assert_eq!(sent.len(), 4);
    let flight = client.info().send_max - client.info().send_unacknowledged;
    assert_eq!(flight, 4 * mss);
    net.clear_queue();

    // no acknowledgement ever comes back
    client.expire_retransmit_timer();

    let info = client.info();
    assert_eq!(info.slow_start_threshold, (flight / 2).max(2 * mss));
    assert_eq!(info.congestion_window, mss);
    assert_eq!(info.retransmit_timeout, timeout_before * 2);

    // exactly one segment went out again, from the left edge
    let retransmitted: Vec<_> = net
        .records()
        .into_iter()
        .skip(sent.len() + 2)
        .filter(|record| record.size > 0)
        .collect();
    assert_eq!(retransmitted.len(), 1);
    assert_eq!(retransmitted[0].header.sequence, info.send_unacknowledged);
    assert_eq!(retransmitted[0].size, mss as usize);
}

#[test]
fn three_duplicate_acks_trigger_fast_retransmit() {
    let (manager, net) = loopback(556);
    let peer: SocketAddr = "10.0.7.7:80".parse().unwrap();
    let (client, iss) = established_against_fake_peer(&manager, &net, peer, u16::MAX);
    let local = client.local_address();
    let mss = client.info().max_segment_size;

    // six segments of data; the congestion window admits four at first
    client
        .send_data(Message::new(vec![3u8; 6 * mss as usize]), SendFlags::empty())
        .unwrap();
    assert_eq!(
        net.records().iter().filter(|record| record.size > 0).count(),
        4
    );

    // the first segment is acknowledged normally, which also lets the last
    // two segments out
    let edge = iss + 1 + mss;
    inject(&manager, peer, local, &[], |header| {
        header.control = Control::ACK;
        header.sequence = Seq::new(5_001);
        header.acknowledge = edge;
        header.advertised_window = u16::MAX;
    });
    assert_eq!(
        net.records().iter().filter(|record| record.size > 0).count(),
        6
    );
    net.clear_queue();
    let before = net.record_count();

    // segment two was lost; every later segment produces a duplicate ACK
    for _ in 0..3 {
        inject(&manager, peer, local, &[], |header| {
            header.control = Control::ACK;
            header.sequence = Seq::new(5_001);
            header.acknowledge = edge;
            header.advertised_window = u16::MAX;
        });
    }

    let info = client.info();
    assert_eq!(info.duplicate_acknowledge_count, 3);
    assert!(info.in_recovery);
    assert_eq!(
        info.congestion_window,
        info.slow_start_threshold + 3 * mss
    );

    // exactly one retransmission, at the left window edge
    let resent: Vec<_> = net
        .records()
        .into_iter()
        .skip(before)
        .filter(|record| record.size > 0)
        .collect();
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].header.sequence, edge);
    assert_eq!(resent[0].header.sequence, info.send_unacknowledged);
}

#[test]
fn zero_window_peer_is_probed() {
    let (manager, net) = loopback(556);
    let peer: SocketAddr = "10.0.7.7:80".parse().unwrap();
    let (client, _iss) = established_against_fake_peer(&manager, &net, peer, 0);
    let local = client.local_address();

    client
        .send_data(Message::new(b"pent up".as_slice()), SendFlags::empty())
        .unwrap();

    // nothing can be sent, so the persist timer is pending instead
    assert_eq!(net.records().iter().filter(|r| r.size > 0).count(), 0);
    assert!(client.persist_timer_is_armed());

    // the probe is a bare segment that keeps the connection alive
    let before = net.record_count();
    client.expire_persist_timer();
    let records = net.records();
    assert_eq!(records.len(), before + 1);
    assert_eq!(records[before].size, 0);

    // the peer finally opens its window and the data flows
    inject(&manager, peer, local, &[], |header| {
        header.control = Control::ACK;
        header.sequence = Seq::new(5_001);
        header.acknowledge = client.info().send_unacknowledged;
        header.advertised_window = u16::MAX;
    });
    client.expire_persist_timer();
    assert!(net
        .records()
        .iter()
        .any(|record| record.size == b"pent up".len()));
}

#[test]
fn old_timestamps_are_rejected() {
    let (manager, net) = loopback(1500);
    let (client, child) = established_pair(&manager, &net, SocketConfig::non_blocking());
    let client_address = client.local_address();
    let child_address = child.local_address();

    // move the timestamp clock forward, then refresh the peer's notion of
    // our clock with a real segment
    thread::sleep(Duration::from_millis(50));
    client
        .send_data(Message::new(b"fresh".as_slice()), SendFlags::empty())
        .unwrap();
    net.pump();
    child.read_data(64, ReadFlags::empty()).unwrap();

    // let any delayed acknowledgement fire before counting records
    thread::sleep(Duration::from_millis(150));
    net.pump();

    let before = net.record_count();
    let expected = child.info().receive_next;

    // a segment whose timestamp is far in the peer's past fails PAWS
    inject(&manager, client_address, child_address, b"stale", |header| {
        header.control = Control::ACK;
        header.sequence = expected;
        header.acknowledge = child.info().send_next;
        header.advertised_window = 4096;
        header.options = SegmentOptions::TIMESTAMPS;
        header.timestamp_value = 1;
    });

    assert_eq!(child.info().receive_available, 0);
    // the drop is announced with an immediate ACK
    assert!(net.record_count() > before);

    // a segment with no timestamp at all is dropped silently
    let before = net.record_count();
    inject(&manager, client_address, child_address, b"naked", |header| {
        header.control = Control::ACK;
        header.sequence = expected;
        header.acknowledge = child.info().send_next;
        header.advertised_window = 4096;
    });
    assert_eq!(child.info().receive_available, 0);
    assert_eq!(net.record_count(), before);
}

#[test]
fn simultaneous_open_reaches_syn_received() {
    let (manager, net) = loopback(1500);
    let peer: SocketAddr = "10.0.7.7:4000".parse().unwrap();

    let client = manager.open(SocketConfig::non_blocking());
    assert_eq!(client.connect(peer), Err(TcpError::ConnectionInProgress));
    let local = client.local_address();
    net.clear_queue();

    // the peer's own SYN crosses ours on the wire
    let before = net.record_count();
    inject(&manager, peer, local, &[], |header| {
        header.control = Control::SYN;
        header.sequence = Seq::new(9_000);
        header.advertised_window = 4096;
        header.max_segment_size = 536;
    });

    assert_eq!(client.state(), State::SynReceived);
    // our reply acknowledges the peer's SYN
    let records = net.records();
    assert!(records.len() > before);
    let reply = &records[records.len() - 1].header;
    assert!(reply.control.contains(Control::ACK));
    assert_eq!(reply.acknowledge, Seq::new(9_001));
}

#[test]
fn full_send_queue_refuses_more_data() {
    let (manager, net) = loopback(1500);

    let listener = manager.open(SocketConfig::non_blocking());
    listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.listen(4).unwrap();

    let client = manager.open(SocketConfig {
        send_buffer_size: 1024,
        send_low_water_mark: 512,
        ..SocketConfig::non_blocking()
    });
    assert_eq!(
        client.connect(listener.local_address()),
        Err(TcpError::ConnectionInProgress)
    );
    net.pump();
    assert_eq!(client.state(), State::Established);

    // everything beyond the queue cap has to wait, which a non-blocking
    // endpoint reports as WouldBlock
    let result = client.send_data(Message::new(vec![0u8; 4096]), SendFlags::empty());
    assert_eq!(result, Err(TcpError::WouldBlock));
}

#[test]
fn blocking_accept_wakes_on_connection() {
    let (manager, net) = loopback(1500);

    let listener = manager.open(SocketConfig::default());
    listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.listen(4).unwrap();
    let server_address = listener.local_address();

    let acceptor = {
        let listener = Arc::clone(&listener);
        thread::spawn(move || listener.accept())
    };

    let client = manager.open(SocketConfig::non_blocking());
    assert_eq!(
        client.connect(server_address),
        Err(TcpError::ConnectionInProgress)
    );
    // drive the handshake until the acceptor comes back
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !acceptor.is_finished() {
        net.pump();
        assert!(std::time::Instant::now() < deadline, "accept never woke up");
        thread::sleep(Duration::from_millis(1));
    }

    let child = acceptor.join().unwrap().unwrap();
    assert_eq!(child.state(), State::Established);
    assert_eq!(child.peer_address(), client.local_address());
}

#[test]
fn interrupt_wakes_a_blocked_reader() {
    let (manager, net) = loopback(1500);

    // the listener (and thus the spawned child) blocks; the client does not
    let listener = manager.open(SocketConfig::default());
    listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.listen(4).unwrap();

    let client = manager.open(SocketConfig::non_blocking());
    assert_eq!(
        client.connect(listener.local_address()),
        Err(TcpError::ConnectionInProgress)
    );
    net.pump();
    let child = listener.accept().unwrap();

    let reader = {
        let child = Arc::clone(&child);
        thread::spawn(move || child.read_data(16, ReadFlags::empty()))
    };

    // give the reader time to block, then interrupt it
    thread::sleep(Duration::from_millis(50));
    child.interrupt();
    assert_eq!(reader.join().unwrap(), Err(TcpError::Interrupted));
}

#[test]
fn shutdown_read_discards_incoming_data() {
    let (manager, net) = loopback(1500);
    let (client, child) = established_pair(&manager, &net, SocketConfig::non_blocking());

    child.shutdown(crate::Shutdown::Read).unwrap();
    client
        .send_data(Message::new(b"into the void".as_slice()), SendFlags::empty())
        .unwrap();
    net.pump();

    // the payload was consumed without being stored
    assert_eq!(child.info().receive_available, 0);
    let read = child.read_data(64, ReadFlags::empty()).unwrap();
    assert!(read.is_empty());

    // the sender's data was still acknowledged, once the delayed ACK fires
    thread::sleep(Duration::from_millis(200));
    net.pump();
    assert_eq!(client.info().send_queued, 0);
}

#[test]
fn urgent_send_forces_a_segment_out() {
    let (manager, net) = loopback(1500);
    let (client, _child) = established_pair(&manager, &net, SocketConfig::non_blocking());

    let before = net.record_count();
    client
        .send_data(Message::new(b"!".as_slice()), SendFlags::OOB)
        .unwrap();

    let records = net.records();
    assert!(records.len() > before);
    let urgent = &records[records.len() - 1].header;
    assert!(urgent.control.contains(Control::URG));
    assert_eq!(urgent.urgent_offset, 1);
}

#[test]
fn stack_routes_by_address_family() {
    let net = TestNet::new(1500);
    let stack = TcpStack::new(Arc::clone(&net) as Arc<dyn Router>);
    net.attach(stack.manager_for(Family::V4));

    let listener = stack.open(Family::V4, SocketConfig::non_blocking());
    listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.listen(1).unwrap();

    let client = stack.open(Family::V4, SocketConfig::non_blocking());
    assert_eq!(
        client.connect(listener.local_address()),
        Err(TcpError::ConnectionInProgress)
    );
    net.pump();
    assert_eq!(client.state(), State::Established);

    assert!(stack
        .snapshot()
        .iter()
        .any(|info| info.state == State::Established));

    // binding a v6 address through a v4 endpoint is refused
    let wrong = stack.open(Family::V4, SocketConfig::non_blocking());
    assert_eq!(
        wrong.bind("[::1]:9000".parse().unwrap()),
        Err(TcpError::AddressFamilyUnsupported)
    );
}
