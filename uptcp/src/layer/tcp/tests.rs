//! Whole connections against a scripted peer.
//!
//! The peer is played by injecting segments into a capturing loopback device, everything the
//! endpoint answers is parsed back from the frames it transmitted.
use crate::config::Config;
use crate::managed::Key;
use crate::nic::loopback::{Frame, Loopback};
use crate::readiness::{Ctl, Event, Events};
use crate::socket::{Errno, SocketId, Stack};
use crate::time::{Duration, Instant};
use crate::wire::{Ipv4Address, SocketAddr};
use crate::wire::tcp::{Checksum, Flags, Packet, Repr, SeqNumber};

use super::connection::{CloseReason, State, Stream};
use super::endpoint::Endpoint;
use super::table::FourTuple;

const LOCAL: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
const REMOTE: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);
const LOCAL_PORT: u16 = 80;
const REMOTE_PORT: u16 = 4000;

const NOW: Option<Duration> = Some(Duration::from_millis(0));

fn config() -> Config {
    let mut config = Config::default();
    config.max_concurrency = 16;
    config.max_buffers = 8;
    config.flow_bins = 64;
    config.listener_bins = 8;
    config.local_addr = LOCAL;
    config
}

fn tuple() -> FourTuple {
    FourTuple {
        local: SocketAddr::new(LOCAL, LOCAL_PORT),
        remote: SocketAddr::new(REMOTE, REMOTE_PORT),
    }
}

/// A segment as the endpoint sent it.
#[derive(Debug)]
struct Sent {
    repr: Repr,
    payload: Vec<u8>,
}

impl Sent {
    fn parse(frame: &Frame) -> Self {
        let packet = Packet::new_checked(&frame.payload[..]).unwrap();
        let checksum = Checksum::Manual { src_addr: frame.src, dst_addr: frame.dst };
        let repr = Repr::parse(&packet, checksum).unwrap();
        Sent { repr, payload: packet.payload().to_vec() }
    }
}

struct Harness {
    stack: Stack,
    endpoint: Endpoint,
    nic: Loopback,
    /// Wall clock, in milliseconds.
    now: i64,
    /// Source port of injected segments.
    remote_port: u16,
    /// Fixed timestamp value of injected segments, instead of one ahead of the clock.
    stamp: Option<u32>,
}

impl Harness {
    fn new(config: Config) -> Self {
        let (stack, endpoint) = Stack::new(config);
        Harness {
            stack,
            endpoint,
            nic: Loopback::capture(64),
            now: 0,
            remote_port: REMOTE_PORT,
            stamp: None,
        }
    }

    fn listen(&self) -> SocketId {
        let sock = self.stack.socket().unwrap();
        self.stack.bind(sock, SocketAddr::new(LOCAL, LOCAL_PORT)).unwrap();
        self.stack.listen(sock, 4).unwrap();
        self.stack.set_nonblocking(sock, true).unwrap();
        sock
    }

    /// Send a segment from the peer, to the listening port.
    fn inject(&mut self, flags: Flags, seq: u32, ack: Option<u32>, payload: &[u8]) {
        self.inject_to(LOCAL_PORT, flags, seq, ack, payload)
    }

    fn inject_to(&mut self, port: u16, flags: Flags, seq: u32, ack: Option<u32>, payload: &[u8]) {
        let syn = flags.syn();
        let repr = Repr {
            src_port: self.remote_port,
            dst_port: port,
            flags,
            seq_number: SeqNumber(seq),
            ack_number: ack.map(SeqNumber),
            window_len: 65535,
            window_scale: None,
            max_seg_size: if syn { Some(1460) } else { None },
            sack_permitted: false,
            timestamp: Some((self.stamp.unwrap_or(self.now as u32 + 1), self.now as u32)),
            payload_len: payload.len(),
        };

        let mut bytes = vec![0; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet);
        packet.payload_mut()[..payload.len()].copy_from_slice(payload);
        packet.fill_checksum(REMOTE, LOCAL);
        self.nic.inject(REMOTE, LOCAL, bytes);
    }

    /// Run the network loop once and collect what it sent.
    fn poll(&mut self) -> Vec<Sent> {
        self.endpoint.poll(Instant::from_millis(self.now), &mut self.nic).unwrap();
        self.nic.take_sent().iter().map(Sent::parse).collect()
    }

    fn advance(&mut self, millis: i64) -> Vec<Sent> {
        self.now += millis;
        self.poll()
    }

    /// Complete a passive open of a peer starting at `seq`.
    ///
    /// Returns the accepted socket and our initial sequence number.
    fn handshake(&mut self, seq: u32) -> (SocketId, u32) {
        let listener = self.listen();
        let iss = self.connect_peer(seq);
        let (sock, peer) = self.stack.accept(listener).unwrap();
        assert_eq!(peer, SocketAddr::new(REMOTE, self.remote_port));
        (sock, iss)
    }

    /// Run the three-way handshake of the peer, leaving the stream in the accept queue.
    fn connect_peer(&mut self, seq: u32) -> u32 {
        self.inject(Flags::SYN, seq, None, &[]);
        let sent = self.poll();
        assert_eq!(sent.len(), 1);
        let synack = &sent[0].repr;
        assert_eq!(synack.flags, Flags::SYN | Flags::ACK);
        assert_eq!(synack.ack_number, Some(SeqNumber(seq + 1)));
        let iss = synack.seq_number.0;

        self.inject(Flags::ACK, seq + 1, Some(iss + 1), &[]);
        assert!(self.advance(1).is_empty());
        iss
    }

    fn key(&self, tuple: &FourTuple) -> Key {
        self.endpoint.core.flows.get(tuple).unwrap()
    }

    fn stream(&self, tuple: &FourTuple) -> &Stream {
        self.endpoint.streams.get(self.key(tuple)).unwrap()
    }

    fn wait(&self, ep: SocketId) -> Vec<Event> {
        self.stack.epoll_wait(ep, 8, NOW).unwrap()
    }
}

#[test]
fn passive_open() {
    let mut h = Harness::new(config());
    let listener = h.listen();

    h.inject(Flags::SYN, 1000, None, &[]);
    let sent = h.poll();
    assert_eq!(sent.len(), 1);
    let synack = &sent[0].repr;
    assert_eq!(synack.flags, Flags::SYN | Flags::ACK);
    assert_eq!(synack.ack_number, Some(SeqNumber(1001)));
    assert_eq!(synack.max_seg_size, Some(1460));
    // The peer offered no scaling, so neither do we.
    assert_eq!(synack.window_scale, Some(0));
    assert!(synack.timestamp.is_some());
    assert_eq!(h.endpoint.state(&tuple()), Some(State::SynReceived));
    assert_eq!(h.stack.accept(listener), Err(Errno::EAGAIN));

    let iss = synack.seq_number.0;
    h.inject(Flags::ACK, 1001, Some(iss + 1), &[]);
    assert!(h.advance(1).is_empty());
    assert_eq!(h.endpoint.state(&tuple()), Some(State::Established));
    assert_eq!(h.stream(&tuple()).rcv_nxt, SeqNumber(1001));
    assert_eq!(h.stream(&tuple()).snd_nxt, SeqNumber(iss + 1));

    let listeners = h.endpoint.core.shared.listeners.lock();
    assert_eq!(listeners.get(LOCAL_PORT).unwrap().pending(), 1);
    drop(listeners);

    let (sock, peer) = h.stack.accept(listener).unwrap();
    assert_eq!(peer, SocketAddr::new(REMOTE, REMOTE_PORT));
    assert_eq!(h.stack.state(sock), Ok(State::Established));
    assert_eq!(h.stack.accept(listener), Err(Errno::EAGAIN));
}

#[test]
fn wrong_handshake_ack() {
    let mut h = Harness::new(config());
    h.listen();

    h.inject(Flags::SYN, 1000, None, &[]);
    let iss = h.poll()[0].repr.seq_number.0;

    h.inject(Flags::ACK, 1001, Some(iss + 7), &[]);
    let sent = h.advance(1);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].repr.flags, Flags::RST);
    assert_eq!(sent[0].repr.seq_number, SeqNumber(iss + 7));
    assert_eq!(h.endpoint.state(&tuple()), Some(State::SynReceived));
}

#[test]
fn out_of_order_reassembly() {
    let mut h = Harness::new(config());
    let (sock, iss) = h.handshake(1949);
    assert_eq!(h.stream(&tuple()).rcv_nxt, SeqNumber(1950));

    h.inject(Flags::ACK, 2000, Some(iss + 1), &[b'b'; 50]);
    let sent = h.advance(1);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].repr.ack_number, Some(SeqNumber(1950)));
    {
        let shared = &h.stream(&tuple()).shared;
        let read = shared.read.lock();
        let buffer = read.buffer.as_ref().unwrap();
        assert_eq!(buffer.merged_len(), 0);
        assert_eq!(buffer.fragments().collect::<Vec<_>>(), vec![(SeqNumber(2000), 50)]);
    }
    assert_eq!(h.stack.set_nonblocking(sock, true), Ok(()));
    assert_eq!(h.stack.recv(sock, &mut [0; 16]), Err(Errno::EAGAIN));

    h.inject(Flags::ACK, 1950, Some(iss + 1), &[b'a'; 50]);
    h.advance(1);
    assert_eq!(h.stream(&tuple()).rcv_nxt, SeqNumber(2050));
    {
        let shared = &h.stream(&tuple()).shared;
        let read = shared.read.lock();
        let buffer = read.buffer.as_ref().unwrap();
        assert_eq!(buffer.merged_len(), 100);
        assert_eq!(buffer.fragments().collect::<Vec<_>>(), vec![(SeqNumber(1950), 100)]);
    }

    let mut buf = [0; 128];
    assert_eq!(h.stack.recv(sock, &mut buf), Ok(100));
    assert!(buf[..50].iter().all(|&b| b == b'a'));
    assert!(buf[50..100].iter().all(|&b| b == b'b'));
}

#[test]
fn reset_in_fin_wait() {
    let mut h = Harness::new(config());
    let (sock, iss) = h.handshake(1000);
    let shared = h.stream(&tuple()).shared.clone();
    let idx = h.key(&tuple()).index();

    h.stack.close(sock).unwrap();
    let sent = h.advance(1);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].repr.flags, Flags::FIN | Flags::ACK);
    assert_eq!(sent[0].repr.seq_number, SeqNumber(iss + 1));
    assert_eq!(h.endpoint.state(&tuple()), Some(State::FinWait1));

    h.inject(Flags::RST, 1001, None, &[]);
    assert!(h.advance(1).is_empty());

    assert!(h.endpoint.is_empty());
    assert_eq!(h.endpoint.core.flows.get(&tuple()), None);
    assert!(!h.endpoint.core.timers.is_armed(idx));
    assert!(h.endpoint.core.sender.chain_of(idx).is_none());
    assert_eq!(shared.state(), State::Closed);
    assert_eq!(shared.close_reason(), CloseReason::ActiveClose);
    h.endpoint.assert_consistent();
}

#[test]
fn reset_while_established() {
    let mut h = Harness::new(config());
    let (sock, iss) = h.handshake(1000);

    h.inject(Flags::RST | Flags::ACK, 1001, Some(iss + 1), &[]);
    h.advance(1);
    assert_eq!(h.endpoint.state(&tuple()), Some(State::CloseWait));
    assert_eq!(h.stack.close_reason(sock), Ok(CloseReason::Reset));
    assert_eq!(h.stack.recv(sock, &mut [0; 8]), Ok(0));

    h.stack.close(sock).unwrap();
    h.advance(1);
    assert!(h.endpoint.is_empty());
}

#[test]
fn passive_close() {
    let mut h = Harness::new(config());
    let (sock, iss) = h.handshake(1000);
    let shared = h.stream(&tuple()).shared.clone();

    h.inject(Flags::FIN | Flags::ACK, 1001, Some(iss + 1), &[]);
    let sent = h.advance(1);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].repr.flags, Flags::ACK);
    assert_eq!(sent[0].repr.ack_number, Some(SeqNumber(1002)));
    assert_eq!(h.stack.state(sock), Ok(State::CloseWait));
    assert_eq!(h.stack.recv(sock, &mut [0; 8]), Ok(0));

    h.stack.close(sock).unwrap();
    let sent = h.advance(1);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].repr.flags, Flags::FIN | Flags::ACK);
    assert_eq!(sent[0].repr.seq_number, SeqNumber(iss + 1));
    assert_eq!(h.endpoint.state(&tuple()), Some(State::LastAck));

    h.inject(Flags::ACK, 1002, Some(iss + 2), &[]);
    assert!(h.advance(1).is_empty());
    assert!(h.endpoint.is_empty());
    assert_eq!(shared.close_reason(), CloseReason::PassiveClose);
}

#[test]
fn active_close_through_time_wait() {
    let mut h = Harness::new(config());
    let (sock, iss) = h.handshake(1000);
    let shared = h.stream(&tuple()).shared.clone();

    h.stack.close(sock).unwrap();
    assert_eq!(h.advance(1).len(), 1);

    h.inject(Flags::FIN | Flags::ACK, 1001, Some(iss + 2), &[]);
    let sent = h.advance(1);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].repr.flags, Flags::ACK);
    assert_eq!(sent[0].repr.ack_number, Some(SeqNumber(1002)));
    assert_eq!(h.endpoint.state(&tuple()), Some(State::TimeWait));

    // The time-wait period is zero, the next round removes the stream.
    h.advance(1);
    assert!(h.endpoint.is_empty());
    assert_eq!(shared.state(), State::Closed);
    assert_eq!(shared.close_reason(), CloseReason::ActiveClose);
}

#[test]
fn triple_duplicate_ack() {
    let mut h = Harness::new(config());
    let (sock, iss) = h.handshake(1000);

    assert_eq!(h.stack.send(sock, &[0x55; 4000]), Ok(4000));
    let sent = h.advance(1);
    // Two segments of congestion window, then the remainder of it.
    let lens: Vec<_> = sent.iter().map(|s| s.payload.len()).collect();
    assert_eq!(lens, vec![1448, 1448, 24]);
    assert_eq!(sent[0].repr.seq_number, SeqNumber(iss + 1));

    for _ in 0..3 {
        h.inject(Flags::ACK, 1001, Some(iss + 1), &[]);
    }
    let sent = h.advance(1);
    {
        let stream = h.stream(&tuple());
        assert_eq!(stream.recv.dup_acks, 3);
        assert_eq!(stream.send.ssthresh, 2920);
        assert_eq!(stream.send.cwnd, 2920 + 3 * 1460);
    }
    let resent = sent.iter()
        .filter(|s| s.repr.seq_number == SeqNumber(iss + 1) && !s.payload.is_empty())
        .count();
    assert_eq!(resent, 1);

    h.inject(Flags::ACK, 1001, Some(iss + 1), &[]);
    let sent = h.advance(1);
    assert!(sent.iter().all(|s| s.repr.seq_number != SeqNumber(iss + 1)));
    assert_eq!(h.stream(&tuple()).send.cwnd, 2920 + 4 * 1460);
}

#[test]
fn ack_advances_send_buffer() {
    let mut h = Harness::new(config());
    let (sock, iss) = h.handshake(1000);

    assert_eq!(h.stack.send(sock, b"hello"), Ok(5));
    let sent = h.advance(1);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload, b"hello");

    h.inject(Flags::ACK, 1001, Some(iss + 6), &[]);
    h.advance(1);
    let stream = h.stream(&tuple());
    assert_eq!(stream.send.una, SeqNumber(iss + 6));
    assert!(!h.endpoint.core.timers.on_rto(h.key(&tuple()).index()));
    assert_eq!(stream.shared.write.lock().window, 8192);
}

#[test]
fn output_waits_for_device_buffers() {
    let mut h = Harness::new(config());
    let (sock, iss) = h.handshake(1000);
    assert_eq!(h.stack.peer_addr(sock), Ok(SocketAddr::new(REMOTE, REMOTE_PORT)));

    h.nic.set_tx_capacity(1);
    assert_eq!(h.stack.send(sock, &[1; 2000]), Ok(2000));
    let sent = h.advance(1);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].repr.seq_number, SeqNumber(iss + 1));
    assert_eq!(sent[0].payload.len(), 1448);

    // The stream stayed scheduled and continues where it stopped.
    let sent = h.advance(1);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].repr.seq_number, SeqNumber(iss + 1 + 1448));
    assert_eq!(sent[0].payload.len(), 552);
    assert!(h.advance(1).is_empty());
}

#[test]
fn syn_retransmission_backs_off() {
    let mut config = config();
    config.max_syn_retry = 4;
    config.max_backoff = 2;
    let mut h = Harness::new(config);

    let sock = h.stack.socket().unwrap();
    h.stack.set_nonblocking(sock, true).unwrap();
    let remote = SocketAddr::new(REMOTE, 80);
    assert_eq!(h.stack.connect(sock, remote), Err(Errno::EAGAIN));
    assert_eq!(h.stack.state(sock), Ok(State::SynSent));

    let tuple = FourTuple { local: h.stack.local_addr(sock).unwrap(), remote };
    let sent = h.poll();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].repr.flags, Flags::SYN);
    let iss = sent[0].repr.seq_number;

    let mut syns = vec![0];
    let mut rtos = Vec::new();
    while h.stack.state(sock) == Ok(State::SynSent) && h.now < 20_000 {
        let sent = h.advance(10);
        if sent.iter().any(|s| s.repr.flags == Flags::SYN) {
            assert!(sent.iter().all(|s| s.repr.seq_number == iss));
            syns.push(h.now);
            rtos.push(h.stream(&tuple).send.rto);
        }
    }

    assert_eq!(syns, vec![0, 500, 1500, 3500, 5500]);
    assert_eq!(rtos, vec![1000, 2000, 2000, 2000]);
    assert_eq!(h.now, 7500);
    assert_eq!(h.stack.state(sock), Ok(State::Closed));
    assert_eq!(h.stack.close_reason(sock), Ok(CloseReason::ConnFail));

    // The stream lingers for the application until it closes the socket.
    assert_eq!(h.endpoint.len(), 1);
    h.stack.close(sock).unwrap();
    h.advance(10);
    assert!(h.endpoint.is_empty());
}

#[test]
fn idle_timeout() {
    let mut config = config();
    config.idle_timeout = Duration::from_millis(1000);
    let mut h = Harness::new(config);
    let (sock, _) = h.handshake(1000);

    h.advance(500);
    assert_eq!(h.stack.state(sock), Ok(State::Established));
    h.advance(500);
    assert_eq!(h.stack.state(sock), Ok(State::Closed));
    assert_eq!(h.stack.close_reason(sock), Ok(CloseReason::TimedOut));
}

#[test]
fn unmatched_segments() {
    let mut h = Harness::new(config());

    h.inject_to(81, Flags::SYN, 500, None, &[]);
    h.inject_to(81, Flags::ACK, 10, Some(777), &[]);
    h.inject_to(81, Flags::FIN, 20, None, b"abc");
    h.inject_to(81, Flags::RST, 30, None, &[]);
    let sent = h.poll();

    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].repr.flags, Flags::RST | Flags::ACK);
    assert_eq!(sent[0].repr.ack_number, Some(SeqNumber(501)));
    assert_eq!(sent[1].repr.flags, Flags::RST);
    assert_eq!(sent[1].repr.seq_number, SeqNumber(777));
    assert_eq!(sent[1].repr.ack_number, None);
    assert_eq!(sent[2].repr.flags, Flags::RST | Flags::ACK);
    assert_eq!(sent[2].repr.ack_number, Some(SeqNumber(23)));
    assert!(h.endpoint.is_empty());
}

#[test]
fn level_triggered_readable() {
    let mut h = Harness::new(config());
    let ep = h.stack.epoll_create(16).unwrap();
    let (sock, iss) = h.handshake(1000);

    h.inject(Flags::PSH | Flags::ACK, 1001, Some(iss + 1), b"hello");
    h.advance(1);

    // Registering on a readable socket reports it right away.
    h.stack.epoll_ctl(ep, Ctl::Add, sock, Event { events: Events::IN, data: 7 }).unwrap();
    let readable = vec![Event { events: Events::IN, data: 7 }];
    assert_eq!(h.wait(ep), readable);
    // Still readable, so reported again without new data.
    assert_eq!(h.wait(ep), readable);

    assert_eq!(h.stack.recv(sock, &mut [0; 16]), Ok(5));
    // The event re-armed by the last delivery is still queued.
    let _ = h.wait(ep);
    assert!(h.wait(ep).is_empty());
}

#[test]
fn edge_triggered_readable() {
    let mut h = Harness::new(config());
    let ep = h.stack.epoll_create(16).unwrap();
    let (sock, iss) = h.handshake(1000);
    h.stack.epoll_ctl(ep, Ctl::Add, sock, Event { events: Events::IN | Events::ET, data: 3 })
        .unwrap();
    assert!(h.wait(ep).is_empty());

    h.inject(Flags::PSH | Flags::ACK, 1001, Some(iss + 1), b"one");
    h.advance(1);
    assert_eq!(h.wait(ep), vec![Event { events: Events::IN, data: 3 }]);
    assert!(h.wait(ep).is_empty());

    // More data while unread is no transition.
    h.inject(Flags::PSH | Flags::ACK, 1004, Some(iss + 1), b"two");
    h.advance(1);
    assert!(h.wait(ep).is_empty());

    assert_eq!(h.stack.recv(sock, &mut [0; 16]), Ok(6));
    h.inject(Flags::PSH | Flags::ACK, 1007, Some(iss + 1), b"three");
    h.advance(1);
    assert_eq!(h.wait(ep), vec![Event { events: Events::IN, data: 3 }]);
}

#[test]
fn listener_readable_on_accept_queue() {
    let mut h = Harness::new(config());
    let ep = h.stack.epoll_create(16).unwrap();
    let listener = h.listen();
    h.stack.epoll_ctl(ep, Ctl::Add, listener, Event { events: Events::IN, data: 1 }).unwrap();

    h.inject(Flags::SYN, 1000, None, &[]);
    let iss = h.poll()[0].repr.seq_number.0;
    assert!(h.wait(ep).is_empty());

    h.inject(Flags::ACK, 1001, Some(iss + 1), &[]);
    h.advance(1);
    assert_eq!(h.wait(ep), vec![Event { events: Events::IN, data: 1 }]);

    h.stack.accept(listener).unwrap();
    let _ = h.wait(ep);
    assert!(h.wait(ep).is_empty());
}

#[test]
fn stale_timestamp_dropped() {
    let mut h = Harness::new(config());
    let (sock, iss) = h.handshake(1000);
    h.advance(100);

    // Older than the timestamp of the handshake.
    h.stamp = Some(0);
    h.inject(Flags::PSH | Flags::ACK, 1001, Some(iss + 1), &[7; 10]);
    let sent = h.advance(1);

    assert_eq!(h.stream(&tuple()).rcv_nxt, SeqNumber(1001));
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].repr.flags, Flags::ACK);
    assert_eq!(sent[0].repr.ack_number, Some(SeqNumber(1001)));
    assert!(sent[0].payload.is_empty());

    h.stack.set_nonblocking(sock, true).unwrap();
    assert_eq!(h.stack.recv(sock, &mut [0; 16]), Err(Errno::EAGAIN));

    // A current timestamp gets the same bytes through.
    h.stamp = None;
    h.inject(Flags::PSH | Flags::ACK, 1001, Some(iss + 1), &[7; 10]);
    h.advance(1);
    assert_eq!(h.stream(&tuple()).rcv_nxt, SeqNumber(1011));
    assert_eq!(h.stack.recv(sock, &mut [0; 16]), Ok(10));
}

#[test]
fn slow_start_after_accept() {
    let mut h = Harness::new(config());
    let (sock, iss) = h.handshake(1000);
    {
        let stream = h.stream(&tuple());
        assert_eq!(stream.send.cwnd, 2 * 1460);
        assert_eq!(stream.send.ssthresh, 10 * 1460);
    }

    assert_eq!(h.stack.send(sock, &[0x55; 4000]), Ok(4000));
    let lens: Vec<_> = h.advance(1).iter().map(|s| s.payload.len()).collect();
    assert_eq!(lens, vec![1448, 1448, 24]);

    // One acknowledged segment opens the window by a whole one.
    h.inject(Flags::ACK, 1001, Some(iss + 1 + 1448), &[]);
    let sent = h.advance(1);
    assert_eq!(h.stream(&tuple()).send.cwnd, 3 * 1460);
    let rest = sent.iter()
        .find(|s| s.repr.seq_number == SeqNumber(iss + 1 + 2920))
        .unwrap();
    assert_eq!(rest.payload.len(), 4000 - 2920);
}

#[test]
fn retransmissions_exhausted() {
    let mut config = config();
    config.max_rtx = 2;
    config.max_backoff = 0;
    let mut h = Harness::new(config);
    let (sock, iss) = h.handshake(1000);

    assert_eq!(h.stack.send(sock, b"hello"), Ok(5));
    let mut transmissions = 0;
    let mut sent = h.advance(1);
    while h.stack.state(sock) == Ok(State::Established) && h.now < 20_000 {
        assert!(sent.iter().all(|s| !s.repr.flags.rst()));
        transmissions += sent.iter()
            .filter(|s| s.repr.seq_number == SeqNumber(iss + 1) && s.payload == b"hello")
            .count();
        sent = h.advance(100);
    }

    // The first transmission and one for each permitted retry.
    assert_eq!(transmissions, 3);
    assert!(sent.iter().all(|s| !s.repr.flags.rst()));
    assert_eq!(h.stack.state(sock), Ok(State::Closed));
    assert_eq!(h.stack.close_reason(sock), Ok(CloseReason::ConnLost));
}

#[test]
fn full_accept_queue_resets() {
    let mut config = config();
    config.backlog = 1;
    let mut h = Harness::new(config);
    let listener = h.listen();
    h.connect_peer(1000);

    let second = FourTuple {
        local: SocketAddr::new(LOCAL, LOCAL_PORT),
        remote: SocketAddr::new(REMOTE, REMOTE_PORT + 1),
    };
    h.remote_port = REMOTE_PORT + 1;
    h.inject(Flags::SYN, 5000, None, &[]);
    let iss = h.poll()[0].repr.seq_number.0;
    h.inject(Flags::ACK, 5001, Some(iss + 1), &[]);
    let sent = h.advance(1);

    assert_eq!(sent.len(), 1);
    assert!(sent[0].repr.flags.rst());
    assert_eq!(sent[0].repr.dst_port, REMOTE_PORT + 1);
    assert_eq!(h.endpoint.state(&second), None);
    assert_eq!(h.endpoint.state(&tuple()), Some(State::Established));

    let (sock, peer) = h.stack.accept(listener).unwrap();
    assert_eq!(peer, SocketAddr::new(REMOTE, REMOTE_PORT));
    assert_eq!(h.stack.state(sock), Ok(State::Established));
    assert_eq!(h.stack.accept(listener), Err(Errno::EAGAIN));
}

#[test]
fn output_lists_served_within_budget() {
    let mut config = config();
    config.output_budget = 1;
    let mut h = Harness::new(config);
    h.listen();

    h.inject(Flags::SYN, 1000, None, &[]);
    h.remote_port = REMOTE_PORT + 1;
    h.inject(Flags::SYN, 5000, None, &[]);

    let first = h.poll();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].repr.flags, Flags::SYN | Flags::ACK);

    // The other stream stayed scheduled for the next tick.
    let second = h.poll();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].repr.flags, Flags::SYN | Flags::ACK);
    assert_ne!(first[0].repr.dst_port, second[0].repr.dst_port);
    assert!(h.poll().is_empty());
}

#[test]
fn shutdown_interrupts_blocking_calls() {
    let mut h = Harness::new(config());
    let ep = h.stack.epoll_create(16).unwrap();
    let (sock, _) = h.handshake(1000);

    h.stack.shutdown();
    assert_eq!(h.stack.recv(sock, &mut [0; 8]), Err(Errno::EINTR));
    assert_eq!(h.stack.epoll_wait(ep, 8, None), Err(Errno::EINTR));
    assert_eq!(h.stack.epoll_wait(ep, 8, Some(Duration::from_millis(1000))), Err(Errno::EINTR));
}
