//! The network half of the stack.
//!
//! Relevant material for reading:
//! Main TCP rfc (skip if confident): https://tools.ietf.org/html/rfc793
//! Errata and comments: https://tools.ietf.org/html/rfc1122#section-4.2
//!     Notably still assuming some good-faith on hosts
//! TCP congestion control: https://tools.ietf.org/html/rfc5681
//! Timestamps and window scaling: https://tools.ietf.org/html/rfc7323
//! Initial sequence numbers: https://tools.ietf.org/html/rfc6528
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{consts, Config};
use crate::layer::{Error, Result};
use crate::managed::{Chains, Key, SlotMap};
use crate::nic::{self, Device, Disposition, Recv};
use crate::readiness::{Events, Queue, Readiness};
use crate::socket::{Shared, SocketId};
use crate::storage::handoff::{self, Consumer, InternalQueue, Producer};
use crate::time::{Duration, Instant, Timestamp};
use crate::wire::{self, SocketAddr};
use crate::wire::tcp::{Checksum, Packet, Repr, SeqNumber};

use super::connection::{CloseReason, State, Stream, StreamShared};
use super::input::Segment;
use super::output::{Reply, CONTROL, SENDER_CHAINS};
use super::table::{FlowTable, FourTuple};
use super::timer::Timers;

/// Segments taken from the device per poll.
const RX_BURST: usize = 64;

/// Handles all TCP connections of a stack.
///
/// There is exactly one endpoint per [`Stack`], created alongside it. The thread owning it must
/// call [`poll`] in a loop: every call takes the requests of application threads, processes
/// received segments, fires timers and finally writes all scheduled output to the device.
///
/// [`Stack`]: ../../socket/struct.Stack.html
/// [`poll`]: #method.poll
pub struct Endpoint {
    pub(super) streams: SlotMap<Stream>,
    pub(super) core: Core,
    inbox: Inbox,
}

/// Everything of the endpoint except the streams themselves.
///
/// Split off so that a stream can be borrowed mutably while the tables, lists and timers it is
/// linked into are updated.
pub(super) struct Core {
    pub(super) shared: Arc<Shared>,
    pub(super) config: Config,
    pub(super) flows: FlowTable,
    /// The control, send and ack output lists.
    pub(super) sender: Chains,
    pub(super) timers: Timers,
    /// The readiness context, as of the start of the current poll.
    pub(super) readiness: Option<Arc<Readiness>>,
    /// Resets for segments that matched no stream.
    pub(super) replies: VecDeque<Reply>,
    /// Closes that wait until the control list let go of their stream.
    pub(super) close_int: InternalQueue<Key>,
    /// Resets that wait until the output lists let go of their stream.
    pub(super) reset_int: InternalQueue<Key>,
    /// Destroyed streams, removed from the slot map at the end of each operation.
    reap: Vec<Key>,
    pub(super) now: Timestamp,
    pub(super) instant: Instant,
}

/// The application side of the handoff queues.
pub(crate) struct Requests {
    connect: Mutex<Producer<Arc<StreamShared>>>,
    send: Mutex<Producer<Arc<StreamShared>>>,
    ack: Mutex<Producer<Arc<StreamShared>>>,
    close: Mutex<Producer<Arc<StreamShared>>>,
    reset: Mutex<Producer<Arc<StreamShared>>>,
    destroy: Mutex<Producer<Arc<StreamShared>>>,
}

/// The network side of the handoff queues.
pub(crate) struct Inbox {
    connect: Consumer<Arc<StreamShared>>,
    send: Consumer<Arc<StreamShared>>,
    ack: Consumer<Arc<StreamShared>>,
    close: Consumer<Arc<StreamShared>>,
    reset: Consumer<Arc<StreamShared>>,
    destroy: Consumer<Arc<StreamShared>>,
}

/// What an application thread asks of the network thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Request {
    /// Start an active open.
    Connect,
    /// New data was put into the send buffer.
    Send,
    /// The receive window opened, announce it.
    Ack,
    /// Close the sending side gracefully.
    Close,
    /// Abort with a reset.
    Reset,
    /// Drop the stream without any further segment.
    Destroy,
}

/// Create the handoff queues, each holding `capacity` requests.
pub(crate) fn requests(capacity: usize) -> (Requests, Inbox) {
    let (connect_tx, connect) = handoff::queue(capacity);
    let (send_tx, send) = handoff::queue(capacity);
    let (ack_tx, ack) = handoff::queue(capacity);
    let (close_tx, close) = handoff::queue(capacity);
    let (reset_tx, reset) = handoff::queue(capacity);
    let (destroy_tx, destroy) = handoff::queue(capacity);

    let requests = Requests {
        connect: Mutex::new(connect_tx),
        send: Mutex::new(send_tx),
        ack: Mutex::new(ack_tx),
        close: Mutex::new(close_tx),
        reset: Mutex::new(reset_tx),
        destroy: Mutex::new(destroy_tx),
    };
    let inbox = Inbox { connect, send, ack, close, reset, destroy };
    (requests, inbox)
}

impl Requests {
    /// Queue a request, handing the stream back when the queue is full.
    pub(crate) fn submit(&self, request: Request, stream: Arc<StreamShared>)
        -> core::result::Result<(), Arc<StreamShared>>
    {
        let queue = match request {
            Request::Connect => &self.connect,
            Request::Send => &self.send,
            Request::Ack => &self.ack,
            Request::Close => &self.close,
            Request::Reset => &self.reset,
            Request::Destroy => &self.destroy,
        };

        queue.lock().enqueue(stream).map_err(|stream| {
            net_warn!("tcp: {} {:?} queue full", stream.tuple, request);
            stream
        })
    }
}

/// Feeds received packets of the device into the endpoint.
struct Receiver<'a> {
    endpoint: &'a mut Endpoint,
    now: Instant,
}

impl Recv for Receiver<'_> {
    fn receive(&mut self, packet: nic::Packet) -> Disposition {
        self.endpoint.process(self.now, packet)
    }
}

impl Endpoint {
    pub(crate) fn new(shared: Arc<Shared>, inbox: Inbox) -> Self {
        let config = shared.config.clone();
        let members = config.max_concurrency;
        Endpoint {
            streams: SlotMap::with_capacity(members),
            core: Core {
                flows: FlowTable::new(config.flow_bins),
                sender: Chains::new(members, SENDER_CHAINS),
                timers: Timers::new(members, config.rto_hash),
                readiness: None,
                replies: VecDeque::new(),
                close_int: InternalQueue::with_capacity(members),
                reset_int: InternalQueue::with_capacity(members),
                reap: Vec::new(),
                now: Timestamp(0),
                instant: Instant::from_millis(0),
                shared,
                config,
            },
            inbox,
        }
    }

    /// Run one iteration of the network loop.
    ///
    /// Returns the number of packets received from the device.
    pub fn poll<D: Device>(&mut self, now: Instant, dev: &mut D) -> Result<usize> {
        self.core.tick(now);
        self.core.readiness = self.core.shared.readiness.lock().clone();

        self.handle_requests();
        self.reap();

        let received = dev.rx(RX_BURST, Receiver { endpoint: self, now })?;

        self.handle_timers();
        self.reap();

        if let Some(readiness) = &self.core.readiness {
            readiness.flush();
        }

        self.write_chunks(dev);
        self.reap();
        dev.send_burst()?;

        #[cfg(debug_assertions)]
        self.assert_consistent();

        Ok(received)
    }

    /// Process one received segment.
    ///
    /// The packet carries the TCP segment and the addresses of the IPv4 datagram it arrived in.
    pub fn process(&mut self, now: Instant, packet: nic::Packet) -> Disposition {
        self.core.tick(now);

        let segment = match Packet::new_checked(packet.payload) {
            Ok(segment) => segment,
            Err(_) => return Disposition::Ignored,
        };

        let checksum = Checksum::Manual { src_addr: packet.src, dst_addr: packet.dst };
        let repr = match Repr::parse(&segment, checksum) {
            Ok(repr) => repr,
            Err(wire::Error::Checksum) => {
                net_debug!("tcp: checksum mismatch from {}", packet.src);
                return Disposition::Consumed;
            },
            Err(err) => {
                net_debug!("tcp: unparsable segment from {}: {}", packet.src, err);
                return Disposition::Ignored;
            },
        };

        let seg = Segment {
            repr,
            payload: segment.payload(),
            ts: self.core.now,
        };
        let tuple = FourTuple {
            local: SocketAddr::new(packet.dst, repr.dst_port),
            remote: SocketAddr::new(packet.src, repr.src_port),
        };

        match self.core.flows.get(&tuple) {
            Some(key) => self.with_stream(key, |core, key, stream| core.input(key, stream, &seg)),
            None => self.create_stream(tuple, &seg),
        }

        self.reap();
        Disposition::Consumed
    }

    /// Number of live streams, in any state.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// The state of the stream of a four-tuple.
    pub fn state(&self, tuple: &FourTuple) -> Option<State> {
        let key = self.core.flows.get(tuple)?;
        self.streams.get(key).map(|stream| stream.state)
    }

    pub(super) fn with_stream<F>(&mut self, key: Key, f: F)
        where F: FnOnce(&mut Core, Key, &mut Stream)
    {
        if let Some(stream) = self.streams.get_mut(key) {
            f(&mut self.core, key, stream)
        }
    }

    /// Answer a segment that matched no stream.
    fn create_stream(&mut self, tuple: FourTuple, seg: &Segment) {
        let flags = seg.flags();
        if flags.rst() {
            // Never answer a reset.
            return;
        }

        if flags.syn() && !flags.ack() {
            if self.core.accepts(&tuple) {
                match self.passive_open(tuple, seg) {
                    Ok(_) => return,
                    Err(err) => {
                        net_debug!("tcp: {} can not open: {:?}", tuple, err);
                    },
                }
            }
            self.core.reply_rst(tuple, SeqNumber(0), Some(seg.end() + 1), seg.ts);
        } else if flags.ack() {
            self.core.reply_rst(tuple, seg.ack(), None, seg.ts);
        } else {
            self.core.reply_rst(tuple, SeqNumber(0), Some(seg.end()), seg.ts);
        }
    }

    /// Create a stream for a SYN on a listening port.
    fn passive_open(&mut self, tuple: FourTuple, seg: &Segment) -> Result<Key> {
        let core = &mut self.core;
        let iss = core.shared.isn.get_isn(tuple, core.instant);
        let shared = StreamShared::new(tuple, iss, State::Listen, &core.config);
        let mut stream = Stream::new(Arc::new(shared), &core.config, seg.ts);

        stream.recv.irs = seg.seq();
        stream.rcv_nxt = seg.seq();
        stream.recv.snd_wl1 = seg.seq();
        stream.recv.snd_wl2 = iss;
        stream.send.peer_wnd = u32::from(seg.repr.window_len);
        stream.parse_options(&seg.repr, seg.ts);

        if !core.ensure_recv_buffer(&stream) {
            return Err(Error::Exhausted);
        }

        let key = self.streams.insert(stream).ok_or(Error::Exhausted)?;
        if self.core.flows.insert(tuple, key).is_err() {
            self.streams.remove(key);
            return Err(Error::Illegal);
        }

        net_debug!("tcp: {} passive open, iss {}", tuple, iss);
        self.with_stream(key, |core, key, stream| core.input(key, stream, seg));
        Ok(key)
    }

    /// Start an active open requested by an application thread.
    fn open(&mut self, shared: Arc<StreamShared>) {
        let fail = |shared: &StreamShared| {
            shared.set_state(State::Closed);
            shared.set_close_reason(CloseReason::ConnFail);
            shared.wake_all();
        };

        let tuple = shared.tuple;
        if self.core.flows.get(&tuple).is_some() {
            net_debug!("tcp: {} connect on an existing flow", tuple);
            return fail(&shared);
        }

        let stream = Stream::new(shared.clone(), &self.core.config, self.core.now);
        let key = match self.streams.insert(stream) {
            Some(key) => key,
            None => return fail(&shared),
        };

        if self.core.flows.insert(tuple, key).is_err() {
            self.streams.remove(key);
            return fail(&shared);
        }
        net_debug!("tcp: {} active open, iss {}", tuple, shared.iss);
        self.with_stream(key, |core, key, stream| core.request_control(key, stream));
    }

    /// The key of a live stream matching a shared record.
    fn resolve(&self, shared: &Arc<StreamShared>) -> Option<Key> {
        let key = self.core.flows.get(&shared.tuple)?;
        let stream = self.streams.get(key)?;
        if Arc::ptr_eq(&stream.shared, shared) {
            Some(key)
        } else {
            None
        }
    }

    /// Take all requests from the handoff queues.
    fn handle_requests(&mut self) {
        while let Some(shared) = self.inbox.connect.dequeue() {
            self.open(shared);
        }

        while let Some(shared) = self.inbox.send.dequeue() {
            shared.on_sendq.store(false, core::sync::atomic::Ordering::Release);
            if let Some(key) = self.resolve(&shared) {
                self.with_stream(key, |core, key, stream| core.request_send(key, stream));
            }
        }

        while let Some(shared) = self.inbox.ack.dequeue() {
            shared.on_ackq.store(false, core::sync::atomic::Ordering::Release);
            if let Some(key) = self.resolve(&shared) {
                self.with_stream(key, |core, key, stream| {
                    core.request_ack(key, stream, super::connection::AckOpt::Aggregate)
                });
            }
        }

        for _ in 0..self.core.close_int.len() {
            if let Some(key) = self.core.close_int.pop() {
                self.with_stream(key, |core, key, stream| core.close_stream(key, stream));
            }
        }
        while let Some(shared) = self.inbox.close.dequeue() {
            shared.on_closeq.store(false, core::sync::atomic::Ordering::Release);
            if let Some(key) = self.resolve(&shared) {
                self.with_stream(key, |core, key, stream| core.close_stream(key, stream));
            }
        }

        for _ in 0..self.core.reset_int.len() {
            if let Some(key) = self.core.reset_int.pop() {
                self.with_stream(key, |core, key, stream| core.reset_stream(key, stream));
            }
        }
        while let Some(shared) = self.inbox.reset.dequeue() {
            shared.on_resetq.store(false, core::sync::atomic::Ordering::Release);
            if let Some(key) = self.resolve(&shared) {
                self.with_stream(key, |core, key, stream| core.reset_stream(key, stream));
            }
        }

        while let Some(shared) = self.inbox.destroy.dequeue() {
            if let Some(key) = self.resolve(&shared) {
                self.with_stream(key, |core, key, stream| {
                    if stream.state != State::Closed {
                        stream.close(CloseReason::ActiveClose);
                    }
                    core.destroy(key, stream)
                });
            }
        }
    }

    /// Fire all due timers.
    fn handle_timers(&mut self) {
        let now = self.core.now;
        let thresh = self.core.config.max_concurrency;

        for idx in self.core.timers.expired_rto(now, thresh) {
            if let Some(key) = self.streams.key_at(idx) {
                self.with_stream(key, |core, key, stream| core.on_rto(key, stream));
            }
        }

        for idx in self.core.timers.expired_timewait(now) {
            if self.core.sender.chain_of(idx) == Some(CONTROL) {
                continue;
            }
            if let Some(key) = self.streams.key_at(idx) {
                self.with_stream(key, |core, key, stream| {
                    core.timers.remove_timewait(key.index());
                    stream.close(CloseReason::ActiveClose);
                    core.destroy(key, stream);
                });
            }
        }

        let timeout = ticks(&self.core.config, self.core.config.idle_timeout);
        if timeout == 0 {
            return;
        }
        for idx in self.core.timers.expired_idle(now, timeout) {
            if let Some(key) = self.streams.key_at(idx) {
                self.with_stream(key, |core, key, stream| {
                    net_debug!("tcp: {} idle timeout", stream.tuple);
                    core.timers.remove_idle(key.index());
                    stream.close(CloseReason::TimedOut);
                    core.abort(key, stream);
                });
            }
        }
    }

    /// Remove destroyed streams from the slot map.
    fn reap(&mut self) {
        for key in self.core.reap.drain(..) {
            self.streams.remove(key);
        }
    }

    /// Check that tables, lists and timers only reference live streams.
    ///
    /// Panics on the first violation.
    pub(super) fn assert_consistent(&self) {
        let core = &self.core;
        assert_eq!(core.flows.len(), self.streams.len(), "flow table and streams disagree");

        for (key, stream) in self.streams.iter() {
            assert_eq!(core.flows.get(&stream.tuple), Some(key), "{} not in flow table", stream.tuple);
            assert!(stream.state == State::Closed || stream.close_reason == CloseReason::NotClosed
                || stream.close_reason == CloseReason::Reset,
                "{} closed as {:?} but in {:?}", stream.tuple, stream.close_reason, stream.state);
            if core.timers.on_timewait(key.index()) {
                assert_eq!(stream.state, State::TimeWait, "{} on time-wait list", stream.tuple);
            }
        }

        for idx in 0..self.streams.capacity() {
            if self.streams.key_at(idx).is_none() {
                assert!(core.sender.chain_of(idx).is_none(), "dead member {} on output list", idx);
                assert!(!core.timers.is_armed(idx), "dead member {} on a timer", idx);
            }
        }
    }
}

impl Core {
    /// Advance the clock.
    fn tick(&mut self, now: Instant) {
        self.instant = now;
        let ticks = now.total_millis() * i64::from(self.config.hz) / 1000;
        self.now = Timestamp(ticks as u32);
        self.shared.clock.store(now.total_millis(), core::sync::atomic::Ordering::Relaxed);
    }

    /// If a SYN to this local address meets a listener.
    fn accepts(&self, tuple: &FourTuple) -> bool {
        let listeners = self.shared.listeners.lock();
        let listener = match listeners.get(tuple.local.port) {
            Some(listener) if !listener.is_closed() => listener,
            _ => return false,
        };

        let bound = listener.addr.addr;
        if bound == tuple.local.addr {
            return true;
        }
        let local = self.config.local_addr;
        bound.is_unspecified() && (local.is_unspecified() || local == tuple.local.addr)
    }

    /// Post an event for the socket of a stream.
    pub(super) fn raise(&self, stream: &Stream, events: Events, transition: bool) {
        if let Some(socket) = stream.socket() {
            self.raise_socket(socket, events, transition);
        }
    }

    pub(super) fn raise_socket(&self, socket: SocketId, events: Events, transition: bool) {
        if let Some(readiness) = &self.readiness {
            readiness.add_event(Queue::Net, socket, events, transition);
        }
    }

    /// Give up on a closed stream.
    ///
    /// With a socket attached the application is told and the stream lingers until it closes the
    /// socket, otherwise the stream is destroyed right away.
    pub(super) fn abort(&mut self, key: Key, stream: &mut Stream) {
        debug_assert_eq!(stream.state, State::Closed);
        self.sender.remove(key.index());
        self.timers.forget(key.index());

        if stream.socket().is_some() {
            self.raise(stream, Events::IN | Events::ERR | Events::HUP, true);
            stream.shared.wake_all();
        } else {
            self.destroy(key, stream);
        }
    }

    /// Unlink a stream from everything and schedule its removal.
    ///
    /// The caller must not touch the stream afterwards.
    pub(super) fn destroy(&mut self, key: Key, stream: &mut Stream) {
        if self.flows.get(&stream.tuple) != Some(key) {
            return;
        }
        self.flows.remove(&stream.tuple);

        let idx = key.index();
        self.sender.remove(idx);
        self.timers.forget(idx);
        if stream.state != State::Closed {
            stream.close(CloseReason::ActiveClose);
        }

        // Buffers go back to their pools.
        {
            let mut write = stream.shared.write.lock();
            write.buffer = None;
            write.window = 0;
        }
        {
            let mut read = stream.shared.read.lock();
            read.buffer = None;
            read.window = 0;
        }

        net_debug!("tcp: {} destroyed ({:?})", stream.tuple, stream.close_reason);
        stream.shared.wake_all();
        self.reap.push(key);
    }

    /// If the stream waits in one of the internal close or reset queues.
    pub(super) fn closing(&self, key: Key) -> bool {
        self.close_int.iter().any(|&other| other == key)
            || self.reset_int.iter().any(|&other| other == key)
    }

    /// Enter or refresh the time-wait period.
    pub(super) fn enter_timewait(&mut self, key: Key, stream: &mut Stream, ts: Timestamp) {
        let expire = ts + ticks(&self.config, self.config.timewait);
        stream.recv.ts_tw_expire = expire;
        self.timers.add_timewait(key.index(), expire);
    }

    /// Restart the retransmission timer after forward progress.
    pub(super) fn update_retransmission_timer(&mut self, key: Key, stream: &mut Stream, ts: Timestamp) {
        stream.send.nrtx = 0;
        self.timers.remove_rto(key.index());
        if stream.snd_nxt > stream.send.una {
            stream.send.ts_rto = ts + stream.send.rto;
            self.timers.add_rto(key.index(), stream.send.ts_rto, ts);
        }
    }

    /// The retransmission timeout from the current estimate.
    pub(super) fn measured_rto(&self, stream: &Stream) -> u32 {
        let floor = consts::MIN_RTO_MS * self.config.hz / 1000;
        stream.estimated_rto().max(floor)
    }

    /// The application closed its socket.
    fn close_stream(&mut self, key: Key, stream: &mut Stream) {
        let idx = key.index();
        stream.send.fss = match stream.shared.write.lock().buffer.as_ref() {
            Some(buffer) => buffer.tail_seq(),
            None => stream.snd_nxt,
        };
        self.timers.remove_idle(idx);

        if stream.have_reset {
            stream.close(CloseReason::Reset);
            self.destroy(key, stream);
            return;
        }

        if self.sender.chain_of(idx) == Some(CONTROL) {
            if self.close_int.push(key).is_err() {
                net_warn!("tcp: {} close queue full", stream.tuple);
            }
            return;
        }

        match stream.state {
            State::Established => stream.set_state(State::FinWait1),
            State::CloseWait => stream.set_state(State::LastAck),
            other => {
                net_debug!("tcp: {} close in {:?}", stream.tuple, other);
                return;
            },
        }
        self.request_control(key, stream);
    }

    /// The application asked to abort the stream.
    fn reset_stream(&mut self, key: Key, stream: &mut Stream) {
        let idx = key.index();
        self.timers.remove_idle(idx);

        if stream.have_reset {
            stream.close(CloseReason::Reset);
            self.destroy(key, stream);
            return;
        }

        if self.sender.chain_of(idx).is_some() {
            if self.reset_int.push(key).is_err() {
                net_warn!("tcp: {} reset queue full", stream.tuple);
            }
            return;
        }

        stream.close(CloseReason::ActiveClose);
        self.request_control(key, stream);
    }

    /// The retransmission timer fired.
    fn on_rto(&mut self, key: Key, stream: &mut Stream) {
        let state = stream.state;
        if stream.send.nrtx < self.config.max_rtx {
            stream.send.nrtx += 1;
        } else {
            let reason = if state < State::Established {
                CloseReason::ConnFail
            } else {
                CloseReason::ConnLost
            };
            net_debug!("tcp: {} retransmissions exhausted in {:?}", stream.tuple, state);
            stream.close(reason);
            self.abort(key, stream);
            return;
        }

        if state == State::SynSent && stream.send.nrtx > self.config.max_syn_retry {
            net_debug!("tcp: {} no answer to SYN", stream.tuple);
            stream.close(CloseReason::ConnFail);
            self.abort(key, stream);
            return;
        }

        let base = if state >= State::Established && stream.recv.srtt != 0 {
            self.measured_rto(stream)
        } else {
            self.config.initial_rto
        };
        let backoff = stream.send.nrtx.min(self.config.max_backoff);
        stream.send.rto = base << backoff;
        net_debug!("tcp: {} timeout {} in {:?}, rto now {}",
            stream.tuple, stream.send.nrtx, state, stream.send.rto);

        stream.collapse_window();
        stream.snd_nxt = stream.send.una;

        match state {
            State::Established | State::CloseWait => self.request_send(key, stream),
            State::FinWait1 | State::Closing | State::LastAck => {
                if stream.snd_nxt < stream.send.fss {
                    self.sender.remove(key.index());
                    stream.control_list_waiting = true;
                    self.request_send(key, stream);
                } else {
                    self.request_control(key, stream);
                }
            },
            _ => self.request_control(key, stream),
        }
    }
}

/// Convert a duration into clock ticks.
pub(super) fn ticks(config: &Config, duration: Duration) -> u32 {
    (duration.as_millis() as u64 * u64::from(config.hz) / 1000) as u32
}
