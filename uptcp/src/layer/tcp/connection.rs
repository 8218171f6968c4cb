use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::config::{consts, Config};
use crate::socket::SocketId;
use crate::storage::{RecvBuffer, SendBuffer};
use crate::time::Timestamp;
use crate::wire::tcp::{Repr, SeqNumber};

use super::table::FourTuple;

/// State enum of the statemachine.
///
/// The order of the variants is meaningful. Handshake states come before `Established` and all
/// states after it have seen a complete handshake, some checks compare states by this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum State {
    /// Marker state of a connection that is gone or about to be.
    Closed = 0,

    /// A stream created by an incoming SYN, before answering it.
    Listen = 1,

    /// An open connection request.
    SynSent = 2,

    /// Connection request we intend to answer, waiting on ack.
    SynReceived = 3,

    /// An open connection.
    Established = 4,

    /// Other side closed its connection.
    CloseWait = 5,

    /// Closed our side of the connection.
    FinWait1 = 6,

    /// Closed both sides but we don't know the other knows.
    Closing = 7,

    /// Connection closed after other side closed its already.
    LastAck = 8,

    /// Closing connection nicely, initiated by us and acknowledged.
    FinWait2 = 9,

    /// Both sides recognized connection as closed.
    TimeWait = 10,
}

/// Why a connection was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CloseReason {
    NotClosed = 0,
    /// We closed first and the exchange completed.
    ActiveClose = 1,
    /// The peer closed first and the exchange completed.
    PassiveClose = 2,
    /// The handshake never completed.
    ConnFail = 3,
    /// Retransmissions of an established connection were exhausted.
    ConnLost = 4,
    Reset = 5,
    /// No buffer could be allocated.
    NoMem = 6,
    /// The accept queue of the listener was full.
    NotAccepted = 7,
    /// The connection was idle for too long.
    TimedOut = 8,
}

/// How an acknowledgment should be scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOpt {
    /// Send one more ACK.
    Now,
    /// Make sure at least one ACK goes out.
    Aggregate,
    /// Probe the window of the peer.
    WindowProbe,
}

/// The network thread half of a connection.
///
/// Only the network thread ever touches this. Everything an application thread needs lives in the
/// `StreamShared` record behind `shared`.
#[derive(Debug)]
pub struct Stream {
    pub tuple: FourTuple,

    /// The current state of the state machine.
    ///
    /// Mirrored into `shared` on every transition, see `set_state`.
    pub state: State,

    pub close_reason: CloseReason,

    pub shared: std::sync::Arc<StreamShared>,

    /// The next sequence number to use for transmission.
    ///
    /// In RFC793 this is referred to as `SND.NXT`.
    pub snd_nxt: SeqNumber,

    /// The next expected sequence number.
    ///
    /// In RFC793 this is referred to as `RCV.NXT`.
    pub rcv_nxt: SeqNumber,

    /// The sending state.
    pub send: Send,

    /// The receiving state.
    pub recv: Receive,

    /// If the peer sent a timestamp option on its SYN.
    ///
    /// From then on every segment without one is dropped.
    pub saw_timestamp: bool,

    /// If we are permitted to use SACKs. Recorded but never acted upon.
    pub sack_permit: bool,

    /// An RST was received for this connection.
    pub have_reset: bool,

    /// A control segment is owed once the queued data or acknowledgments went out.
    pub control_list_waiting: bool,

    /// Last time a segment was sent or received, for the idle timeout.
    pub last_active: Timestamp,
}

#[derive(Clone, Copy, Debug)]
pub struct Send {
    /// The initial sequence number.
    ///
    /// In RFC793 this is referred to as `ISS`.
    pub iss: SeqNumber,

    /// The oldest unacknowledged sequence number.
    ///
    /// In RFC793 this is referred to as `SND.UNA`.
    pub una: SeqNumber,

    /// The window the peer advertised, already scaled.
    pub peer_wnd: u32,

    /// The maximum segment size of the peer, or our default.
    pub mss: u32,

    /// Segment payload left after the timestamp option.
    pub eff_mss: u32,

    pub wscale_mine: u8,
    pub wscale_peer: u8,

    /// The congestion window.
    pub cwnd: u32,

    /// Decider between slow-start and congestion avoidance.
    pub ssthresh: u32,

    /// The current retransmission timeout in ticks.
    pub rto: u32,

    /// Deadline of the armed retransmission timer.
    pub ts_rto: Timestamp,

    /// Retransmissions since the last forward progress.
    pub nrtx: u8,
    pub max_nrtx: u8,

    /// Sequence number of our FIN.
    pub fss: SeqNumber,
    pub is_fin_sent: bool,

    /// Acknowledgments still to be sent.
    pub ack_cnt: u8,

    /// A window probe is owed.
    pub is_wack: bool,

    pub ts_lastack_sent: Timestamp,
}

#[derive(Clone, Copy, Debug)]
pub struct Receive {
    /// The initial receive sequence number.
    ///
    /// In RFC793 this is referred to as `IRS`.
    pub irs: SeqNumber,

    /// Sequence number of the segment that last updated the peer window.
    pub snd_wl1: SeqNumber,

    /// Acknowledgment number of the segment that last updated the peer window.
    pub snd_wl2: SeqNumber,

    pub last_ack_seq: SeqNumber,
    pub dup_acks: u8,

    /// The most recent timestamp value of the peer, echoed in our segments.
    pub ts_recent: u32,

    /// The echo reply on the last acceptable segment, one of our own clock values.
    pub ts_lastack_rcvd: Timestamp,
    pub ts_last_ts_upd: Timestamp,
    pub ts_tw_expire: Timestamp,

    /// Smoothed round trip time, scaled by 8.
    pub srtt: u32,
    /// Mean deviation, scaled by 4.
    pub mdev: u32,
    pub mdev_max: u32,
    pub rttvar: u32,
    /// Sequence number that ends the current measurement round.
    pub rtt_seq: SeqNumber,
}

/// The part of a connection that application threads use.
///
/// Receive and send buffers each sit behind their own lock, paired with a condition variable for
/// callers blocked on them. The state is a copy kept in sync by the network thread.
#[derive(Debug)]
pub struct StreamShared {
    pub(crate) tuple: FourTuple,
    pub(crate) iss: SeqNumber,
    state: AtomicU8,
    close_reason: AtomicU8,
    socket: Mutex<Option<SocketId>>,
    pub(crate) read: Mutex<ReadHalf>,
    pub(crate) read_cond: Condvar,
    pub(crate) write: Mutex<WriteHalf>,
    pub(crate) write_cond: Condvar,
    /// Queued for the network thread on the respective handoff queue.
    pub(crate) on_sendq: AtomicBool,
    pub(crate) on_ackq: AtomicBool,
    pub(crate) on_closeq: AtomicBool,
    pub(crate) on_resetq: AtomicBool,
    /// A zero window was advertised, announce when the application made room.
    pub(crate) need_wnd_adv: AtomicBool,
    /// The application closed its socket.
    pub(crate) closed: AtomicBool,
}

#[derive(Debug)]
pub(crate) struct ReadHalf {
    pub buffer: Option<RecvBuffer>,
    /// Free space we advertise.
    pub window: u32,
    /// Room that must open up before a zero window is revoked.
    pub eff_mss: u32,
}

#[derive(Debug)]
pub(crate) struct WriteHalf {
    pub buffer: Option<SendBuffer>,
    /// Free space in the send buffer.
    pub window: u32,
}

impl State {
    fn from_u8(raw: u8) -> State {
        match raw {
            0 => State::Closed,
            1 => State::Listen,
            2 => State::SynSent,
            3 => State::SynReceived,
            4 => State::Established,
            5 => State::CloseWait,
            6 => State::FinWait1,
            7 => State::Closing,
            8 => State::LastAck,
            9 => State::FinWait2,
            10 => State::TimeWait,
            _ => unreachable!("Invalid state {}", raw),
        }
    }

    /// If the application may still read in this state.
    pub fn readable(self) -> bool {
        match self {
            State::Established | State::CloseWait | State::FinWait1 | State::FinWait2 => true,
            _ => false,
        }
    }

    /// If the application may still write in this state.
    pub fn writable(self) -> bool {
        match self {
            State::Established | State::CloseWait => true,
            _ => false,
        }
    }
}

impl CloseReason {
    fn from_u8(raw: u8) -> CloseReason {
        match raw {
            0 => CloseReason::NotClosed,
            1 => CloseReason::ActiveClose,
            2 => CloseReason::PassiveClose,
            3 => CloseReason::ConnFail,
            4 => CloseReason::ConnLost,
            5 => CloseReason::Reset,
            6 => CloseReason::NoMem,
            7 => CloseReason::NotAccepted,
            8 => CloseReason::TimedOut,
            _ => unreachable!("Invalid close reason {}", raw),
        }
    }
}

impl Stream {
    /// A fresh control block in the given initial state.
    ///
    /// The initial sequence number is taken from the shared record, where the opener put it.
    pub fn new(shared: std::sync::Arc<StreamShared>, config: &Config, now: Timestamp) -> Self {
        let iss = shared.iss;
        let state = shared.state();
        let mss = u32::from(config.mss);
        let eff_mss = u32::from(config.eff_mss());
        Stream {
            tuple: shared.tuple,
            state,
            close_reason: CloseReason::NotClosed,
            shared,
            snd_nxt: iss,
            rcv_nxt: SeqNumber(0),
            send: Send {
                iss,
                una: iss,
                peer_wnd: 0,
                mss,
                eff_mss,
                wscale_mine: config.window_scale,
                wscale_peer: 0,
                cwnd: 1,
                ssthresh: 10 * mss,
                rto: config.initial_rto,
                ts_rto: now,
                nrtx: 0,
                max_nrtx: 0,
                fss: SeqNumber(0),
                is_fin_sent: false,
                ack_cnt: 0,
                is_wack: false,
                ts_lastack_sent: now,
            },
            recv: Receive {
                irs: SeqNumber(0),
                snd_wl1: SeqNumber(0),
                snd_wl2: SeqNumber(0),
                last_ack_seq: SeqNumber(0),
                dup_acks: 0,
                ts_recent: 0,
                ts_lastack_rcvd: now,
                ts_last_ts_upd: now,
                ts_tw_expire: now,
                srtt: 0,
                mdev: 0,
                mdev_max: 0,
                rttvar: 0,
                rtt_seq: SeqNumber(0),
            },
            saw_timestamp: false,
            sack_permit: false,
            have_reset: false,
            control_list_waiting: false,
            last_active: now,
        }
    }

    pub fn set_state(&mut self, state: State) {
        net_trace!("tcp: {} {:?} -> {:?}", self.tuple, self.state, state);
        self.state = state;
        self.shared.set_state(state);
    }

    /// Move to `Closed`, recording why.
    pub fn close(&mut self, reason: CloseReason) {
        self.set_state(State::Closed);
        self.close_reason = reason;
        self.shared.set_close_reason(reason);
    }

    /// Take over the options of a handshake segment.
    pub fn parse_options(&mut self, repr: &Repr, now: Timestamp) {
        if let Some(mss) = repr.max_seg_size {
            self.send.mss = u32::from(mss);
            self.send.eff_mss = self.send.mss.saturating_sub(u32::from(consts::TS_OPTION_LEN));
            self.shared.read.lock().eff_mss = self.send.eff_mss;
        }
        match repr.window_scale {
            Some(wscale) => self.send.wscale_peer = wscale,
            // Scaling is only in effect when both sides offer it.
            None if repr.flags.syn() => self.send.wscale_mine = 0,
            None => (),
        }
        if repr.sack_permitted {
            net_trace!("tcp: {} remote permits SACK", self.tuple);
            self.sack_permit = true;
        }
        if let Some((value, _)) = repr.timestamp {
            self.saw_timestamp = true;
            self.recv.ts_recent = value;
            self.recv.ts_last_ts_upd = now;
        }
    }

    /// Feed one round trip measurement, in ticks, into the estimator.
    ///
    /// Jacobson/Karels with the variance tracking of Linux: `srtt` is kept scaled by 8 and `mdev`
    /// by 4, `rttvar` follows the largest deviation seen within one window of data.
    pub fn estimate_rtt(&mut self, mrtt: u32) {
        let rcv = &mut self.recv;
        let mut m = i64::from(mrtt.max(1));

        if rcv.srtt != 0 {
            m -= i64::from(rcv.srtt >> 3);
            rcv.srtt = (i64::from(rcv.srtt) + m) as u32;
            if m < 0 {
                m = -m;
                m -= i64::from(rcv.mdev >> 2);
                if m > 0 {
                    m >>= 3;
                }
            } else {
                m -= i64::from(rcv.mdev >> 2);
            }
            rcv.mdev = (i64::from(rcv.mdev) + m).max(0) as u32;
            if rcv.mdev > rcv.mdev_max {
                rcv.mdev_max = rcv.mdev;
                if rcv.mdev_max > rcv.rttvar {
                    rcv.rttvar = rcv.mdev_max;
                }
            }
            if self.send.una > rcv.rtt_seq {
                if rcv.mdev_max < rcv.rttvar {
                    rcv.rttvar -= (rcv.rttvar - rcv.mdev_max) >> 2;
                }
                rcv.rtt_seq = self.snd_nxt;
                rcv.mdev_max = 0;
            }
        } else {
            rcv.srtt = (m << 3) as u32;
            rcv.mdev = (m << 1) as u32;
            rcv.mdev_max = rcv.mdev;
            rcv.rttvar = rcv.mdev;
            rcv.rtt_seq = self.snd_nxt;
        }

        net_trace!("tcp: {} mrtt {} srtt {} mdev {} rttvar {}",
            self.tuple, mrtt, rcv.srtt >> 3, rcv.mdev, rcv.rttvar);
    }

    /// The retransmission timeout the current estimate asks for.
    pub fn estimated_rto(&self) -> u32 {
        ((self.recv.srtt >> 3) + self.recv.rttvar).max(1)
    }

    /// React to a third duplicate acknowledgment.
    pub fn fast_retransmit(&mut self) {
        let send = &mut self.send;
        send.ssthresh = (send.cwnd.min(send.peer_wnd) / 2).max(2 * send.mss);
        send.cwnd = send.ssthresh + 3 * send.mss;
        net_trace!("tcp: {} fast retransmit cwnd {} ssthresh {}",
            self.tuple, send.cwnd, send.ssthresh);
    }

    /// Grow the congestion window for `packets` newly acknowledged segments.
    pub fn grow_window(&mut self, packets: u32) {
        let send = &mut self.send;
        if send.cwnd < send.ssthresh {
            send.cwnd = send.cwnd.saturating_add(send.mss * packets);
        } else if send.cwnd > 0 {
            let mss = u64::from(send.mss);
            let step = u64::from(packets) * mss * mss / u64::from(send.cwnd);
            send.cwnd = send.cwnd.saturating_add(step.min(u64::from(u32::max_value())) as u32);
        }
    }

    /// Collapse the congestion window after a retransmission timeout.
    pub fn collapse_window(&mut self) {
        let send = &mut self.send;
        send.ssthresh = (send.cwnd.min(send.peer_wnd) / 2).max(2 * send.mss);
        send.cwnd = send.mss;
    }

    /// Schedule an acknowledgment by counter. The caller links the stream.
    pub fn request_ack(&mut self, opt: AckOpt) {
        match opt {
            AckOpt::Now => self.send.ack_cnt = self.send.ack_cnt.saturating_add(1),
            AckOpt::Aggregate => if self.send.ack_cnt == 0 {
                self.send.ack_cnt = 1;
            },
            AckOpt::WindowProbe => self.send.is_wack = true,
        }
    }

    /// If acknowledgments are still owed.
    pub fn owes_ack(&self) -> bool {
        self.send.ack_cnt > 0 || self.send.is_wack
    }

    /// The socket of the application, if any is attached.
    pub fn socket(&self) -> Option<SocketId> {
        self.shared.socket()
    }
}

impl StreamShared {
    pub(crate) fn new(tuple: FourTuple, iss: SeqNumber, state: State, config: &Config) -> Self {
        StreamShared {
            tuple,
            iss,
            state: AtomicU8::new(state as u8),
            close_reason: AtomicU8::new(CloseReason::NotClosed as u8),
            socket: Mutex::new(None),
            read: Mutex::new(ReadHalf {
                buffer: None,
                window: config.initial_window.min(config.recv_buffer as u32),
                eff_mss: u32::from(config.eff_mss()),
            }),
            read_cond: Condvar::new(),
            write: Mutex::new(WriteHalf {
                buffer: None,
                window: config.send_buffer as u32,
            }),
            write_cond: Condvar::new(),
            on_sendq: AtomicBool::new(false),
            on_ackq: AtomicBool::new(false),
            on_closeq: AtomicBool::new(false),
            on_resetq: AtomicBool::new(false),
            need_wnd_adv: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn close_reason(&self) -> CloseReason {
        CloseReason::from_u8(self.close_reason.load(Ordering::Acquire))
    }

    pub fn socket(&self) -> Option<SocketId> {
        *self.socket.lock()
    }

    pub(crate) fn set_socket(&self, socket: Option<SocketId>) {
        *self.socket.lock() = socket;
    }

    /// A close is queued for the network thread.
    pub(crate) fn on_closeq(&self) -> bool {
        self.on_closeq.load(Ordering::Acquire)
    }

    pub(crate) fn on_resetq(&self) -> bool {
        self.on_resetq.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_close_reason(&self, reason: CloseReason) {
        self.close_reason.store(reason as u8, Ordering::Release);
    }

    /// Wake every thread blocked on this stream.
    pub(crate) fn wake_all(&self) {
        // Taking the locks orders the wake after any waiter checked its condition.
        drop(self.read.lock());
        self.read_cond.notify_all();
        drop(self.write.lock());
        self.write_cond.notify_all();
    }

    /// Wake readers, for example on new data.
    pub(crate) fn wake_readers(&self) {
        drop(self.read.lock());
        self.read_cond.notify_all();
    }

    /// Wake writers, for example when the window opened.
    pub(crate) fn wake_writers(&self) {
        drop(self.write.lock());
        self.write_cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::SocketAddr;
    use std::sync::Arc;

    fn stream() -> Stream {
        let config = Config::default();
        let tuple = FourTuple {
            local: SocketAddr::from(([10, 0, 0, 1], 80)),
            remote: SocketAddr::from(([10, 0, 0, 2], 4000)),
        };
        let shared = StreamShared::new(tuple, SeqNumber(100), State::Established, &config);
        Stream::new(Arc::new(shared), &config, Timestamp(0))
    }

    #[test]
    fn state_order() {
        assert!(State::SynReceived < State::Established);
        assert!(State::CloseWait > State::Established);
        assert!(State::TimeWait > State::FinWait2);
        assert_eq!(State::from_u8(State::Closing as u8), State::Closing);
    }

    #[test]
    fn mirrored_state() {
        let mut stream = stream();
        stream.set_state(State::FinWait1);
        assert_eq!(stream.shared.state(), State::FinWait1);
        stream.close(CloseReason::Reset);
        assert_eq!(stream.shared.state(), State::Closed);
        assert_eq!(stream.shared.close_reason(), CloseReason::Reset);
    }

    #[test]
    fn rtt_first_sample() {
        let mut stream = stream();
        stream.estimate_rtt(40);
        assert_eq!(stream.recv.srtt, 40 << 3);
        assert_eq!(stream.recv.rttvar, 80);
        assert_eq!(stream.estimated_rto(), 120);

        // A steady path lets the smoothed value stay put.
        stream.estimate_rtt(40);
        assert_eq!(stream.recv.srtt >> 3, 40);
    }

    #[test]
    fn fast_retransmit_floor() {
        let mut stream = stream();
        stream.send.mss = 1000;
        stream.send.cwnd = 3000;
        stream.send.peer_wnd = 10_000;
        stream.fast_retransmit();
        assert_eq!(stream.send.ssthresh, 2000);
        assert_eq!(stream.send.cwnd, 5000);
    }

    #[test]
    fn window_growth() {
        let mut stream = stream();
        assert_eq!(stream.send.ssthresh, 10 * 1460);
        stream.send.cwnd = 2 * 1460;
        stream.grow_window(2);
        assert_eq!(stream.send.cwnd, 4 * 1460);

        // Congestion avoidance on a huge cumulative acknowledgment.
        stream.send.ssthresh = 0;
        stream.send.mss = 60_000;
        stream.send.cwnd = 1000;
        stream.grow_window(100_000);
        assert_eq!(stream.send.cwnd, u32::max_value());
    }

    #[test]
    fn ack_requests() {
        let mut stream = stream();
        stream.request_ack(AckOpt::Aggregate);
        stream.request_ack(AckOpt::Aggregate);
        assert_eq!(stream.send.ack_cnt, 1);
        stream.request_ack(AckOpt::Now);
        assert_eq!(stream.send.ack_cnt, 2);
        assert!(!stream.send.is_wack);
        stream.request_ack(AckOpt::WindowProbe);
        assert!(stream.owes_ack());
    }
}
