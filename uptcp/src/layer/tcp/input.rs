//! The receive half of the state machine.
//!
//! Every segment of a known stream enters through [`Core::input`], which validates it against the
//! receive window and dispatches on the state. Nothing is transmitted from here, answers are
//! scheduled on the output lists.
//!
//! [`Core::input`]: ../endpoint/struct.Core.html#method.input
use crate::managed::Key;
use crate::readiness::Events;
use crate::storage::{Caller, RecvBuffer};
use crate::time::Timestamp;
use crate::wire::tcp::{Flags, Repr, SeqNumber};

use super::connection::{AckOpt, CloseReason, State, Stream};
use super::endpoint::Core;

/// A received segment of a known stream.
#[derive(Clone, Copy, Debug)]
pub struct Segment<'a> {
    pub repr: Repr,
    pub payload: &'a [u8],
    pub ts: Timestamp,
}

impl Segment<'_> {
    pub fn flags(&self) -> Flags {
        self.repr.flags
    }

    pub fn seq(&self) -> SeqNumber {
        self.repr.seq_number
    }

    /// The acknowledgment number, zero when the flag is not set.
    pub fn ack(&self) -> SeqNumber {
        self.repr.ack_number.unwrap_or_default()
    }

    pub fn len(&self) -> u32 {
        self.payload.len() as u32
    }

    /// The sequence number just past the payload.
    pub fn end(&self) -> SeqNumber {
        self.seq() + self.len()
    }

    /// The advertised window, scaled unless the segment is a SYN.
    fn window(&self, wscale: u8) -> u32 {
        let window = u32::from(self.repr.window_len);
        if self.flags().syn() {
            window
        } else {
            window << wscale
        }
    }
}

impl Core {
    /// Process a segment of an existing stream.
    pub(super) fn input(&mut self, key: Key, stream: &mut Stream, seg: &Segment) {
        let idx = key.index();
        let flags = seg.flags();

        if stream.state > State::SynReceived && !self.validate_sequence(key, stream, seg) {
            return;
        }

        // Established streams take window updates only through the acknowledgment rules.
        if stream.state < State::Established {
            stream.send.peer_wnd = seg.window(stream.send.wscale_peer);
        }

        stream.last_active = seg.ts;
        if self.timers.on_idle(idx) {
            self.timers.touch_idle(idx, seg.ts);
        }

        if flags.rst() {
            stream.have_reset = true;
            if stream.state > State::SynSent && self.process_rst(key, stream, seg.ack()) {
                return;
            }
        }

        match stream.state {
            State::Listen => self.on_listen(key, stream, seg),
            State::SynSent => self.on_syn_sent(key, stream, seg),
            State::SynReceived => {
                if flags.syn() && seg.seq() == stream.recv.irs {
                    // A retransmitted SYN, answer it again.
                    self.on_listen(key, stream, seg);
                } else {
                    self.on_syn_received(key, stream, seg);
                    if !seg.payload.is_empty() && stream.state == State::Established {
                        self.on_established(key, stream, seg);
                    }
                }
            },
            State::Established => self.on_established(key, stream, seg),
            State::CloseWait => self.on_close_wait(key, stream, seg),
            State::LastAck => self.on_last_ack(key, stream, seg),
            State::FinWait1 => self.on_fin_wait_1(key, stream, seg),
            State::FinWait2 => self.on_fin_wait_2(key, stream, seg),
            State::Closing => self.on_closing(key, stream, seg),
            State::TimeWait => {
                if self.timers.on_timewait(idx) {
                    self.enter_timewait(key, stream, seg.ts);
                }
                self.request_control(key, stream);
            },
            State::Closed => (),
        }
    }

    /// Check timestamps and the receive window.
    ///
    /// Stale and out-of-window segments are answered with an acknowledgment, or with a control
    /// segment outside of `Established`.
    fn validate_sequence(&mut self, key: Key, stream: &mut Stream, seg: &Segment) -> bool {
        let flags = seg.flags();

        if !flags.rst() && stream.saw_timestamp {
            let (value, echo) = match seg.repr.timestamp {
                Some(timestamp) => timestamp,
                None => {
                    net_debug!("tcp: {} segment without timestamp dropped", stream.tuple);
                    return false;
                },
            };

            if (value.wrapping_sub(stream.recv.ts_recent) as i32) < 0 {
                // PAWS, the peer clock went backwards.
                net_debug!("tcp: {} stale timestamp {} < {}",
                    stream.tuple, value, stream.recv.ts_recent);
                self.request_ack(key, stream, AckOpt::Now);
                return false;
            }

            if (value.wrapping_sub(stream.recv.ts_recent) as i32) > 0 {
                stream.recv.ts_last_ts_upd = seg.ts;
            }
            stream.recv.ts_recent = value;
            stream.recv.ts_lastack_rcvd = Timestamp(echo);
        }

        let window = stream.shared.read.lock().window;
        let rcv_nxt = stream.rcv_nxt;
        if seg.end().between(rcv_nxt, rcv_nxt + window) {
            return true;
        }

        net_trace!("tcp: {} seq {} len {} outside window {}+{}",
            stream.tuple, seg.seq(), seg.len(), rcv_nxt, window);
        if flags.rst() {
            return false;
        }

        if stream.state == State::Established {
            if seg.seq() + 1 == rcv_nxt {
                // Keep-alive probe.
                self.request_ack(key, stream, AckOpt::Aggregate);
            } else if seg.seq() <= rcv_nxt {
                self.request_ack(key, stream, AckOpt::Aggregate);
            } else {
                self.request_ack(key, stream, AckOpt::Now);
            }
        } else {
            if stream.state == State::TimeWait {
                self.enter_timewait(key, stream, seg.ts);
            }
            self.request_control(key, stream);
        }
        false
    }

    /// Returns if the segment was consumed by the reset.
    fn process_rst(&mut self, key: Key, stream: &mut Stream, ack: SeqNumber) -> bool {
        net_debug!("tcp: {} reset in {:?}", stream.tuple, stream.state);

        match stream.state {
            State::Closed | State::Listen | State::SynSent => false,
            State::SynReceived => {
                if ack == stream.snd_nxt {
                    stream.close(CloseReason::Reset);
                    self.destroy(key, stream);
                }
                true
            },
            State::FinWait1 | State::FinWait2 | State::LastAck | State::Closing
                | State::TimeWait =>
            {
                stream.close(CloseReason::ActiveClose);
                self.destroy(key, stream);
                true
            },
            State::Established | State::CloseWait => {
                let shared = stream.shared.clone();
                if !(shared.on_closeq() || shared.on_resetq() || self.closing(key)) {
                    stream.set_state(State::CloseWait);
                    stream.close_reason = CloseReason::Reset;
                    shared.set_close_reason(CloseReason::Reset);
                    self.raise(stream, Events::IN | Events::ERR | Events::HUP, true);
                    shared.wake_all();
                }
                true
            },
        }
    }

    fn on_listen(&mut self, key: Key, stream: &mut Stream, seg: &Segment) {
        if !seg.flags().syn() {
            net_debug!("tcp: {} segment without SYN in {:?}", stream.tuple, stream.state);
            return;
        }

        if stream.state == State::Listen {
            stream.rcv_nxt += 1;
        }
        stream.set_state(State::SynReceived);
        self.request_control(key, stream);
    }

    fn on_syn_sent(&mut self, key: Key, stream: &mut Stream, seg: &Segment) {
        let flags = seg.flags();

        if flags.ack() {
            let ack = seg.ack();
            if ack <= stream.send.iss || ack > stream.snd_nxt {
                if !flags.rst() {
                    self.reply_rst(stream.tuple, ack, None, seg.ts);
                }
                return;
            }
            stream.send.una += 1;
        }

        if flags.rst() {
            if flags.ack() {
                stream.close(CloseReason::Reset);
                self.abort(key, stream);
            }
            return;
        }

        if flags.syn() && flags.ack() {
            self.active_open(key, stream, seg);
            stream.send.nrtx = 0;
            self.timers.remove_rto(key.index());
            stream.set_state(State::Established);

            if stream.socket().is_none() {
                // Nobody waits for this connection anymore.
                self.reply_rst(stream.tuple, SeqNumber(0), Some(seg.end() + 1), seg.ts);
                stream.close(CloseReason::ActiveClose);
                self.destroy(key, stream);
                return;
            }

            self.raise(stream, Events::OUT, true);
            stream.shared.wake_writers();
            self.request_control(key, stream);
            self.timers.touch_idle(key.index(), seg.ts);
        } else if flags.syn() {
            // Simultaneous open.
            stream.recv.irs = seg.seq();
            stream.rcv_nxt = seg.seq() + 1;
            stream.parse_options(&seg.repr, seg.ts);
            stream.set_state(State::SynReceived);
            stream.snd_nxt = stream.send.iss;
            self.request_control(key, stream);
        }
    }

    /// Take over the parameters of the answer to our SYN.
    fn active_open(&mut self, key: Key, stream: &mut Stream, seg: &Segment) {
        stream.recv.irs = seg.seq();
        stream.snd_nxt = seg.ack();
        stream.send.peer_wnd = seg.window(0);
        stream.recv.snd_wl1 = stream.recv.irs - 1;
        stream.recv.snd_wl2 = seg.ack();
        stream.rcv_nxt = stream.recv.irs + 1;
        stream.recv.last_ack_seq = seg.ack();
        stream.parse_options(&seg.repr, seg.ts);

        let mss = stream.send.mss;
        stream.send.cwnd = if stream.send.cwnd == 1 { 2 * mss } else { mss };
        stream.send.ssthresh = 10 * mss;

        if !self.ensure_recv_buffer(stream) {
            net_warn!("tcp: {} no receive buffer available", stream.tuple);
        }
        self.update_retransmission_timer(key, stream, seg.ts);
    }

    fn on_syn_received(&mut self, key: Key, stream: &mut Stream, seg: &Segment) {
        if !seg.flags().ack() {
            net_debug!("tcp: {} no ACK in {:?}", stream.tuple, stream.state);
            stream.snd_nxt = stream.send.iss;
            self.request_control(key, stream);
            return;
        }

        let ack = seg.ack();
        if ack != stream.send.iss + 1 {
            net_debug!("tcp: {} unexpected ack {} for iss {}", stream.tuple, ack, stream.send.iss);
            self.reply_rst(stream.tuple, ack, None, seg.ts);
            return;
        }

        stream.send.una += 1;
        stream.snd_nxt = ack;
        let mss = stream.send.mss;
        stream.send.cwnd = if stream.send.cwnd == 1 { 2 * mss } else { mss };
        stream.send.ssthresh = 10 * mss;
        stream.send.nrtx = 0;
        stream.rcv_nxt = stream.recv.irs + 1;
        stream.recv.snd_wl2 = ack;
        stream.recv.last_ack_seq = ack;
        self.timers.remove_rto(key.index());
        stream.set_state(State::Established);

        let listener = self.shared.listeners.lock().get(stream.tuple.local.port).cloned();
        let listener = match listener {
            Some(listener) => listener,
            None => {
                net_debug!("tcp: {} listener vanished", stream.tuple);
                stream.close(CloseReason::NotAccepted);
                self.request_control(key, stream);
                return;
            },
        };

        if listener.push(stream.shared.clone()).is_err() {
            net_debug!("tcp: {} accept queue of {} full", stream.tuple, listener.addr);
            stream.close(CloseReason::NotAccepted);
            self.request_control(key, stream);
            return;
        }

        self.timers.touch_idle(key.index(), seg.ts);
        self.raise_socket(listener.socket, Events::IN, true);
    }

    fn on_established(&mut self, key: Key, stream: &mut Stream, seg: &Segment) {
        let flags = seg.flags();

        if flags.syn() {
            net_debug!("tcp: {} SYN in {:?}, seq {} expected {}",
                stream.tuple, stream.state, seg.seq(), stream.rcv_nxt);
            stream.snd_nxt = seg.ack();
            self.request_control(key, stream);
            return;
        }

        if !seg.payload.is_empty() {
            let opt = if self.process_payload(key, stream, seg) {
                AckOpt::Aggregate
            } else {
                AckOpt::Now
            };
            if stream.state == State::Closed {
                return;
            }
            self.request_ack(key, stream, opt);
        }

        if flags.ack() {
            self.process_ack(key, stream, seg);
        }

        if flags.fin() {
            if seg.end() == stream.rcv_nxt {
                stream.set_state(State::CloseWait);
                stream.rcv_nxt += 1;
                self.request_control(key, stream);
                // Readable for the end of stream.
                self.raise(stream, Events::IN | Events::RDHUP, true);
                stream.shared.wake_readers();
            } else {
                self.request_ack(key, stream, AckOpt::Now);
            }
        }
    }

    fn on_close_wait(&mut self, key: Key, stream: &mut Stream, seg: &Segment) {
        if seg.seq() < stream.rcv_nxt {
            net_debug!("tcp: {} seq {} expected {} in {:?}",
                stream.tuple, seg.seq(), stream.rcv_nxt, stream.state);
            self.request_control(key, stream);
            return;
        }

        self.process_ack(key, stream, seg);
    }

    fn on_last_ack(&mut self, key: Key, stream: &mut Stream, seg: &Segment) {
        if seg.seq() < stream.rcv_nxt {
            return;
        }

        if !seg.flags().ack() {
            self.request_control(key, stream);
            return;
        }

        self.process_ack(key, stream, seg);
        if !stream.send.is_fin_sent {
            return;
        }

        if seg.ack() == stream.send.fss + 1 {
            stream.send.una += 1;
            self.update_retransmission_timer(key, stream, seg.ts);
            stream.close(CloseReason::PassiveClose);
            self.destroy(key, stream);
        } else {
            self.request_control(key, stream);
        }
    }

    fn on_fin_wait_1(&mut self, key: Key, stream: &mut Stream, seg: &Segment) {
        let flags = seg.flags();

        if seg.seq() < stream.rcv_nxt {
            self.request_control(key, stream);
            return;
        }

        if !flags.ack() {
            return;
        }

        self.process_ack(key, stream, seg);
        let ack = seg.ack();
        if stream.send.is_fin_sent && ack == stream.send.fss + 1 {
            stream.send.una = ack;
            if ack > stream.snd_nxt {
                stream.snd_nxt = ack;
            }
            stream.send.nrtx = 0;
            self.timers.remove_rto(key.index());
            stream.set_state(State::FinWait2);
        }

        self.receive_closing(key, stream, seg);
    }

    fn on_fin_wait_2(&mut self, key: Key, stream: &mut Stream, seg: &Segment) {
        if !seg.flags().ack() {
            return;
        }

        self.process_ack(key, stream, seg);
        self.receive_closing(key, stream, seg);
    }

    /// Payload and FIN of a stream whose sending side is closed.
    fn receive_closing(&mut self, key: Key, stream: &mut Stream, seg: &Segment) {
        if !seg.payload.is_empty() {
            let opt = if self.process_payload(key, stream, seg) {
                AckOpt::Aggregate
            } else {
                AckOpt::Now
            };
            if stream.state == State::Closed {
                return;
            }
            self.request_ack(key, stream, opt);
        }

        if seg.flags().fin() && seg.end() == stream.rcv_nxt {
            stream.rcv_nxt += 1;
            if stream.state == State::FinWait1 {
                stream.set_state(State::Closing);
            } else {
                stream.set_state(State::TimeWait);
                self.enter_timewait(key, stream, seg.ts);
            }
            self.request_control(key, stream);
        }
    }

    fn on_closing(&mut self, key: Key, stream: &mut Stream, seg: &Segment) {
        if !seg.flags().ack() {
            return;
        }

        self.process_ack(key, stream, seg);
        let ack = seg.ack();
        if !stream.send.is_fin_sent || ack != stream.send.fss + 1 {
            return;
        }

        stream.send.una = ack;
        stream.snd_nxt = ack;
        self.update_retransmission_timer(key, stream, seg.ts);
        stream.set_state(State::TimeWait);
        self.enter_timewait(key, stream, seg.ts);
    }

    /// Store the payload of a segment.
    ///
    /// Returns if the in-order data advanced, otherwise the segment deserves an immediate
    /// acknowledgment.
    fn process_payload(&mut self, key: Key, stream: &mut Stream, seg: &Segment) -> bool {
        let window = stream.shared.read.lock().window;
        if seg.end() < stream.rcv_nxt || seg.end() > stream.rcv_nxt + window {
            return false;
        }

        let prev_rcv_nxt = stream.rcv_nxt;
        let was_empty;
        {
            if !self.ensure_recv_buffer(stream) {
                net_warn!("tcp: {} no receive buffer available", stream.tuple);
                stream.close(CloseReason::NoMem);
                self.abort(key, stream);
                return false;
            }

            let mut read = stream.shared.read.lock();
            let read = &mut *read;
            let buffer = match read.buffer.as_mut() {
                Some(buffer) => buffer,
                None => return false,
            };

            was_empty = buffer.merged_len() == 0;
            if let Err(err) = buffer.put(seg.seq(), seg.payload) {
                net_debug!("tcp: {} can not store payload at {}: {:?}",
                    stream.tuple, seg.seq(), err);
            }

            if stream.state == State::FinWait1 || stream.state == State::FinWait2 {
                // Nobody reads anymore.
                let merged = buffer.merged_len();
                buffer.remove(merged, Caller::Net);
            }

            stream.rcv_nxt = buffer.head_seq() + buffer.merged_len() as u32;
            read.window = (buffer.size() - buffer.merged_len()) as u32;
        }

        if stream.rcv_nxt <= prev_rcv_nxt {
            return false;
        }

        if stream.state == State::Established && stream.socket().is_some() {
            self.raise(stream, Events::IN, was_empty);
            stream.shared.wake_readers();
        }
        true
    }

    /// Process the acknowledgment and window of a segment.
    pub(super) fn process_ack(&mut self, key: Key, stream: &mut Stream, seg: &Segment) {
        let flags = seg.flags();
        let seq = seg.seq();
        let mut ack = seg.ack();
        let cwindow = seg.window(stream.send.wscale_peer);
        let right_wnd_edge = stream.recv.snd_wl2 + stream.send.peer_wnd;

        match stream.state {
            State::FinWait1 | State::FinWait2 | State::Closing | State::CloseWait
                | State::LastAck =>
            {
                if stream.send.is_fin_sent && ack == stream.send.fss + 1 {
                    ack = ack - 1;
                }
            },
            _ => (),
        }

        let (head_seq, buffered) = {
            let write = stream.shared.write.lock();
            match write.buffer.as_ref() {
                Some(buffer) => (buffer.head_seq(), buffer.len() as u32),
                // Nothing was ever sent, only the window matters.
                None => (stream.send.una, 0),
            }
        };

        if ack > head_seq + buffered {
            net_debug!("tcp: {} invalid ack {}, at most {}",
                stream.tuple, ack, head_seq + buffered);
            return;
        }

        let recv = &mut stream.recv;
        let in_flight = stream.snd_nxt.since(stream.send.una).max(0) as u32;
        if recv.snd_wl1 < seq
            || (recv.snd_wl1 == seq && recv.snd_wl2 < ack)
            || (recv.snd_wl2 == ack && cwindow > stream.send.peer_wnd)
        {
            let prev_wnd = stream.send.peer_wnd;
            stream.send.peer_wnd = cwindow;
            recv.snd_wl1 = seq;
            recv.snd_wl2 = ack;

            if prev_wnd < in_flight && cwindow >= in_flight {
                net_trace!("tcp: {} peer window opened to {}", stream.tuple, cwindow);
                self.request_send_if_unsent(key, stream);
            }
        }

        let recv = &mut stream.recv;
        let mut dup = false;
        if ack < stream.snd_nxt
            && ack == recv.last_ack_seq
            && seg.payload.is_empty()
            && recv.snd_wl2 + stream.send.peer_wnd == right_wnd_edge
        {
            recv.dup_acks = recv.dup_acks.saturating_add(1);
            dup = true;
        }

        if !dup {
            recv.dup_acks = 0;
            recv.last_ack_seq = ack;
        }

        if dup && recv.dup_acks == 3 {
            net_debug!("tcp: {} triple duplicate ack {}", stream.tuple, ack);
            if ack < stream.snd_nxt {
                stream.snd_nxt = ack;
            }
            stream.fast_retransmit();
            if stream.send.nrtx < self.config.max_rtx {
                stream.send.nrtx += 1;
            }
            self.request_send(key, stream);
        } else if recv.dup_acks > 3 {
            stream.send.cwnd = stream.send.cwnd.saturating_add(stream.send.mss);
        }

        if ack > stream.snd_nxt {
            stream.snd_nxt = ack;
            if buffered == 0 {
                self.unschedule_send(key);
            }
        }

        if head_seq >= ack || buffered == 0 {
            return;
        }

        let rmlen = ack.since(head_seq) as u32;
        let eff_mss = stream.send.eff_mss.max(1);
        let packets = (rmlen + eff_mss - 1) / eff_mss;

        if stream.saw_timestamp && !flags.syn() {
            let mrtt = seg.ts.since(stream.recv.ts_lastack_rcvd).max(0) as u32;
            stream.estimate_rtt(mrtt);
            stream.send.rto = self.measured_rto(stream);
        }

        if stream.state >= State::Established {
            stream.grow_window(packets);
        }

        {
            let mut write = stream.shared.write.lock();
            let size = match write.buffer.as_mut() {
                Some(buffer) => {
                    if buffer.remove(rmlen as usize) == 0 {
                        return;
                    }
                    buffer.size() - buffer.len()
                },
                None => return,
            };

            stream.send.una = ack;
            let prev_wnd = write.window;
            write.window = size as u32;
            if prev_wnd == 0 {
                drop(write);
                self.raise(stream, Events::OUT, true);
                stream.shared.wake_writers();
            }
        }

        self.update_retransmission_timer(key, stream, seg.ts);
        self.request_send_if_unsent(key, stream);
    }
}

impl Core {
    /// Create the receive buffer on first use.
    ///
    /// Returns `false` when the pool is exhausted.
    pub(super) fn ensure_recv_buffer(&self, stream: &Stream) -> bool {
        let mut read = stream.shared.read.lock();
        if read.buffer.is_some() {
            return true;
        }

        match self.shared.recv_pool.alloc() {
            Ok(chunk) => {
                let buffer = RecvBuffer::new(chunk, stream.recv.irs + 1);
                read.window = buffer.size() as u32;
                read.buffer = Some(buffer);
                true
            },
            Err(_) => false,
        }
    }
}
