//! The send half of the state machine.
//!
//! A stream with something to say is linked into exactly one of three output lists: control for
//! handshake, FIN and RST segments, send for payload and ack for pure acknowledgments. Moving
//! between them follows fixed precedence rules. A stream on the send list that also owes a control
//! segment remembers so in `control_list_waiting` and moves once its data is out.
//!
//! Output happens only in [`Endpoint::poll`], in the order of pending resets, control, ack and
//! finally data segments. When the device runs out of buffers the current stream is put back and
//! the phase ends, it is resumed in the next poll.
//!
//! [`Endpoint::poll`]: struct.Endpoint.html#method.poll
use crate::config::consts;
use crate::layer::{Error, Result};
use crate::managed::{Chain, Key};
use crate::nic::Device;
use crate::time::Timestamp;
use crate::wire::tcp::{Flags, Packet, Repr, SeqNumber};

use super::connection::{AckOpt, State, Stream};
use super::endpoint::{Core, Endpoint};
use super::table::FourTuple;

pub(super) const CONTROL: Chain = Chain(0);
pub(super) const SEND: Chain = Chain(1);
pub(super) const ACK: Chain = Chain(2);
pub(super) const SENDER_CHAINS: usize = 3;

/// A reset for a segment that has no stream.
#[derive(Clone, Copy, Debug)]
pub(super) struct Reply {
    tuple: FourTuple,
    seq: SeqNumber,
    ack: Option<SeqNumber>,
    ts: Timestamp,
}

/// What a segment is sent for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Control,
    Data(usize),
    /// A zero window probe, repeating the last sent byte's sequence number.
    Probe,
}

impl Core {
    /// Schedule a reset for a segment without a stream.
    pub(super) fn reply_rst(&mut self, tuple: FourTuple, seq: SeqNumber, ack: Option<SeqNumber>, ts: Timestamp) {
        if self.replies.len() >= self.config.max_concurrency {
            net_debug!("tcp: {} reset dropped, too many pending", tuple);
            return;
        }

        net_trace!("tcp: {} reset seq {} ack {:?}", tuple, seq, ack);
        self.replies.push_back(Reply { tuple, seq, ack, ts });
    }

    /// Schedule a control segment.
    pub(super) fn request_control(&mut self, key: Key, stream: &mut Stream) {
        let idx = key.index();
        match self.sender.chain_of(idx) {
            Some(CONTROL) => (),
            Some(SEND) => stream.control_list_waiting = true,
            Some(_) => {
                self.sender.remove(idx);
                self.sender.push_back(CONTROL, idx);
            },
            None => self.sender.push_back(CONTROL, idx),
        }
    }

    /// Schedule payload segments.
    ///
    /// A stream on the control list moves once its control segment was sent.
    pub(super) fn request_send(&mut self, key: Key, _: &mut Stream) {
        let idx = key.index();
        match self.sender.chain_of(idx) {
            Some(CONTROL) | Some(SEND) => (),
            Some(_) => {
                self.sender.remove(idx);
                self.sender.push_back(SEND, idx);
            },
            None => self.sender.push_back(SEND, idx),
        }
    }

    /// Schedule payload segments if any byte was not sent yet.
    pub(super) fn request_send_if_unsent(&mut self, key: Key, stream: &mut Stream) {
        if has_unsent(stream) {
            self.request_send(key, stream);
        }
    }

    /// Take the stream off the send list.
    pub(super) fn unschedule_send(&mut self, key: Key) {
        if self.sender.chain_of(key.index()) == Some(SEND) {
            self.sender.remove(key.index());
        }
    }

    /// Schedule an acknowledgment.
    ///
    /// Any other list sends one as well, only an unlisted stream joins the ack list.
    pub(super) fn request_ack(&mut self, key: Key, stream: &mut Stream, opt: AckOpt) {
        stream.request_ack(opt);
        if self.sender.chain_of(key.index()).is_none() {
            self.sender.push_back(ACK, key.index());
        }
    }

    /// Write a pending reset.
    fn send_reply<D: Device>(&mut self, dev: &mut D, reply: &Reply) -> Result<()> {
        let mut flags = Flags::RST;
        flags.set_ack(reply.ack.is_some());
        let repr = Repr {
            src_port: reply.tuple.local.port,
            dst_port: reply.tuple.remote.port,
            flags,
            seq_number: reply.seq,
            ack_number: reply.ack,
            window_len: 0,
            window_scale: None,
            max_seg_size: None,
            sack_permitted: false,
            timestamp: Some((reply.ts.0, 0)),
            payload_len: 0,
        };

        let (src, dst) = (reply.tuple.local.addr, reply.tuple.remote.addr);
        let buffer = dev.acquire(src, dst, repr.buffer_len()).ok_or(Error::Exhausted)?;
        let mut packet = Packet::new_unchecked(buffer);
        repr.emit(&mut packet);
        packet.fill_checksum(src, dst);
        Ok(())
    }

    /// Build and write one segment of a stream.
    fn emit<D: Device>(&mut self, dev: &mut D, key: Key, stream: &mut Stream, flags: Flags, kind: Kind)
        -> Result<()>
    {
        let ts = self.now;
        let payload_len = match kind {
            Kind::Data(len) => len,
            _ => 0,
        };
        let seq = match kind {
            Kind::Probe => stream.snd_nxt - 1,
            _ if flags.fin() => stream.send.fss,
            _ => stream.snd_nxt,
        };
        let ack_number = if flags.ack() { Some(stream.rcv_nxt) } else { None };

        let window = {
            let read = stream.shared.read.lock();
            let window = if flags.syn() {
                read.window
            } else {
                read.window >> stream.send.wscale_mine
            };
            window.min(u32::from(u16::max_value()))
        };

        let syn = flags.syn();
        let repr = Repr {
            src_port: stream.tuple.local.port,
            dst_port: stream.tuple.remote.port,
            flags,
            seq_number: seq,
            ack_number,
            window_len: window as u16,
            window_scale: if syn { Some(stream.send.wscale_mine) } else { None },
            max_seg_size: if syn { Some(self.config.mss) } else { None },
            sack_permitted: false,
            timestamp: Some((ts.0, stream.recv.ts_recent)),
            payload_len,
        };

        let write = stream.shared.write.lock();
        if payload_len > 0 && write.buffer.is_none() {
            return Err(Error::Illegal);
        }

        let (src, dst) = (stream.tuple.local.addr, stream.tuple.remote.addr);
        let buffer = dev.acquire(src, dst, repr.buffer_len()).ok_or(Error::Exhausted)?;
        let mut packet = Packet::new_unchecked(buffer);
        repr.emit(&mut packet);
        if let (true, Some(data)) = (payload_len > 0, write.buffer.as_ref()) {
            let offset = seq.since(data.head_seq()) as usize;
            let chunk = data.get(offset, payload_len);
            packet.payload_mut()[..chunk.len()].copy_from_slice(chunk);
        }
        packet.fill_checksum(src, dst);
        drop(write);

        net_trace!("tcp: {} sent [{}] seq {} ack {:?} len {} win {}",
            stream.tuple, flags, seq, ack_number, payload_len, window);

        if window == 0 {
            stream.shared.need_wnd_adv.store(true, core::sync::atomic::Ordering::Release);
        }
        if flags.ack() {
            stream.send.ts_lastack_sent = ts;
        }
        stream.last_active = ts;
        if self.timers.on_idle(key.index()) {
            self.timers.touch_idle(key.index(), ts);
        }
        if flags.fin() {
            stream.send.is_fin_sent = true;
        }

        if kind != Kind::Probe {
            let end = seq + repr.sequence_len();
            if end > stream.snd_nxt {
                stream.snd_nxt = end;
            }
            if repr.sequence_len() > 0 && !self.timers.on_rto(key.index()) {
                stream.send.ts_rto = ts + stream.send.rto;
                self.timers.add_rto(key.index(), stream.send.ts_rto, ts);
            }
        }

        Ok(())
    }

    /// Send the control segment the state calls for.
    ///
    /// Returns `false` when the device had no buffer, the stream is then back at the front of the
    /// control list.
    fn send_control<D: Device>(&mut self, dev: &mut D, key: Key, stream: &mut Stream) -> bool {
        let flags = match stream.state {
            State::SynSent => Flags::SYN,
            State::SynReceived => {
                stream.snd_nxt = stream.send.iss;
                Flags::SYN | Flags::ACK
            },
            State::Established | State::CloseWait | State::FinWait2 | State::TimeWait
                | State::Listen => Flags::ACK,
            State::FinWait1 | State::LastAck => {
                if stream.snd_nxt < stream.send.fss {
                    // The FIN follows the data still queued.
                    stream.control_list_waiting = true;
                    self.request_send(key, stream);
                    return true;
                }
                Flags::FIN | Flags::ACK
            },
            State::Closing => {
                if !stream.send.is_fin_sent || stream.snd_nxt == stream.send.fss {
                    Flags::FIN | Flags::ACK
                } else {
                    Flags::ACK
                }
            },
            State::Closed => Flags::RST | Flags::ACK,
        };

        if self.emit(dev, key, stream, flags, Kind::Control).is_err() {
            self.sender.push_front(CONTROL, key.index());
            return false;
        }

        if stream.state == State::Closed {
            net_debug!("tcp: {} reset sent", stream.tuple);
            self.destroy(key, stream);
            return true;
        }

        stream.send.ack_cnt = stream.send.ack_cnt.saturating_sub(1);
        if flushable(stream.state) && has_unsent(stream) {
            self.request_send(key, stream);
        } else if stream.owes_ack() {
            self.sender.push_back(ACK, key.index());
        }
        true
    }

    /// Send pending acknowledgments and a window probe.
    fn send_acks<D: Device>(&mut self, dev: &mut D, key: Key, stream: &mut Stream) -> bool {
        let to_ack = match stream.state {
            State::Established | State::CloseWait | State::FinWait1 | State::FinWait2
                | State::TimeWait => stream.shared.read.lock().buffer.is_some(),
            _ => false,
        };

        if to_ack {
            while stream.send.ack_cnt > 0 {
                if self.emit(dev, key, stream, Flags::ACK, Kind::Control).is_err() {
                    self.sender.push_front(ACK, key.index());
                    return false;
                }
                stream.send.ack_cnt -= 1;
            }

            if stream.send.is_wack {
                if self.emit(dev, key, stream, Flags::ACK, Kind::Probe).is_err() {
                    self.sender.push_front(ACK, key.index());
                    return false;
                }
                stream.send.is_wack = false;
            }
        } else {
            stream.send.ack_cnt = 0;
            stream.send.is_wack = false;
        }

        if stream.control_list_waiting {
            stream.control_list_waiting = false;
            self.request_control(key, stream);
        }
        true
    }

    /// Send payload as far as the windows allow.
    fn flush<D: Device>(&mut self, dev: &mut D, key: Key, stream: &mut Stream) -> bool {
        if flushable(stream.state) && !stream.have_reset {
            loop {
                let end = match stream.shared.write.lock().buffer.as_ref() {
                    Some(buffer) => buffer.tail_seq(),
                    None => break,
                };
                if stream.snd_nxt >= end {
                    break;
                }

                let in_flight = stream.snd_nxt.since(stream.send.una).max(0) as u32;
                let window = stream.send.cwnd.min(stream.send.peer_wnd);
                if in_flight >= window {
                    let probe_after = consts::WINDOW_PROBE_MS * self.config.hz / 1000;
                    let blocked = in_flight >= stream.send.peer_wnd;
                    let quiet = self.now.since(stream.send.ts_lastack_sent) > probe_after as i32;
                    if blocked && quiet && !stream.send.is_wack {
                        self.request_ack(key, stream, AckOpt::WindowProbe);
                    }
                    return true;
                }

                let len = stream.send.eff_mss
                    .min(window - in_flight)
                    .min(end.since(stream.snd_nxt) as u32);
                if self.emit(dev, key, stream, Flags::ACK, Kind::Data(len as usize)).is_err() {
                    self.sender.push_back(SEND, key.index());
                    return false;
                }
                stream.send.ack_cnt = stream.send.ack_cnt.saturating_sub(1);
            }
        }

        if stream.control_list_waiting {
            stream.control_list_waiting = false;
            self.request_control(key, stream);
        } else if stream.owes_ack() {
            self.request_ack(key, stream, AckOpt::Aggregate);
        }
        true
    }
}

impl Endpoint {
    /// Write scheduled segments, until the device runs out of buffers or the budgets are spent.
    pub(super) fn write_chunks<D: Device>(&mut self, dev: &mut D) {
        let _ = self.write_replies(dev)
            && self.write_list(dev, CONTROL)
            && self.write_list(dev, ACK)
            && self.write_list(dev, SEND);
    }

    fn write_replies<D: Device>(&mut self, dev: &mut D) -> bool {
        while let Some(reply) = self.core.replies.pop_front() {
            if self.core.send_reply(dev, &reply).is_err() {
                self.core.replies.push_front(reply);
                return false;
            }
        }
        true
    }

    /// Drain one output list, serving at most the configured budget of streams.
    ///
    /// Streams linked during the pass are left for the next tick.
    fn write_list<D: Device>(&mut self, dev: &mut D, chain: Chain) -> bool {
        let budget = self.core.config.output_budget.min(self.core.sender.len(chain));
        for _ in 0..budget {
            let idx = match self.core.sender.pop_front(chain) {
                Some(idx) => idx,
                None => break,
            };
            let key = match self.streams.key_at(idx) {
                Some(key) => key,
                None => continue,
            };

            let mut more = true;
            self.with_stream(key, |core, key, stream| {
                more = match chain {
                    CONTROL => core.send_control(dev, key, stream),
                    ACK => core.send_acks(dev, key, stream),
                    _ => core.flush(dev, key, stream),
                };
            });
            if !more {
                return false;
            }
        }
        true
    }
}

/// If the state permits sending payload.
fn flushable(state: State) -> bool {
    match state {
        State::Established | State::CloseWait | State::FinWait1 | State::LastAck
            | State::Closing => true,
        _ => false,
    }
}

/// If the send buffer holds bytes beyond `snd_nxt`.
fn has_unsent(stream: &Stream) -> bool {
    match stream.shared.write.lock().buffer.as_ref() {
        Some(buffer) => stream.snd_nxt < buffer.tail_seq(),
        None => false,
    }
}
