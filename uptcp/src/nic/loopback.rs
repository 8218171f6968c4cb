use std::collections::VecDeque;

use super::{Device, Disposition, Packet, Recv};
use crate::layer::Result;
use crate::wire::Ipv4Address as Address;

/// An in-memory device.
///
/// Either feeds every transmitted segment back into its own receive queue, or keeps them for
/// inspection. Segments can also be injected from outside, which is how tests play the peer.
#[derive(Debug, Default)]
pub struct Loopback {
    inbound: VecDeque<Frame>,
    acquired: Vec<Frame>,
    sent: VecDeque<Frame>,
    /// Buffers that may be acquired per burst.
    tx_capacity: usize,
    looped: bool,
}

/// One segment with its network addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub src: Address,
    pub dst: Address,
    pub payload: Vec<u8>,
}

impl Loopback {
    /// A device receiving everything it transmits.
    pub fn new(tx_capacity: usize) -> Self {
        Loopback {
            tx_capacity,
            looped: true,
            ..Loopback::default()
        }
    }

    /// A device keeping transmitted segments for [`take_sent`].
    ///
    /// [`take_sent`]: #method.take_sent
    pub fn capture(tx_capacity: usize) -> Self {
        Loopback {
            tx_capacity,
            looped: false,
            ..Loopback::default()
        }
    }

    /// Queue a segment for reception.
    pub fn inject(&mut self, src: Address, dst: Address, payload: Vec<u8>) {
        self.inbound.push_back(Frame { src, dst, payload });
    }

    /// Remove all captured segments, oldest first.
    pub fn take_sent(&mut self) -> Vec<Frame> {
        self.sent.drain(..).collect()
    }

    /// Change how many buffers may be acquired per burst.
    pub fn set_tx_capacity(&mut self, tx_capacity: usize) {
        self.tx_capacity = tx_capacity;
    }

    pub fn pending_rx(&self) -> usize {
        self.inbound.len()
    }
}

impl Device for Loopback {
    fn rx<R: Recv>(&mut self, max: usize, mut receptor: R) -> Result<usize> {
        let mut count = 0;
        while count < max {
            let frame = match self.inbound.pop_front() {
                None => break,
                Some(frame) => frame,
            };

            let disposition = receptor.receive(Packet {
                src: frame.src,
                dst: frame.dst,
                payload: &frame.payload,
            });
            if disposition == Disposition::Ignored {
                net_trace!("loopback: segment {} -> {} ignored", frame.src, frame.dst);
            }
            count += 1;
        }
        Ok(count)
    }

    fn acquire(&mut self, src: Address, dst: Address, len: usize) -> Option<&mut [u8]> {
        if self.acquired.len() >= self.tx_capacity {
            return None;
        }

        self.acquired.push(Frame { src, dst, payload: vec![0; len] });
        self.acquired.last_mut().map(|frame| &mut frame.payload[..])
    }

    fn send_burst(&mut self) -> Result<usize> {
        let count = self.acquired.len();
        let target = if self.looped { &mut self.inbound } else { &mut self.sent };
        target.extend(self.acquired.drain(..));
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nic::FnHandler;

    const A: Address = Address([10, 0, 0, 1]);
    const B: Address = Address([10, 0, 0, 2]);

    #[test]
    fn loops_back() {
        let mut nic = Loopback::new(2);
        nic.acquire(A, B, 3).unwrap().copy_from_slice(b"abc");
        nic.acquire(B, A, 1).unwrap()[0] = b'x';
        assert!(nic.acquire(A, B, 1).is_none());
        assert_eq!(nic.send_burst(), Ok(2));

        let mut seen = Vec::new();
        let handler = FnHandler(|packet: Packet| {
            seen.push((packet.src, packet.payload.to_vec()));
            Disposition::Consumed
        });
        assert_eq!(nic.rx(10, handler), Ok(2));
        assert_eq!(seen, vec![(A, b"abc".to_vec()), (B, b"x".to_vec())]);
    }

    #[test]
    fn captures() {
        let mut nic = Loopback::capture(4);
        nic.acquire(A, B, 2).unwrap();
        nic.send_burst().unwrap();
        assert_eq!(nic.pending_rx(), 0);
        assert_eq!(nic.take_sent(), vec![Frame { src: A, dst: B, payload: vec![0, 0] }]);
    }
}
