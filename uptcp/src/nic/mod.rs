//! Encapsulates a network interface card.
//!
//! Also permits software emulation or implementation of one as well, of course. The engine never
//! performs raw device I/O itself. A device decodes link and network framing and hands over the
//! TCP segments of IPv4 datagrams; for output it provides buffers that it frames and transmits as
//! a burst.
pub mod loopback;

use crate::layer::Result;
use crate::wire::Ipv4Address as Address;

/// A received TCP segment with the addresses of its IPv4 datagram.
#[derive(Clone, Copy, Debug)]
pub struct Packet<'a> {
    pub src: Address,
    pub dst: Address,
    /// The TCP header and payload.
    pub payload: &'a [u8],
}

/// What became of a received packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The segment was processed, possibly by dropping it as a protocol violation.
    Consumed,
    /// The segment was not for us or could not be parsed.
    Ignored,
}

pub trait Device {
    /// Receive some packets with the specified receptor.
    ///
    /// Should return the number of processed packets for convenience.
    fn rx<R: Recv>(&mut self, max: usize, receptor: R) -> Result<usize>;

    /// Acquire a buffer for one outgoing segment of exactly `len` bytes.
    ///
    /// The device owns the buffer and transmits it with the next burst. Returns `None` when no
    /// buffer is available right now, the caller is expected to retry on a later poll.
    fn acquire(&mut self, src: Address, dst: Address, len: usize) -> Option<&mut [u8]>;

    /// Transmit all acquired buffers.
    ///
    /// Should return the number of sent packets.
    fn send_burst(&mut self) -> Result<usize>;
}

pub trait Recv {
    /// Receive a single packet.
    fn receive(&mut self, packet: Packet) -> Disposition;
}

impl<R: Recv + ?Sized> Recv for &'_ mut R {
    fn receive(&mut self, packet: Packet) -> Disposition {
        (**self).receive(packet)
    }
}

/// A standard wrapper for a function implementing the receive trait.
pub struct FnHandler<F>(pub F);

impl<F> Recv for FnHandler<F>
    where F: FnMut(Packet) -> Disposition
{
    fn receive(&mut self, packet: Packet) -> Disposition {
        (self.0)(packet)
    }
}
