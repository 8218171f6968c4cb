//! The process logic of protocol layers.
//!
//! ## Layering
//!
//! The packet logic is contained in `wire` and the processing part in this module. An endpoint
//! represents the local state of a protocol. In this crate there is a single such protocol, TCP
//! over IPv4, and its endpoint is owned by exactly one network thread.
//!
//! ## Receiving
//!
//! The device hands each decoded IPv4 datagram carrying TCP to [`tcp::Endpoint::process`]. The
//! segment is validated, demultiplexed by its four-tuple and fed to the state machine of that
//! connection. Nothing is written during receive; any reply is scheduled.
//!
//! ## Sending
//!
//! All output happens in a dedicated phase of the poll loop. The scheduler drains its control,
//! data and ack lists, acquires one transmit buffer per segment from the device and writes the
//! headers directly into it.
//!
//! [`tcp::Endpoint::process`]: tcp/struct.Endpoint.html#method.process
pub mod tcp;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// The operation was not permitted.
    ///
    /// Returned when the device, endpoint, receiver or sender does not allow or implement an
    /// operation, or when the state of a connection does not allow it.
    Illegal,

    /// Not enough space for the requested packet.
    ///
    /// May also be returned when a segment does not fit into the window or buffer. In contrast to
    /// `Illegal` this would signal that a smaller size may be possible.
    BadSize,

    /// The action could not be completed because there were not enough resources.
    ///
    /// The main difference towards `Illegal` is that implies that it would have been legal with
    /// more resources. Pools and queues of fixed capacity return this when full.
    Exhausted,

    /// A packet could not be parsed.
    Malformed,

    /// A packet failed checksum validation.
    Checksum,
}

/// Can convert from a wire error.
///
/// This indicates some layer tried to operate on a packet but failed.
impl From<crate::wire::Error> for Error {
    fn from(err: crate::wire::Error) -> Self {
        use crate::wire::Error as WireError;
        match err {
            WireError::Truncated => Error::BadSize,
            WireError::Malformed => Error::Malformed,
            WireError::Checksum => Error::Checksum,
        }
    }
}
