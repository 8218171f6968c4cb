//! Low-level packet access and construction.
//!
//! The `wire` module deals with the packet *representation*. It provides two levels of
//! functionality.
//!
//!  * First, it provides functions to extract fields from sequences of octets, and to insert
//!    fields into sequences of octets. This happens `Packet` family of structures, e.g.
//!    [tcp::Packet].
//!  * Second, in cases where the space of valid field values is much smaller than the space of
//!    possible field values, it provides a compact, high-level representation of packet data that
//!    can be parsed from and emitted into a sequence of octets. This happens through the `Repr`
//!    family of structs and enums, e.g. [tcp::Repr].
//!
//! Only the TCP segment itself is handled here. Link and network framing belong to the device,
//! which hands over the IPv4 addresses next to the segment so the pseudo header checksum can be
//! computed.
//!
//! [tcp::Packet]: tcp/struct.Packet.html
//! [tcp::Repr]: tcp/struct.Repr.html
mod error;
pub mod ip;
pub mod tcp;

pub use self::error::{Error, Result};
pub use self::ip::{Address as Ipv4Address, SocketAddr};

pub(crate) mod field {
    pub type Field = ::core::ops::Range<usize>;
}
