//! The TCP layer.
//!
//! Holds the state machine of every connection, the tables to find them and the scheduler writing
//! their segments. All of it is owned by the [`Endpoint`] and only ever touched by the network
//! thread. Application threads see the [`StreamShared`] record of a connection, nothing else.
//!
//! As a guide to the statemachine, based on
//! > EFSM/SDL modeling of the original TCP standard (RFC793) and the Congestion Control Mechanism
//! of TCP Reno, Raid Y. Zaghal and Javed I. Khan,
//! > possibly available here: http://medianet.kent.edu/techreports/TR2005-07-22-tcp-EFSM.pdf
//!
//! Note that they make a number of simplifying assumptions which we must refute:
//! * '2-The TCP endpoint has unlimited buffer space'
//!
//!   Buffers come from fixed pools. A segment that does not fit into the receive buffer is
//!   dropped, a stream for which no buffer can be had is closed.
//! * A timer timeout is used to retransmit queue packets. The timers are checked once per poll,
//!   their resolution is that of the poll loop.
//!
//! ## Structure
//!
//! * `input` validates a received segment and runs the handler of the current state.
//! * `output` holds the three output lists and writes segments into device buffers.
//! * `timer` is the retransmission wheel next to the time-wait and idle lists.
//! * `table` finds streams by four-tuple and listeners by port.
//!
//! Handlers never send anything themselves. They only link the stream into an output list, the
//! segment is built when the list is drained at the end of the poll.
//!
//! ## Accepting connections
//!
//! A SYN to a port with a listener creates a stream straight away. Once the handshake completes
//! the stream is pushed into the accept queue of the listener, where `accept` picks it up.
//!
//! [`Endpoint`]: struct.Endpoint.html
//! [`StreamShared`]: struct.StreamShared.html
mod connection;
mod endpoint;
mod input;
mod output;
mod siphash;
mod table;
mod timer;

#[cfg(test)]
mod tests;

pub use self::connection::{CloseReason, State, StreamShared};
pub use self::endpoint::Endpoint;
pub use self::siphash::IsnGenerator;
pub use self::table::{FourTuple, Listener};

pub(crate) use self::endpoint::{requests, Request, Requests};
pub(crate) use self::table::{Accepted, ListenerTable};
