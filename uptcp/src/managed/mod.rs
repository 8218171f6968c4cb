//! Fixed-capacity containers addressed by stable indices.
//!
//! Every record the network thread touches at high rate (streams, sockets, list links) lives in
//! one of these. They allocate once at construction and never grow.
mod list;
mod slotmap;

pub use self::list::{Chains, Chain};
pub use self::slotmap::{Key, SlotMap};
