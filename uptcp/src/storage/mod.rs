//! Memory of the data path.
//!
//! Buffers are carved out of [`ChunkPool`]s reserved up front. Requests cross threads through the
//! bounded queues in [`handoff`].
//!
//! [`ChunkPool`]: struct.ChunkPool.html
//! [`handoff`]: handoff/index.html
mod chunk;
pub mod handoff;
mod recv;
mod send;

pub use self::chunk::{Chunk, ChunkPool};
pub use self::recv::{Caller, RecvBuffer};
pub use self::send::SendBuffer;
