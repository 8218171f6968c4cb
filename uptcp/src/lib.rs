//! A userspace TCP engine.
//!
//! The engine owns every piece of per-connection state and drives it directly on packet buffers
//! handed over by a raw NIC transport. It is split in two halves that share nothing but a few
//! locks and single-producer queues:
//!
//! * The [`Endpoint`] is the network half. Exactly one thread owns it and polls it in a loop. It
//!   runs the state machine, owns the send and receive buffers, the timers and the output
//!   scheduler.
//! * The [`Stack`] is the application half. It is cheaply cloneable and offers the familiar socket
//!   calls (`socket`, `bind`, `listen`, `accept`, `connect`, `recv`, `send`, `close`) plus an
//!   epoll-like readiness interface.
//!
//! ```no_run
//! use uptcp::{Config, Stack, time::Instant};
//! use uptcp::nic::loopback::Loopback;
//!
//! let (stack, mut endpoint) = Stack::new(Config::default());
//! let mut nic = Loopback::new(1 << 16);
//! std::thread::spawn(move || loop {
//!     let _ = endpoint.poll(Instant::now(), &mut nic);
//! });
//!
//! let sock = stack.socket().unwrap();
//! stack.bind(sock, ([10, 0, 0, 1], 80).into()).unwrap();
//! stack.listen(sock, 16).unwrap();
//! ```
//!
//! [`Endpoint`]: layer/tcp/struct.Endpoint.html
//! [`Stack`]: socket/struct.Stack.html
#[cfg(feature = "log")]
#[macro_use]
extern crate log;

#[macro_use] mod macros;
pub mod config;
pub mod layer;
pub mod managed;
pub mod nic;
pub mod readiness;
pub mod socket;
pub mod storage;
pub mod time;
pub mod wire;

pub use config::Config;
pub use layer::tcp::Endpoint;
pub use socket::{Errno, SocketId, Stack};
