//! Lookup of streams by four-tuple and of listeners by port.
//!
//! Both are open-chained: a fixed number of bins, each a short list scanned linearly. The tables
//! never rehash, the bin count is fixed by the configuration.
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::managed::Key;
use crate::socket::SocketId;
use crate::storage::handoff::{self, Consumer, Producer};
use crate::wire::SocketAddr;

use super::connection::StreamShared;

/// The identity of a connection, as seen from our side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FourTuple {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

/// Streams by four-tuple.
#[derive(Debug)]
pub struct FlowTable {
    bins: Vec<Vec<(FourTuple, Key)>>,
    len: usize,
}

/// Listeners by local port.
#[derive(Debug)]
pub struct ListenerTable {
    bins: Vec<Vec<Arc<Listener>>>,
}

/// A bound socket accepting connections.
///
/// The network thread pushes every stream that completed its handshake into the accept queue,
/// application threads take them out in `accept`.
pub struct Listener {
    pub addr: SocketAddr,
    pub socket: SocketId,
    backlog: usize,
    accept_tx: Mutex<Producer<Arc<StreamShared>>>,
    accept_rx: Mutex<Consumer<Arc<StreamShared>>>,
    cond: Condvar,
    closed: AtomicBool,
}

/// Outcome of waiting on the accept queue.
#[derive(Debug)]
pub(crate) enum Accepted {
    Stream(Arc<StreamShared>),
    /// Nothing queued and the caller did not want to wait.
    Empty,
    /// The wait was cut short by a cancellation.
    Interrupted,
}

/// One-at-a-time hash of the four-tuple, as 12 bytes.
pub fn flow_hash(tuple: &FourTuple) -> u32 {
    let mut bytes = [0; 12];
    bytes[0..4].copy_from_slice(&tuple.local.addr.0);
    bytes[4..8].copy_from_slice(&tuple.remote.addr.0);
    bytes[8..10].copy_from_slice(&tuple.local.port.to_be_bytes());
    bytes[10..12].copy_from_slice(&tuple.remote.port.to_be_bytes());

    let mut hash = 0u32;
    for &byte in bytes.iter() {
        hash = hash.wrapping_add(u32::from(byte));
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

impl FlowTable {
    /// Create a table, the bin count is rounded up to a power of two.
    pub fn new(bins: usize) -> Self {
        let bins = bins.max(1).next_power_of_two();
        FlowTable {
            bins: (0..bins).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    fn bin(&self, tuple: &FourTuple) -> usize {
        flow_hash(tuple) as usize & (self.bins.len() - 1)
    }

    /// Register a stream, failing if its tuple is taken already.
    pub fn insert(&mut self, tuple: FourTuple, key: Key) -> Result<(), Key> {
        let bin = self.bin(&tuple);
        let bin = &mut self.bins[bin];
        if let Some((_, existing)) = bin.iter().find(|(other, _)| *other == tuple) {
            return Err(*existing);
        }

        bin.push((tuple, key));
        self.len += 1;
        Ok(())
    }

    pub fn get(&self, tuple: &FourTuple) -> Option<Key> {
        self.bins[self.bin(tuple)].iter()
            .find(|(other, _)| other == tuple)
            .map(|&(_, key)| key)
    }

    pub fn remove(&mut self, tuple: &FourTuple) -> Option<Key> {
        let bin = self.bin(tuple);
        let bin = &mut self.bins[bin];
        let idx = bin.iter().position(|(other, _)| other == tuple)?;
        self.len -= 1;
        Some(bin.swap_remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ListenerTable {
    pub fn new(bins: usize) -> Self {
        let bins = bins.max(1).next_power_of_two();
        ListenerTable {
            bins: (0..bins).map(|_| Vec::new()).collect(),
        }
    }

    fn bin(&self, port: u16) -> usize {
        usize::from(port) & (self.bins.len() - 1)
    }

    /// Add a listener, failing when its port has one already.
    pub fn insert(&mut self, listener: Arc<Listener>) -> Result<(), Arc<Listener>> {
        let port = listener.addr.port;
        if self.get(port).is_some() {
            return Err(listener);
        }

        let bin = self.bin(port);
        self.bins[bin].push(listener);
        Ok(())
    }

    pub fn get(&self, port: u16) -> Option<&Arc<Listener>> {
        self.bins[self.bin(port)].iter()
            .find(|listener| listener.addr.port == port)
    }

    pub fn remove(&mut self, port: u16) -> Option<Arc<Listener>> {
        let bin = self.bin(port);
        let bin = &mut self.bins[bin];
        let idx = bin.iter().position(|listener| listener.addr.port == port)?;
        Some(bin.swap_remove(idx))
    }
}

impl Listener {
    pub(crate) fn new(addr: SocketAddr, socket: SocketId, backlog: usize) -> Self {
        let (tx, rx) = handoff::queue(backlog);
        Listener {
            addr,
            socket,
            backlog,
            accept_tx: Mutex::new(tx),
            accept_rx: Mutex::new(rx),
            cond: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn backlog(&self) -> usize {
        self.backlog
    }

    /// Hand a freshly established stream to the application.
    ///
    /// Gives the stream back when the queue is full or the listener closed meanwhile.
    pub(crate) fn push(&self, stream: Arc<StreamShared>) -> Result<(), Arc<StreamShared>> {
        // Under the producer lock a close either sees the stream or the push sees the flag.
        let mut tx = self.accept_tx.lock();
        if self.is_closed() {
            return Err(stream);
        }
        tx.enqueue(stream)?;
        drop(tx);
        // Acquire the consumer side so the wake can not slip between a check and a wait.
        drop(self.accept_rx.lock());
        self.cond.notify_all();
        Ok(())
    }

    /// Take the oldest established stream.
    ///
    /// Blocks until one arrives unless `nonblocking`. The `cancelled` check is consulted on every
    /// wake, a wake with nothing queued and the check raised interrupts the wait.
    pub(crate) fn pop<F>(&self, nonblocking: bool, cancelled: F) -> Accepted
        where F: Fn() -> bool
    {
        let mut rx = self.accept_rx.lock();
        loop {
            if let Some(stream) = rx.dequeue() {
                return Accepted::Stream(stream);
            }
            if nonblocking {
                return Accepted::Empty;
            }
            if cancelled() || self.is_closed() {
                return Accepted::Interrupted;
            }
            self.cond.wait(&mut rx);
        }
    }

    /// If more streams wait to be accepted.
    pub(crate) fn pending(&self) -> usize {
        self.accept_rx.lock().len()
    }

    /// Stop accepting, returning all streams that were never accepted.
    pub(crate) fn close(&self) -> Vec<Arc<StreamShared>> {
        let tx = self.accept_tx.lock();
        self.closed.store(true, Ordering::Release);
        let mut rx = self.accept_rx.lock();
        let orphans = core::iter::from_fn(|| rx.dequeue()).collect();
        drop(rx);
        drop(tx);
        self.cond.notify_all();
        orphans
    }

    pub(crate) fn wake(&self) {
        drop(self.accept_rx.lock());
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Display for FourTuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} <-> {}", self.local, self.remote)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.addr)
            .field("socket", &self.socket)
            .field("backlog", &self.backlog)
            .field("closed", &self.is_closed())
            .finish()
    }
}
