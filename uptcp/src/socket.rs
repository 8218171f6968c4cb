//! The application half of a stack.
//!
//! A [`Stack`] hands out socket ids and implements the familiar calls on them. Any number of
//! threads may use clones of one stack concurrently. They never touch the state machine, all of
//! their requests reach the network thread through the handoff queues and they only ever wait on
//! the locks and condition variables of the records they share with it.
//!
//! Blocking calls park on the condition variable of their stream, listener or readiness context.
//! Every wake checks the shutdown flag of the stack, a raised flag ends the call with `EINTR`.
//!
//! [`Stack`]: struct.Stack.html
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::layer::tcp::{
    requests, Accepted, CloseReason, Endpoint, IsnGenerator, Listener, ListenerTable, Request,
    Requests, State, StreamShared, FourTuple};
use crate::managed::{Key, SlotMap};
use crate::readiness::{Ctl, Event, Events, Queue, Readiness, Stats};
use crate::storage::{Caller, ChunkPool, SendBuffer};
use crate::time::{Duration, Instant};
use crate::wire::SocketAddr;

pub type Result<T> = core::result::Result<T, Errno>;

/// First port handed out to sockets connecting without a bound port.
const EPHEMERAL_FIRST: u16 = 32768;
const EPHEMERAL_COUNT: u16 = 28232;

/// Identifies an open socket of a stack.
///
/// Ids of closed sockets are never valid again, even when their slot is reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SocketId(pub(crate) Key);

/// Failure of a socket call, named after the POSIX error code it stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Errno {
    /// The socket id is not valid.
    EBADF,
    /// The socket is of the wrong kind for the call.
    ENOTSOCK,
    ENOTCONN,
    EINVAL,
    /// The call would have to block.
    EAGAIN,
    /// A blocking call was interrupted by a shutdown.
    EINTR,
    EADDRINUSE,
    /// The socket table is full.
    ENFILE,
    ENOMEM,
    EEXIST,
    ENOENT,
    EAFNOSUPPORT,
    EISCONN,
    /// A connection attempt is already in progress.
    EALREADY,
    /// The peer refused the connection with a reset.
    ECONNREFUSED,
    ETIMEDOUT,
}

/// The handle on a stack used by application threads.
#[derive(Clone)]
pub struct Stack {
    shared: Arc<Shared>,
}

/// State shared between the stack handles and the endpoint.
pub(crate) struct Shared {
    pub(crate) config: Config,
    sockets: Mutex<SlotMap<Descriptor>>,
    pub(crate) listeners: Mutex<ListenerTable>,
    /// The one readiness context of the stack, if created.
    pub(crate) readiness: Mutex<Option<Arc<Readiness>>>,
    pub(crate) requests: Requests,
    pub(crate) send_pool: ChunkPool,
    pub(crate) recv_pool: ChunkPool,
    pub(crate) isn: IsnGenerator,
    /// Milliseconds of the network clock as of the last poll.
    pub(crate) clock: AtomicI64,
    done: AtomicBool,
    next_port: AtomicU16,
}

#[derive(Clone, Debug)]
struct Descriptor {
    kind: Kind,
    bound: Option<SocketAddr>,
    nonblocking: bool,
}

#[derive(Clone, Debug)]
enum Kind {
    /// Neither listening nor connected yet.
    Fresh,
    Stream(Arc<StreamShared>),
    Listener(Arc<Listener>),
    Readiness(Arc<Readiness>),
}

impl Stack {
    /// Create a stack and the endpoint of its network thread.
    ///
    /// The buffer pools are reserved in full right here.
    pub fn new(config: Config) -> (Stack, Endpoint) {
        let (requests, inbox) = requests(config.max_concurrency);
        let shared = Arc::new(Shared {
            sockets: Mutex::new(SlotMap::with_capacity(config.max_concurrency)),
            listeners: Mutex::new(ListenerTable::new(config.listener_bins)),
            readiness: Mutex::new(None),
            requests,
            send_pool: ChunkPool::new(
                config.send_buffer,
                config.send_buffer * config.max_buffers,
                config.huge_pages),
            recv_pool: ChunkPool::new(
                config.recv_buffer,
                config.recv_buffer * config.max_buffers,
                config.huge_pages),
            isn: IsnGenerator::from_entropy(),
            clock: AtomicI64::new(0),
            done: AtomicBool::new(false),
            next_port: AtomicU16::new(0),
            config,
        });

        let endpoint = Endpoint::new(shared.clone(), inbox);
        (Stack { shared }, endpoint)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Open a new TCP socket.
    pub fn socket(&self) -> Result<SocketId> {
        let descriptor = Descriptor {
            kind: Kind::Fresh,
            bound: None,
            nonblocking: false,
        };
        let key = self.shared.sockets.lock().insert(descriptor).ok_or(Errno::ENFILE)?;
        Ok(SocketId(key))
    }

    /// Assign the local address of a socket.
    pub fn bind(&self, sock: SocketId, addr: SocketAddr) -> Result<()> {
        let mut sockets = self.shared.sockets.lock();
        let descriptor = sockets.get_mut(sock.0).ok_or(Errno::EBADF)?;
        if let Kind::Readiness(_) = descriptor.kind {
            return Err(Errno::ENOTSOCK);
        }
        if descriptor.bound.is_some() {
            return Err(Errno::EINVAL);
        }

        descriptor.bound = Some(addr);
        Ok(())
    }

    /// Accept connections on the bound port of a socket.
    ///
    /// A `backlog` of zero picks the configured default, larger ones are capped by it.
    pub fn listen(&self, sock: SocketId, backlog: usize) -> Result<()> {
        let mut sockets = self.shared.sockets.lock();
        let descriptor = sockets.get_mut(sock.0).ok_or(Errno::EBADF)?;
        let addr = match (&descriptor.kind, descriptor.bound) {
            (Kind::Readiness(_), _) => return Err(Errno::ENOTSOCK),
            (Kind::Stream(_), _) => return Err(Errno::EISCONN),
            (Kind::Listener(_), _) => return Err(Errno::EADDRINUSE),
            (Kind::Fresh, None) => return Err(Errno::EINVAL),
            (Kind::Fresh, Some(addr)) => addr,
        };

        let limit = self.shared.config.backlog;
        let backlog = if backlog == 0 { limit } else { backlog.min(limit) };
        let listener = Arc::new(Listener::new(addr, sock, backlog));
        self.shared.listeners.lock()
            .insert(listener.clone())
            .map_err(|_| Errno::EADDRINUSE)?;

        net_debug!("socket: {:?} listening on {} with backlog {}", sock, addr, backlog);
        descriptor.kind = Kind::Listener(listener);
        Ok(())
    }

    /// Take an established connection off a listening socket.
    ///
    /// The connection gets a fresh socket, returned along with the address of the peer.
    pub fn accept(&self, sock: SocketId) -> Result<(SocketId, SocketAddr)> {
        let descriptor = self.descriptor(sock)?;
        let listener = match descriptor.kind {
            Kind::Listener(listener) => listener,
            _ => return Err(Errno::EINVAL),
        };

        let stream = match listener.pop(descriptor.nonblocking, || self.is_shutdown()) {
            Accepted::Stream(stream) => stream,
            Accepted::Empty => return Err(Errno::EAGAIN),
            Accepted::Interrupted => return Err(Errno::EINTR),
        };

        let accepted = Descriptor {
            kind: Kind::Stream(stream.clone()),
            bound: Some(stream.tuple.local),
            nonblocking: false,
        };
        let key = match self.shared.sockets.lock().insert(accepted) {
            Some(key) => key,
            None => {
                net_warn!("socket: no socket left for {}", stream.tuple);
                self.submit_reset(stream);
                return Err(Errno::ENFILE);
            },
        };

        let id = SocketId(key);
        stream.set_socket(Some(id));
        net_debug!("socket: {:?} accepted {}", id, stream.tuple);
        Ok((id, stream.tuple.remote))
    }

    /// Open a connection to `remote`.
    ///
    /// A blocking socket waits for the handshake to complete. A non-blocking one returns `EAGAIN`
    /// right after the request went out, its state tells when the connection is up.
    pub fn connect(&self, sock: SocketId, remote: SocketAddr) -> Result<()> {
        let stream = {
            let mut sockets = self.shared.sockets.lock();
            let descriptor = sockets.get_mut(sock.0).ok_or(Errno::EBADF)?;
            match &descriptor.kind {
                Kind::Fresh => (),
                Kind::Stream(stream) if stream.state() >= State::Established => {
                    return Err(Errno::EISCONN)
                },
                Kind::Stream(_) => return Err(Errno::EALREADY),
                Kind::Listener(_) => return Err(Errno::EINVAL),
                Kind::Readiness(_) => return Err(Errno::ENOTSOCK),
            }
            if remote.addr.is_unspecified() || remote.port == 0 {
                return Err(Errno::EINVAL);
            }

            let local = self.local_for(descriptor.bound)?;
            let tuple = FourTuple { local, remote };
            let now = Instant::from_millis(self.shared.clock.load(Ordering::Relaxed));
            let iss = self.shared.isn.get_isn(tuple, now);
            let stream = Arc::new(StreamShared::new(tuple, iss, State::SynSent, &self.shared.config));
            stream.set_socket(Some(sock));

            if self.shared.requests.submit(Request::Connect, stream.clone()).is_err() {
                return Err(Errno::EAGAIN);
            }

            descriptor.bound = Some(local);
            descriptor.kind = Kind::Stream(stream.clone());
            if descriptor.nonblocking {
                return Err(Errno::EAGAIN);
            }
            stream
        };

        let mut write = stream.write.lock();
        loop {
            match stream.state() {
                State::SynSent | State::SynReceived => (),
                State::Closed => return Err(match stream.close_reason() {
                    CloseReason::Reset => Errno::ECONNREFUSED,
                    CloseReason::NoMem => Errno::ENOMEM,
                    _ => Errno::ETIMEDOUT,
                }),
                _ => return Ok(()),
            }
            if self.is_shutdown() {
                return Err(Errno::EINTR);
            }
            stream.write_cond.wait(&mut write);
        }
    }

    /// Read received bytes into `buf`.
    ///
    /// Returns zero once the peer closed its side and everything was read.
    pub fn recv(&self, sock: SocketId, buf: &mut [u8]) -> Result<usize> {
        let (stream, nonblocking) = self.stream(sock)?;
        let state = stream.state();
        if !state.readable() {
            return Err(Errno::ENOTCONN);
        }

        let mut read = stream.read.lock();
        loop {
            if read.buffer.as_ref().map_or(0, |buffer| buffer.merged_len()) > 0 {
                break;
            }
            if stream.state() != State::Established {
                return Ok(0);
            }
            if nonblocking {
                return Err(Errno::EAGAIN);
            }
            if self.is_shutdown() {
                return Err(Errno::EINTR);
            }
            stream.read_cond.wait(&mut read);
        }

        let read = &mut *read;
        let buffer = match read.buffer.as_mut() {
            Some(buffer) => buffer,
            None => return Ok(0),
        };
        let copied = buffer.read(buf, Caller::App);
        let drained = buffer.merged_len() == 0;
        read.window = (buffer.size() - buffer.merged_len()) as u32;

        if read.window > read.eff_mss && stream.need_wnd_adv.load(Ordering::Acquire) {
            if !stream.on_ackq.swap(true, Ordering::AcqRel) {
                if self.shared.requests.submit(Request::Ack, stream.clone()).is_ok() {
                    stream.need_wnd_adv.store(false, Ordering::Release);
                } else {
                    stream.on_ackq.store(false, Ordering::Release);
                }
            }
        }

        if drained && copied > 0 && stream.state() == State::CloseWait {
            // The end of the stream is readable now.
            self.raise(sock, Events::IN);
        }

        Ok(copied)
    }

    /// Queue bytes of `buf` for transmission.
    ///
    /// Takes as much as fits into the send buffer and returns how much that was.
    pub fn send(&self, sock: SocketId, buf: &[u8]) -> Result<usize> {
        let (stream, nonblocking) = self.stream(sock)?;
        if !stream.state().writable() {
            return Err(Errno::ENOTCONN);
        }
        if buf.is_empty() {
            return if nonblocking { Err(Errno::EAGAIN) } else { Ok(0) };
        }

        let mut write = stream.write.lock();
        while write.window == 0 {
            if !stream.state().writable() {
                return Err(Errno::ENOTCONN);
            }
            if nonblocking {
                return Err(Errno::EAGAIN);
            }
            if self.is_shutdown() {
                return Err(Errno::EINTR);
            }
            stream.write_cond.wait(&mut write);
        }

        let write = &mut *write;
        if write.buffer.is_none() {
            let chunk = self.shared.send_pool.alloc().map_err(|_| Errno::ENOMEM)?;
            write.buffer = Some(SendBuffer::new(chunk, stream.iss + 1));
        }
        let buffer = match write.buffer.as_mut() {
            Some(buffer) => buffer,
            None => return Err(Errno::ENOMEM),
        };

        let len = buf.len().min(write.window as usize);
        let put = buffer.put(&buf[..len]).map_err(|_| Errno::EAGAIN)?;
        write.window = (buffer.size() - buffer.len()) as u32;
        if write.window == 0 {
            net_trace!("socket: {:?} send buffer full", sock);
        }

        if put > 0 && !stream.on_sendq.swap(true, Ordering::AcqRel) {
            if self.shared.requests.submit(Request::Send, stream.clone()).is_err() {
                stream.on_sendq.store(false, Ordering::Release);
            }
        }

        Ok(put)
    }

    /// Close a socket.
    ///
    /// A connected stream finishes sending its buffered data and then closes gracefully. The id is
    /// invalid afterwards in any case.
    pub fn close(&self, sock: SocketId) -> Result<()> {
        let descriptor = {
            let mut sockets = self.shared.sockets.lock();
            match sockets.get(sock.0).map(|descriptor| &descriptor.kind) {
                None => return Err(Errno::EBADF),
                Some(Kind::Stream(stream)) if !closable(stream) => return Err(Errno::EBADF),
                Some(_) => (),
            }
            sockets.remove(sock.0).ok_or(Errno::EBADF)?
        };
        if let Some(readiness) = self.shared.readiness.lock().as_ref() {
            readiness.forget(sock);
        }

        match descriptor.kind {
            Kind::Fresh => Ok(()),
            Kind::Stream(stream) => self.close_stream(sock, stream),
            Kind::Listener(listener) => {
                self.close_listener(&listener);
                Ok(())
            },
            Kind::Readiness(readiness) => {
                let mut current = self.shared.readiness.lock();
                if current.as_ref().map_or(false, |other| Arc::ptr_eq(other, &readiness)) {
                    *current = None;
                }
                drop(current);
                readiness.wake();
                Ok(())
            },
        }
    }

    /// Abort the connection of a socket with a reset and close the socket.
    pub fn reset(&self, sock: SocketId) -> Result<()> {
        let stream = match self.descriptor(sock)?.kind {
            Kind::Stream(stream) => stream,
            Kind::Readiness(_) => return Err(Errno::ENOTSOCK),
            _ => return Err(Errno::ENOTCONN),
        };

        self.shared.sockets.lock().remove(sock.0);
        if let Some(readiness) = self.shared.readiness.lock().as_ref() {
            readiness.forget(sock);
        }
        if stream.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        stream.set_socket(None);
        match stream.state() {
            State::Closed | State::SynSent => self.submit(Request::Destroy, stream),
            _ => {
                self.submit_reset(stream);
                Ok(())
            },
        }
    }

    pub fn set_nonblocking(&self, sock: SocketId, nonblocking: bool) -> Result<()> {
        let mut sockets = self.shared.sockets.lock();
        let descriptor = sockets.get_mut(sock.0).ok_or(Errno::EBADF)?;
        descriptor.nonblocking = nonblocking;
        Ok(())
    }

    /// The state of the connection of a socket.
    pub fn state(&self, sock: SocketId) -> Result<State> {
        Ok(self.stream(sock)?.0.state())
    }

    /// Why the connection of a socket closed, if it did.
    pub fn close_reason(&self, sock: SocketId) -> Result<CloseReason> {
        Ok(self.stream(sock)?.0.close_reason())
    }

    pub fn local_addr(&self, sock: SocketId) -> Result<SocketAddr> {
        self.descriptor(sock)?.bound.ok_or(Errno::EINVAL)
    }

    pub fn peer_addr(&self, sock: SocketId) -> Result<SocketAddr> {
        Ok(self.stream(sock)?.0.tuple.remote)
    }

    /// Create the readiness context of the stack.
    ///
    /// There is at most one per stack, `size` bounds each of its event queues.
    pub fn epoll_create(&self, size: usize) -> Result<SocketId> {
        if size == 0 {
            return Err(Errno::EINVAL);
        }

        let mut current = self.shared.readiness.lock();
        if current.is_some() {
            return Err(Errno::EEXIST);
        }

        let readiness = Arc::new(Readiness::new(size));
        let descriptor = Descriptor {
            kind: Kind::Readiness(readiness.clone()),
            bound: None,
            nonblocking: false,
        };
        let key = self.shared.sockets.lock().insert(descriptor).ok_or(Errno::ENFILE)?;
        *current = Some(readiness);
        Ok(SocketId(key))
    }

    /// Register, change or remove the interest of a socket.
    ///
    /// Conditions that hold already are reported by the next wait.
    pub fn epoll_ctl(&self, ep: SocketId, op: Ctl, sock: SocketId, event: Event) -> Result<()> {
        let readiness = self.readiness(ep)?;
        let target = self.descriptor(sock)?;
        if let Kind::Readiness(_) = target.kind {
            return Err(Errno::EINVAL);
        }

        let ready = match op {
            Ctl::Del => Events::NONE,
            Ctl::Add | Ctl::Mod => ready_events(&target.kind),
        };
        readiness.ctl(op, sock, event, ready)
    }

    /// Wait for at most `max` events.
    ///
    /// Without a `timeout` this blocks until an event arrives, a zero timeout only polls.
    pub fn epoll_wait(&self, ep: SocketId, max: usize, timeout: Option<Duration>)
        -> Result<Vec<Event>>
    {
        let readiness = self.readiness(ep)?;
        readiness.wait(max, timeout, || self.is_shutdown(), |socket, _| {
            let kind = self.shared.sockets.lock().get(socket.0).map(|d| d.kind.clone());
            kind.map_or(Events::NONE, |kind| ready_events(&kind))
        })
    }

    pub fn epoll_stats(&self, ep: SocketId) -> Result<Stats> {
        Ok(self.readiness(ep)?.stats())
    }

    /// Interrupt every blocked call and make all future ones fail with `EINTR`.
    pub fn shutdown(&self) {
        self.shared.done.store(true, Ordering::Release);

        let kinds: Vec<Kind> = self.shared.sockets.lock()
            .iter()
            .map(|(_, descriptor)| descriptor.kind.clone())
            .collect();
        for kind in kinds {
            match kind {
                Kind::Stream(stream) => stream.wake_all(),
                Kind::Listener(listener) => listener.wake(),
                Kind::Readiness(readiness) => readiness.wake(),
                Kind::Fresh => (),
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.done.load(Ordering::Acquire)
    }

    fn close_stream(&self, sock: SocketId, stream: Arc<StreamShared>) -> Result<()> {
        if stream.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        stream.set_socket(None);
        net_debug!("socket: {:?} closing {} in {:?}", sock, stream.tuple, stream.state());

        match stream.state() {
            State::Established | State::CloseWait => {
                stream.on_closeq.store(true, Ordering::Release);
                self.submit(Request::Close, stream)
            },
            _ => self.submit(Request::Destroy, stream),
        }
    }

    fn close_listener(&self, listener: &Arc<Listener>) {
        {
            let mut listeners = self.shared.listeners.lock();
            let port = listener.addr.port;
            if listeners.get(port).map_or(false, |other| Arc::ptr_eq(other, listener)) {
                listeners.remove(port);
            }
        }

        for orphan in listener.close() {
            net_debug!("socket: resetting unaccepted {}", orphan.tuple);
            self.submit_reset(orphan);
        }
    }

    fn submit(&self, request: Request, stream: Arc<StreamShared>) -> Result<()> {
        self.shared.requests.submit(request, stream).map_err(|_| Errno::EAGAIN)
    }

    fn submit_reset(&self, stream: Arc<StreamShared>) {
        if stream.on_resetq.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(stream) = self.shared.requests.submit(Request::Reset, stream) {
            stream.on_resetq.store(false, Ordering::Release);
        }
    }

    /// Post an event from the application side.
    fn raise(&self, sock: SocketId, events: Events) {
        if let Some(readiness) = self.shared.readiness.lock().as_ref() {
            readiness.add_event(Queue::Usr, sock, events, true);
        }
    }

    /// The source address for a connection from a socket.
    fn local_for(&self, bound: Option<SocketAddr>) -> Result<SocketAddr> {
        let configured = self.shared.config.local_addr;
        let (addr, port) = match bound {
            Some(bound) if !bound.addr.is_unspecified() => (bound.addr, bound.port),
            Some(bound) => (configured, bound.port),
            None => (configured, 0),
        };
        if addr.is_unspecified() {
            return Err(Errno::EINVAL);
        }

        let port = if port != 0 {
            port
        } else {
            let offset = self.shared.next_port.fetch_add(1, Ordering::Relaxed) % EPHEMERAL_COUNT;
            EPHEMERAL_FIRST + offset
        };
        Ok(SocketAddr::new(addr, port))
    }

    fn descriptor(&self, sock: SocketId) -> Result<Descriptor> {
        self.shared.sockets.lock().get(sock.0).cloned().ok_or(Errno::EBADF)
    }

    fn stream(&self, sock: SocketId) -> Result<(Arc<StreamShared>, bool)> {
        let descriptor = self.descriptor(sock)?;
        match descriptor.kind {
            Kind::Stream(stream) => Ok((stream, descriptor.nonblocking)),
            Kind::Fresh => Err(Errno::ENOTCONN),
            _ => Err(Errno::ENOTSOCK),
        }
    }

    fn readiness(&self, ep: SocketId) -> Result<Arc<Readiness>> {
        match self.descriptor(ep)?.kind {
            Kind::Readiness(readiness) => Ok(readiness),
            _ => Err(Errno::EINVAL),
        }
    }
}

/// The conditions a socket fulfills right now.
fn ready_events(kind: &Kind) -> Events {
    match kind {
        Kind::Stream(stream) => {
            let state = stream.state();
            if state == State::Closed {
                return match stream.close_reason() {
                    CloseReason::NotClosed => Events::NONE,
                    _ => Events::IN | Events::ERR | Events::HUP,
                };
            }
            if state < State::Established {
                return Events::NONE;
            }

            let mut ready = Events::NONE;
            let readable = stream.read.lock().buffer.as_ref()
                .map_or(false, |buffer| buffer.merged_len() > 0);
            if readable || state == State::CloseWait {
                ready = ready | Events::IN;
            }
            if state.writable() && stream.write.lock().window > 0 {
                ready = ready | Events::OUT;
            }
            ready
        },
        Kind::Listener(listener) if listener.pending() > 0 => Events::IN,
        _ => Events::NONE,
    }
}

impl Errno {
    /// The error code of the platform.
    #[cfg(feature = "std")]
    pub fn raw(self) -> i32 {
        match self {
            Errno::EBADF => libc::EBADF,
            Errno::ENOTSOCK => libc::ENOTSOCK,
            Errno::ENOTCONN => libc::ENOTCONN,
            Errno::EINVAL => libc::EINVAL,
            Errno::EAGAIN => libc::EAGAIN,
            Errno::EINTR => libc::EINTR,
            Errno::EADDRINUSE => libc::EADDRINUSE,
            Errno::ENFILE => libc::ENFILE,
            Errno::ENOMEM => libc::ENOMEM,
            Errno::EEXIST => libc::EEXIST,
            Errno::ENOENT => libc::ENOENT,
            Errno::EAFNOSUPPORT => libc::EAFNOSUPPORT,
            Errno::EISCONN => libc::EISCONN,
            Errno::EALREADY => libc::EALREADY,
            Errno::ECONNREFUSED => libc::ECONNREFUSED,
            Errno::ETIMEDOUT => libc::ETIMEDOUT,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            Errno::EBADF => "bad socket id",
            Errno::ENOTSOCK => "not a stream socket",
            Errno::ENOTCONN => "not connected",
            Errno::EINVAL => "invalid argument",
            Errno::EAGAIN => "operation would block",
            Errno::EINTR => "interrupted",
            Errno::EADDRINUSE => "address in use",
            Errno::ENFILE => "too many open sockets",
            Errno::ENOMEM => "out of buffers",
            Errno::EEXIST => "already registered",
            Errno::ENOENT => "not registered",
            Errno::EAFNOSUPPORT => "address family not supported",
            Errno::EISCONN => "already connected",
            Errno::EALREADY => "connection in progress",
            Errno::ECONNREFUSED => "connection refused",
            Errno::ETIMEDOUT => "connection timed out",
        };
        f.write_str(msg)
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stack")
            .field("sockets", &self.shared.sockets.lock().len())
            .field("done", &self.is_shutdown())
            .finish()
    }
}

/// If a socket may be closed with its stream in the current state.
///
/// Later states are only reached once the stream was closed already.
fn closable(stream: &StreamShared) -> bool {
    stream.closed.load(Ordering::Acquire) || match stream.state() {
        State::Closed | State::SynSent | State::Established | State::CloseWait => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Ipv4Address;

    fn stack() -> Stack {
        let mut config = Config::default();
        config.max_concurrency = 8;
        config.max_buffers = 4;
        config.flow_bins = 16;
        config.listener_bins = 4;
        config.local_addr = Ipv4Address::new(10, 0, 0, 1);
        Stack::new(config).0
    }

    #[test]
    fn bind_and_listen() {
        let stack = stack();
        let sock = stack.socket().unwrap();
        assert_eq!(stack.listen(sock, 4), Err(Errno::EINVAL));
        stack.bind(sock, ([10, 0, 0, 1], 80).into()).unwrap();
        assert_eq!(stack.bind(sock, ([10, 0, 0, 1], 81).into()), Err(Errno::EINVAL));
        stack.listen(sock, 4).unwrap();

        let other = stack.socket().unwrap();
        stack.bind(other, ([0, 0, 0, 0], 80).into()).unwrap();
        assert_eq!(stack.listen(other, 4), Err(Errno::EADDRINUSE));

        stack.close(sock).unwrap();
        stack.listen(other, 4).unwrap();
    }

    #[test]
    fn stale_ids() {
        let stack = stack();
        let sock = stack.socket().unwrap();
        stack.close(sock).unwrap();
        assert_eq!(stack.close(sock), Err(Errno::EBADF));
        assert_eq!(stack.recv(sock, &mut [0; 4]), Err(Errno::EBADF));

        let fresh = stack.socket().unwrap();
        assert_ne!(fresh, sock);
        assert_eq!(stack.recv(fresh, &mut [0; 4]), Err(Errno::ENOTCONN));
        assert_eq!(stack.send(fresh, b"x"), Err(Errno::ENOTCONN));
    }

    #[test]
    fn socket_table_full() {
        let stack = stack();
        for _ in 0..8 {
            stack.socket().unwrap();
        }
        assert_eq!(stack.socket(), Err(Errno::ENFILE));
    }

    #[test]
    fn accept_nonblocking() {
        let stack = stack();
        let sock = stack.socket().unwrap();
        stack.bind(sock, ([10, 0, 0, 1], 80).into()).unwrap();
        stack.listen(sock, 4).unwrap();
        stack.set_nonblocking(sock, true).unwrap();
        assert_eq!(stack.accept(sock), Err(Errno::EAGAIN));

        let fresh = stack.socket().unwrap();
        assert_eq!(stack.accept(fresh), Err(Errno::EINVAL));
    }

    #[test]
    fn accept_interrupted() {
        let stack = stack();
        let sock = stack.socket().unwrap();
        stack.bind(sock, ([10, 0, 0, 1], 80).into()).unwrap();
        stack.listen(sock, 4).unwrap();
        stack.shutdown();
        assert_eq!(stack.accept(sock), Err(Errno::EINTR));
    }

    #[test]
    fn wait_after_shutdown() {
        let stack = stack();
        let ep = stack.epoll_create(16).unwrap();
        stack.shutdown();
        assert_eq!(stack.epoll_wait(ep, 4, Some(Duration::from_millis(3000))), Err(Errno::EINTR));
        assert_eq!(stack.epoll_wait(ep, 4, None), Err(Errno::EINTR));
    }

    #[test]
    fn close_keeps_socket_in_unexpected_state() {
        let stack = stack();
        let sock = stack.socket().unwrap();
        stack.set_nonblocking(sock, true).unwrap();
        assert_eq!(stack.connect(sock, ([10, 0, 0, 2], 80).into()), Err(Errno::EAGAIN));

        let (stream, _) = stack.stream(sock).unwrap();
        stream.set_state(State::SynReceived);
        assert_eq!(stack.close(sock), Err(Errno::EBADF));
        assert_eq!(stack.state(sock), Ok(State::SynReceived));
        assert!(!stream.closed.load(Ordering::Acquire));

        stream.set_state(State::SynSent);
        stack.close(sock).unwrap();
        assert_eq!(stack.state(sock), Err(Errno::EBADF));
    }

    #[test]
    fn single_readiness_context() {
        let stack = stack();
        assert_eq!(stack.epoll_create(0), Err(Errno::EINVAL));
        let ep = stack.epoll_create(16).unwrap();
        assert_eq!(stack.epoll_create(16), Err(Errno::EEXIST));

        let sock = stack.socket().unwrap();
        let event = Event { events: Events::IN, data: 3 };
        assert_eq!(stack.epoll_ctl(sock, Ctl::Add, sock, event), Err(Errno::EINVAL));
        assert_eq!(stack.epoll_ctl(ep, Ctl::Add, ep, event), Err(Errno::EINVAL));
        stack.epoll_ctl(ep, Ctl::Add, sock, event).unwrap();
        assert_eq!(stack.epoll_ctl(ep, Ctl::Add, sock, event), Err(Errno::EEXIST));

        let now = Some(Duration::from_millis(0));
        assert!(stack.epoll_wait(ep, 4, now).unwrap().is_empty());
        assert_eq!(stack.epoll_stats(ep).unwrap().calls, 1);

        stack.close(ep).unwrap();
        stack.epoll_create(16).unwrap();
    }

    #[test]
    fn connect_needs_source() {
        let stack = Stack::new(Config::default()).0;
        let sock = stack.socket().unwrap();
        assert_eq!(stack.connect(sock, ([10, 0, 0, 2], 80).into()), Err(Errno::EINVAL));

        let stack = self::stack();
        let sock = stack.socket().unwrap();
        stack.set_nonblocking(sock, true).unwrap();
        assert_eq!(stack.connect(sock, ([10, 0, 0, 2], 80).into()), Err(Errno::EAGAIN));
        assert_eq!(stack.state(sock), Ok(State::SynSent));
        assert_eq!(stack.connect(sock, ([10, 0, 0, 2], 80).into()), Err(Errno::EALREADY));
        let local = stack.local_addr(sock).unwrap();
        assert_eq!(local.addr, Ipv4Address::new(10, 0, 0, 1));
        assert!(local.port >= EPHEMERAL_FIRST);
    }

    #[test]
    fn errno_display() {
        assert_eq!(Errno::EAGAIN.to_string(), "operation would block");
        #[cfg(feature = "std")]
        assert_eq!(Errno::EINTR.raw(), libc::EINTR);
    }
}
