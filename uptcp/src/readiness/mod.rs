//! Readiness notification, in the manner of epoll.
//!
//! A context keeps an interest mask per registered socket and three bounded event queues. The
//! network thread posts into the `net` queue while processing a batch and publishes the whole batch
//! to waiters with [`flush`] once per poll. Application threads post directly to the `usr` queue,
//! or to the `shadow` queue when re-arming a level-triggered condition that still holds after a
//! call.
//!
//! An event is posted at most once while it is pending for a socket. Queued events are not removed
//! when a socket goes away or changes its interest, instead every event is validated against the
//! current registration when it is delivered.
//!
//! [`flush`]: struct.Readiness.html#method.flush
use core::{fmt, ops};
use std::collections::{HashMap, VecDeque};

use parking_lot::{Condvar, Mutex};

use crate::socket::{Errno, SocketId};
use crate::time::Duration;

/// A set of event kinds.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Events(pub u32);

/// Operation of a control call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ctl {
    Add = 1,
    Del = 2,
    Mod = 3,
}

/// A delivered event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    pub events: Events,
    /// The user data of the registration.
    pub data: u64,
}

/// Counters of a readiness context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Calls to `wait`.
    pub calls: u64,
    /// Times a waiter parked.
    pub waits: u64,
    /// Times a flush woke a parked waiter.
    pub wakes: u64,
    /// Events posted, including those skipped as already pending.
    pub issued: u64,
    /// Events queued.
    pub registered: u64,
    /// Queued events dropped at delivery.
    pub invalidated: u64,
    /// Events delivered.
    pub handled: u64,
}

/// Which queue an event is posted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Queue {
    /// Posted by the network thread, visible after the next flush.
    Net,
    /// Posted by application threads.
    Usr,
    /// Re-armed level-triggered conditions.
    Shadow,
}

/// A readiness context.
pub struct Readiness {
    inner: Mutex<Inner>,
    cond: Condvar,
    capacity: usize,
}

struct Inner {
    net: VecDeque<(SocketId, Events)>,
    usr: VecDeque<(SocketId, Events)>,
    shadow: VecDeque<(SocketId, Events)>,
    interests: HashMap<SocketId, Interest>,
    /// A thread is parked in `wait`.
    waiting: bool,
    stats: Stats,
}

#[derive(Clone, Copy, Debug)]
struct Interest {
    mask: Events,
    data: u64,
    /// Events queued and not yet delivered.
    pending: Events,
}

impl Events {
    pub const NONE: Events = Events(0);
    pub const IN: Events = Events(0x001);
    pub const PRI: Events = Events(0x002);
    pub const OUT: Events = Events(0x004);
    pub const ERR: Events = Events(0x008);
    pub const HUP: Events = Events(0x010);
    pub const RDHUP: Events = Events(0x2000);
    pub const ONESHOT: Events = Events(1 << 30);
    pub const ET: Events = Events(1 << 31);

    /// The kinds of readiness, without the delivery modifiers.
    const KINDS: Events = Events(0x001 | 0x002 | 0x004 | 0x008 | 0x010 | 0x2000);

    pub fn contains(self, other: Events) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn kinds(self) -> Events {
        self & Events::KINDS
    }
}

impl Readiness {
    /// Create a context whose queues hold `capacity` events each.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Readiness {
            inner: Mutex::new(Inner {
                net: VecDeque::with_capacity(capacity),
                usr: VecDeque::with_capacity(capacity),
                shadow: VecDeque::with_capacity(capacity),
                interests: HashMap::new(),
                waiting: false,
                stats: Stats::default(),
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    /// Post an event for a socket.
    ///
    /// Nothing is queued if the socket is not registered for it or has it pending already. A
    /// readable event that is not a `transition` from empty to non-empty is skipped for sockets
    /// registered edge-triggered. Returns if the event was queued.
    pub fn add_event(&self, queue: Queue, socket: SocketId, events: Events, transition: bool)
        -> bool
    {
        let mut inner = self.inner.lock();
        inner.stats.issued += 1;

        let interest = match inner.interests.get(&socket) {
            Some(interest) => *interest,
            None => return false,
        };

        let mut events = events.kinds() & interest.mask;
        if interest.mask.contains(Events::ET) && !transition {
            events = events & !Events::IN;
        }
        events = events & !interest.pending;
        if events.is_empty() {
            return false;
        }

        let capacity = self.capacity;
        let target = match queue {
            Queue::Net => &mut inner.net,
            Queue::Usr => &mut inner.usr,
            Queue::Shadow => &mut inner.shadow,
        };
        if target.len() >= capacity {
            net_warn!("readiness: {:?} queue full, dropping {:?} for {:?}", queue, events, socket);
            return false;
        }
        target.push_back((socket, events));

        if let Some(interest) = inner.interests.get_mut(&socket) {
            interest.pending = interest.pending | events;
        }
        inner.stats.registered += 1;
        net_trace!("readiness: {:?} {:?} queued on {:?}", socket, events, queue);

        if queue != Queue::Net && inner.waiting {
            inner.stats.wakes += 1;
            self.cond.notify_all();
        }
        true
    }

    /// Publish the events of the network thread and wake a parked waiter.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        let Inner { net, usr, .. } = &mut *inner;
        while let Some(event) = net.pop_front() {
            if usr.len() >= self.capacity {
                net_warn!("readiness: user queue full, dropping {:?}", event);
                continue;
            }
            usr.push_back(event);
        }

        if inner.waiting && (!inner.usr.is_empty() || !inner.shadow.is_empty()) {
            inner.stats.wakes += 1;
            self.cond.notify_all();
        }
    }

    /// Change the registration of a socket.
    ///
    /// `ready` holds the conditions the socket currently fulfills, those matching the new interest
    /// are posted right away. Errors and hangups are always part of the interest.
    pub fn ctl(&self, op: Ctl, socket: SocketId, event: Event, ready: Events)
        -> Result<(), Errno>
    {
        {
            let mut inner = self.inner.lock();
            let registered = inner.interests.contains_key(&socket);
            let mask = event.events | Events::ERR | Events::HUP;
            match op {
                Ctl::Add if registered => return Err(Errno::EEXIST),
                Ctl::Add => {
                    inner.interests.insert(socket, Interest {
                        mask,
                        data: event.data,
                        pending: Events::NONE,
                    });
                },
                Ctl::Mod => match inner.interests.get_mut(&socket) {
                    Some(interest) => {
                        interest.mask = mask;
                        interest.data = event.data;
                    },
                    None => return Err(Errno::ENOENT),
                },
                Ctl::Del => return match inner.interests.remove(&socket) {
                    Some(_) => Ok(()),
                    None => Err(Errno::ENOENT),
                },
            }
        }

        if !ready.is_empty() {
            self.add_event(Queue::Usr, socket, ready, true);
        }
        Ok(())
    }

    /// Drop the registration of a socket that is being closed.
    pub fn forget(&self, socket: SocketId) {
        self.inner.lock().interests.remove(&socket);
    }

    pub fn is_registered(&self, socket: SocketId) -> bool {
        self.inner.lock().interests.contains_key(&socket)
    }

    /// Wait for events, at most `max` of them.
    ///
    /// Blocks while no event is queued: forever with no `timeout`, not at all with a zero one.
    /// Before parking and after every wake `cancelled` is consulted, a raised flag ends the wait
    /// with `EINTR`.
    ///
    /// For level-triggered registrations `level` reports which conditions still hold after
    /// delivery, those are re-armed on the shadow queue for the next call.
    pub fn wait<C, L>(&self, max: usize, timeout: Option<Duration>, cancelled: C, level: L)
        -> Result<Vec<Event>, Errno>
    where
        C: Fn() -> bool,
        L: Fn(SocketId, Events) -> Events,
    {
        if max == 0 {
            return Err(Errno::EINVAL);
        }

        let mut timeout = timeout;
        let mut events = Vec::new();
        let mut rearm = Vec::new();
        let mut inner = self.inner.lock();
        inner.stats.calls += 1;

        loop {
            while inner.usr.is_empty() && inner.shadow.is_empty()
                && timeout != Some(Duration::from_millis(0))
            {
                // The flag is raised before the waking lock is taken.
                if cancelled() {
                    return Err(Errno::EINTR);
                }
                inner.stats.waits += 1;
                inner.waiting = true;
                match timeout {
                    Some(duration) => {
                        self.cond.wait_for(&mut inner, duration);
                        timeout = Some(Duration::from_millis(0));
                    },
                    None => self.cond.wait(&mut inner),
                }
                inner.waiting = false;

                if cancelled() {
                    return Err(Errno::EINTR);
                }
            }

            let Inner { usr, shadow, interests, stats, .. } = &mut *inner;
            while events.len() < max {
                let (socket, raised) = match usr.pop_front().or_else(|| shadow.pop_front()) {
                    Some(event) => event,
                    None => break,
                };

                let interest = match interests.get_mut(&socket) {
                    Some(interest) => interest,
                    None => {
                        stats.invalidated += 1;
                        continue;
                    },
                };

                let valid = raised & interest.mask & interest.pending;
                interest.pending = interest.pending & !raised;
                if valid.is_empty() {
                    stats.invalidated += 1;
                    continue;
                }

                stats.handled += 1;
                events.push(Event { events: valid, data: interest.data });
                if interest.mask.contains(Events::ONESHOT) {
                    interest.mask = Events::NONE;
                } else if !interest.mask.contains(Events::ET) {
                    rearm.push((socket, valid));
                }
            }

            if !events.is_empty() || timeout == Some(Duration::from_millis(0)) {
                break;
            }
        }
        drop(inner);

        for (socket, delivered) in rearm {
            let still = level(socket, delivered) & delivered;
            if !still.is_empty() {
                self.add_event(Queue::Shadow, socket, still, true);
            }
        }

        Ok(events)
    }

    /// Wake all waiters so they check for cancellation.
    pub fn wake(&self) {
        drop(self.inner.lock());
        self.cond.notify_all();
    }

    pub fn stats(&self) -> Stats {
        self.inner.lock().stats
    }
}

impl ops::BitOr for Events {
    type Output = Events;

    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

impl ops::BitAnd for Events {
    type Output = Events;

    fn bitand(self, rhs: Events) -> Events {
        Events(self.0 & rhs.0)
    }
}

impl ops::Not for Events {
    type Output = Events;

    fn not(self) -> Events {
        Events(!self.0)
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const NAMES: [(Events, &str); 8] = [
            (Events::IN, "IN"),
            (Events::PRI, "PRI"),
            (Events::OUT, "OUT"),
            (Events::ERR, "ERR"),
            (Events::HUP, "HUP"),
            (Events::RDHUP, "RDHUP"),
            (Events::ONESHOT, "ONESHOT"),
            (Events::ET, "ET"),
        ];

        let mut first = true;
        for &(flag, name) in NAMES.iter() {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}
