//! Retransmission, time-wait and idle timers.
//!
//! Retransmission timers live in a hashed wheel with one bucket per tick of its horizon. A
//! deadline further out than the horizon waits in an overflow bucket which is periodically sorted
//! back into the wheel as the clock advances. The wheel, the overflow bucket and the time-wait
//! list are chains of the same set, so a stream is on at most one of them at any time.
//!
//! The idle list is separate. Streams are ordered by their last activity, a refresh moves a stream
//! to the back.
use crate::managed::{Chain, Chains};
use crate::time::Timestamp;

/// Most ticks between two passes over the overflow bucket.
const REARRANGE_TICKS: usize = 1000;

#[derive(Debug)]
pub struct Timers {
    wheel: Chains,
    /// Expiry of each member on the wheel or the time-wait list.
    deadlines: Vec<Timestamp>,
    hash: usize,
    /// The tick of the next bucket to inspect.
    now_ts: Timestamp,
    rearranged: Timestamp,
    rto_count: usize,
    idle: Chains,
    idle_since: Vec<Timestamp>,
}

const IDLE: Chain = Chain(0);

impl Timers {
    /// Timers for members `0..members` with a wheel spanning `hash` ticks.
    pub fn new(members: usize, hash: usize) -> Self {
        let hash = hash.max(1);
        Timers {
            wheel: Chains::new(members, hash + 2),
            deadlines: vec![Timestamp(0); members],
            hash,
            now_ts: Timestamp(0),
            rearranged: Timestamp(0),
            rto_count: 0,
            idle: Chains::new(members, 1),
            idle_since: vec![Timestamp(0); members],
        }
    }

    fn overflow(&self) -> Chain {
        Chain(self.hash)
    }

    fn timewait(&self) -> Chain {
        Chain(self.hash + 1)
    }

    fn is_rto_chain(&self, chain: Chain) -> bool {
        chain.0 <= self.hash
    }

    /// The chain a deadline belongs to, relative to the current wheel position.
    fn slot(&self, deadline: Timestamp) -> Chain {
        let ahead = deadline.since(self.now_ts);
        if ahead < 0 {
            // Late, it fires with the next inspected bucket.
            Chain(self.now_ts.0 as usize % self.hash)
        } else if (ahead as usize) < self.hash {
            Chain(deadline.0 as usize % self.hash)
        } else {
            self.overflow()
        }
    }

    /// Arm the retransmission timer of a member, replacing any armed one.
    ///
    /// Panics if the member is on the time-wait list.
    pub fn add_rto(&mut self, member: usize, deadline: Timestamp, now: Timestamp) {
        self.remove_rto(member);
        if self.rto_count == 0 {
            self.now_ts = now;
            self.rearranged = now;
        }

        self.deadlines[member] = deadline;
        let slot = self.slot(deadline);
        self.wheel.push_back(slot, member);
        self.rto_count += 1;
    }

    /// Disarm the retransmission timer, returning if one was armed.
    pub fn remove_rto(&mut self, member: usize) -> bool {
        match self.wheel.chain_of(member) {
            Some(chain) if self.is_rto_chain(chain) => {
                self.wheel.remove(member);
                self.rto_count -= 1;
                true
            },
            _ => false,
        }
    }

    pub fn on_rto(&self, member: usize) -> bool {
        self.wheel.chain_of(member).map_or(false, |chain| self.is_rto_chain(chain))
    }

    pub fn rto_deadline(&self, member: usize) -> Option<Timestamp> {
        if self.on_rto(member) {
            Some(self.deadlines[member])
        } else {
            None
        }
    }

    pub fn rto_count(&self) -> usize {
        self.rto_count
    }

    /// Disarm and return every retransmission timer due at `now`.
    ///
    /// Stops after `thresh` timers, the remainder fires on the next call.
    pub fn expired_rto(&mut self, now: Timestamp, thresh: usize) -> Vec<usize> {
        let mut fired = Vec::new();
        if self.rto_count == 0 {
            self.now_ts = now;
            self.rearranged = now;
            return fired;
        }

        let interval = REARRANGE_TICKS.min(self.hash / 2).max(1);
        if now.since(self.rearranged) >= interval as i32 {
            self.rearrange();
            self.rearranged = now;
        }

        let mut later = Vec::new();
        let mut steps = 0;
        while self.now_ts.since(now) <= 0 && steps < self.hash {
            let bucket = Chain(self.now_ts.0 as usize % self.hash);
            while let Some(member) = self.wheel.pop_front(bucket) {
                self.rto_count -= 1;
                if self.deadlines[member].since(now) <= 0 {
                    fired.push(member);
                } else {
                    later.push(member);
                }
                if fired.len() >= thresh {
                    break;
                }
            }
            if fired.len() >= thresh && !self.wheel.is_empty(bucket) {
                break;
            }
            self.now_ts = self.now_ts + 1;
            steps += 1;
            if fired.len() >= thresh {
                break;
            }
        }

        // A full revolution inspected every bucket, catch the clock up.
        if steps == self.hash && self.now_ts.since(now) <= 0 {
            self.now_ts = now + 1;
        }

        for member in later {
            let slot = self.slot(self.deadlines[member]);
            self.wheel.push_back(slot, member);
            self.rto_count += 1;
        }

        fired
    }

    /// Move overflow timers that came within the horizon into their buckets.
    fn rearrange(&mut self) {
        let overflow = self.overflow();
        let members: Vec<_> = self.wheel.iter(overflow).collect();
        for member in members {
            let slot = self.slot(self.deadlines[member]);
            if slot != overflow {
                self.wheel.remove(member);
                self.wheel.push_back(slot, member);
            }
        }
    }

    /// Put a member on the time-wait list, or refresh its expiry.
    ///
    /// Disarms the retransmission timer.
    pub fn add_timewait(&mut self, member: usize, expire: Timestamp) {
        let timewait = self.timewait();
        if self.wheel.contains(timewait, member) {
            self.wheel.remove(member);
        } else {
            self.remove_rto(member);
        }

        self.deadlines[member] = expire;
        self.wheel.push_back(timewait, member);
    }

    pub fn on_timewait(&self, member: usize) -> bool {
        self.wheel.contains(self.timewait(), member)
    }

    pub fn remove_timewait(&mut self, member: usize) -> bool {
        if self.on_timewait(member) {
            self.wheel.remove(member);
            true
        } else {
            false
        }
    }

    /// Members whose time-wait expired at `now`, oldest first. They stay on the list.
    pub fn expired_timewait(&self, now: Timestamp) -> Vec<usize> {
        self.wheel.iter(self.timewait())
            .take_while(|&member| self.deadlines[member].since(now) <= 0)
            .collect()
    }

    /// Record activity, moving the member to the back of the idle list.
    pub fn touch_idle(&mut self, member: usize, now: Timestamp) {
        self.idle.remove(member);
        self.idle_since[member] = now;
        self.idle.push_back(IDLE, member);
    }

    pub fn on_idle(&self, member: usize) -> bool {
        self.idle.contains(IDLE, member)
    }

    pub fn remove_idle(&mut self, member: usize) -> bool {
        self.idle.remove(member).is_some()
    }

    /// Members that have been idle for at least `timeout` ticks. They stay on the list.
    pub fn expired_idle(&self, now: Timestamp, timeout: u32) -> Vec<usize> {
        self.idle.iter(IDLE)
            .take_while(|&member| now.since(self.idle_since[member]) >= timeout as i32)
            .collect()
    }

    /// Remove a member from every timer.
    pub fn forget(&mut self, member: usize) {
        self.remove_rto(member);
        self.remove_timewait(member);
        self.remove_idle(member);
    }

    /// If the member is referenced by any timer.
    pub fn is_armed(&self, member: usize) -> bool {
        self.wheel.chain_of(member).is_some() || self.on_idle(member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_order() {
        let mut timers = Timers::new(4, 16);
        timers.add_rto(0, Timestamp(105), Timestamp(100));
        timers.add_rto(1, Timestamp(103), Timestamp(100));
        assert_eq!(timers.rto_count(), 2);

        assert!(timers.expired_rto(Timestamp(102), 10).is_empty());
        assert_eq!(timers.expired_rto(Timestamp(104), 10), vec![1]);
        assert_eq!(timers.expired_rto(Timestamp(110), 10), vec![0]);
        assert_eq!(timers.rto_count(), 0);
        assert!(!timers.on_rto(0));
    }

    #[test]
    fn rearm_replaces() {
        let mut timers = Timers::new(2, 16);
        timers.add_rto(0, Timestamp(5), Timestamp(0));
        timers.add_rto(0, Timestamp(9), Timestamp(0));
        assert_eq!(timers.rto_count(), 1);
        assert_eq!(timers.rto_deadline(0), Some(Timestamp(9)));
        assert!(timers.expired_rto(Timestamp(6), 10).is_empty());
        assert_eq!(timers.expired_rto(Timestamp(9), 10), vec![0]);
    }

    #[test]
    fn overflow_beyond_horizon() {
        let mut timers = Timers::new(2, 8);
        timers.add_rto(0, Timestamp(100), Timestamp(0));
        timers.add_rto(1, Timestamp(2), Timestamp(0));
        assert_eq!(timers.expired_rto(Timestamp(50), 10), vec![1]);
        assert!(timers.on_rto(0));
        assert!(timers.expired_rto(Timestamp(99), 10).is_empty());
        assert_eq!(timers.expired_rto(Timestamp(1200), 10), vec![0]);
    }

    #[test]
    fn threshold_defers() {
        let mut timers = Timers::new(4, 8);
        for member in 0..3 {
            timers.add_rto(member, Timestamp(1), Timestamp(0));
        }
        assert_eq!(timers.expired_rto(Timestamp(1), 2), vec![0, 1]);
        assert_eq!(timers.expired_rto(Timestamp(1), 2), vec![2]);
    }

    #[test]
    fn timewait_excludes_rto() {
        let mut timers = Timers::new(2, 8);
        timers.add_rto(0, Timestamp(5), Timestamp(0));
        timers.add_timewait(0, Timestamp(3));
        assert!(!timers.on_rto(0));
        assert!(timers.on_timewait(0));
        assert_eq!(timers.rto_count(), 0);

        timers.add_timewait(1, Timestamp(4));
        assert_eq!(timers.expired_timewait(Timestamp(3)), vec![0]);
        // Refreshing moves to the back.
        timers.add_timewait(0, Timestamp(10));
        assert_eq!(timers.expired_timewait(Timestamp(4)), vec![1]);

        timers.forget(0);
        timers.forget(1);
        assert!(!timers.is_armed(0));
        assert!(!timers.is_armed(1));
    }

    #[test]
    fn idle_order() {
        let mut timers = Timers::new(2, 8);
        timers.touch_idle(0, Timestamp(0));
        timers.touch_idle(1, Timestamp(5));
        assert_eq!(timers.expired_idle(Timestamp(10), 10), vec![0]);
        timers.touch_idle(0, Timestamp(10));
        assert_eq!(timers.expired_idle(Timestamp(15), 10), vec![1]);
        assert!(timers.remove_idle(1));
        assert!(!timers.on_idle(1));
    }
}
