/*! Time structures.

The engine never reads a clock on its own. Every call into the network endpoint is handed the
current [Instant], so tests can drive timers with explicit ticks.

 - [Instant] is the wall clock of the caller, in milliseconds.
 - [Duration] is used for configured periods.
 - [Timestamp] is the 32-bit wrapping tick counter of the timers and the TCP timestamp option.

[Instant]: struct.Instant.html
[Duration]: struct.Duration.html
[Timestamp]: struct.Timestamp.html
*/
use core::{cmp, ops};
pub use core::time::Duration;

/// An absolute point in time, in milliseconds since an arbitrary epoch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant {
    pub millis: i64,
}

/// A wrapping tick counter.
///
/// Compared with serial number arithmetic, a value is later than another if it lies less than
/// half the value range ahead of it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Timestamp(pub u32);

impl Instant {
    pub fn from_millis<T: Into<i64>>(millis: T) -> Instant {
        Instant { millis: millis.into() }
    }

    /// The system clock, relative to the unix epoch.
    #[cfg(feature = "std")]
    pub fn now() -> Instant {
        let since = ::std::time::SystemTime::now()
            .duration_since(::std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Instant::from_millis(since.as_millis() as i64)
    }

    pub fn total_millis(&self) -> i64 {
        self.millis
    }
}

impl Timestamp {
    /// Ticks from `earlier` to `self`, negative if `earlier` is in fact later.
    pub fn since(self, earlier: Timestamp) -> i32 {
        self.0.wrapping_sub(earlier.0) as i32
    }
}

impl ops::Add<u32> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: u32) -> Timestamp {
        Timestamp(self.0.wrapping_add(rhs))
    }
}

impl cmp::PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.since(*other).cmp(&0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_wraps() {
        let late = Timestamp(5);
        let early = Timestamp(u32::max_value() - 4);
        assert_eq!(late.since(early), 10);
        assert_eq!(early.since(late), -10);
        assert!(late > early);
        assert!(early < late);
        assert!(early + 10 == late);
    }

    #[cfg(feature = "std")]
    #[test]
    fn clock_is_past_epoch() {
        assert!(Instant::now().total_millis() > 0);
    }
}
