//! Monotonic timestamps used for timer keys and event receive times.

use std::fmt;
use std::ops::{Add, AddAssign};
use std::time::{Duration, Instant};

/// A point on the monotonic clock.
///
/// Used as the ordering key in the timer map and handed to read callbacks as
/// the moment the event loop observed the readiness batch. Monotonic rather
/// than wall-clock so timer arithmetic is immune to clock adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Instant);

impl Timestamp {
    /// The current instant.
    pub fn now() -> Self {
        Timestamp(Instant::now())
    }

    /// Duration from `earlier` to `self`, saturating to zero if `earlier`
    /// is actually later.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }

    /// Duration from now until this timestamp, zero if already past.
    pub fn until(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    /// Time elapsed since this timestamp.
    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs)
    }
}

impl AddAssign<Duration> for Timestamp {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs;
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        let a = Timestamp::now();
        let b = a + Duration::from_millis(10);
        assert!(a < b);
        assert_eq!(b.duration_since(a), Duration::from_millis(10));
    }

    #[test]
    fn test_duration_since_saturates() {
        let a = Timestamp::now();
        let b = a + Duration::from_millis(10);
        assert_eq!(a.duration_since(b), Duration::ZERO);
    }

    #[test]
    fn test_until_past_is_zero() {
        let a = Timestamp::now();
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(a.until(), Duration::ZERO);
    }
}
