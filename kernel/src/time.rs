//! Monotonic instants and deadlines used by blocking waits.

use core::time::Duration;

use crate::arch;
use crate::object::Status;

/// A point on the monotonic clock, in nanoseconds since boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(u64);

impl Instant {
    pub const ZERO: Instant = Instant(0);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(nanos))
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn saturating_since(self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

/// When a blocking operation gives up. `None` never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub const INFINITE: Deadline = Deadline(None);

    pub const fn at(when: Instant) -> Self {
        Self(Some(when))
    }

    /// A deadline `duration` from now.
    pub fn after(duration: Duration) -> Self {
        Self::at(arch::timer::now().saturating_add(duration))
    }

    pub fn when(&self) -> Option<Instant> {
        self.0
    }

    pub fn is_infinite(&self) -> bool {
        self.0.is_none()
    }

    pub fn has_expired(&self) -> bool {
        match self.0 {
            Some(when) => arch::timer::now() >= when,
            None => false,
        }
    }

    /// Checked form of [`has_expired`](Self::has_expired) for wait loops.
    ///
    /// A finite deadline can never pass while no clock source is installed,
    /// so it fails with `BadState` instead of spinning forever.
    pub fn poll(&self) -> Result<bool, Status> {
        self.poll_at(arch::timer::try_now())
    }

    fn poll_at(&self, now: Option<Instant>) -> Result<bool, Status> {
        match (self.0, now) {
            (None, _) => Ok(false),
            (Some(_), None) => {
                log::error!("finite deadline used before a timer source was installed");
                Err(Status::BadState)
            }
            (Some(when), Some(now)) => Ok(now >= when),
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::INFINITE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_add_clamps_at_max() {
        let t = Instant::from_nanos(u64::MAX - 5);
        assert_eq!(t.saturating_add(Duration::from_secs(1)), Instant::from_nanos(u64::MAX));
    }

    #[test]
    fn infinite_deadline_never_expires() {
        assert!(!Deadline::INFINITE.has_expired());
        assert!(Deadline::default().is_infinite());
    }

    #[test]
    fn finite_deadline_needs_a_clock() {
        let deadline = Deadline::at(Instant::from_nanos(100));
        assert_eq!(deadline.poll_at(None), Err(Status::BadState));
        assert_eq!(Deadline::INFINITE.poll_at(None), Ok(false));
        assert_eq!(deadline.poll_at(Some(Instant::from_nanos(99))), Ok(false));
        assert_eq!(deadline.poll_at(Some(Instant::from_nanos(100))), Ok(true));
    }

    #[test]
    fn past_deadline_has_expired() {
        crate::testing::init();
        assert!(Deadline::at(Instant::ZERO).has_expired());
    }
}
