//! Abstraction over the system clock so that liveness, cooldown and
//! heartbeat arithmetic can be driven deterministically in tests.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::RwLock;
use std::fmt::Debug;
use std::ops::{Add, Sub};
use std::sync::Arc;
use std::time::Duration;

/// A wall-clock instant with millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// Create from milliseconds since the UNIX epoch.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(Utc.timestamp_millis(millis))
    }

    /// Create from a [`DateTime<Utc>`].
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Milliseconds since the UNIX epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Returns `self - other` if `self >= other`, `None` otherwise.
    pub fn checked_duration_since(&self, other: Self) -> Option<Duration> {
        (*self - other).to_std().ok()
    }

    /// Returns the instant `duration` later, if representable.
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        let duration = ChronoDuration::from_std(duration).ok()?;
        self.0.checked_add_signed(duration).map(Self)
    }

    /// Returns the instant `duration` earlier, if representable.
    pub fn checked_sub(&self, duration: Duration) -> Option<Self> {
        let duration = ChronoDuration::from_std(duration).ok()?;
        self.0.checked_sub_signed(duration).map(Self)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0.to_rfc3339(), f)
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        self.checked_add(rhs).expect("timestamp wraparound")
    }
}

impl Sub<Duration> for Time {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self::Output {
        self.checked_sub(rhs).expect("timestamp wraparound")
    }
}

impl Sub<Self> for Time {
    type Output = ChronoDuration;

    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

/// A source of [`Time`].
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> Time;
}

impl<T: TimeProvider + ?Sized> TimeProvider for Arc<T> {
    fn now(&self) -> Time {
        (**self).now()
    }
}

/// A [`TimeProvider`] backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// A [`TimeProvider`] that returns a value set by the test.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    pub fn new(start: Time) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Replace the current time.
    pub fn set(&self, time: Time) {
        *self.now.write() = time
    }

    /// Advance the current time, returning the new value.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_arithmetic() {
        let base = Time::from_timestamp_millis(3_600_000);
        assert_eq!(base.timestamp_millis(), 3_600_000);

        let later = base + Duration::from_secs(45);
        assert_eq!(later.timestamp_millis(), 3_645_000);
        assert_eq!(
            later.checked_duration_since(base),
            Some(Duration::from_secs(45))
        );
        assert_eq!(base.checked_duration_since(later), None);
        assert_eq!(later - Duration::from_secs(45), base);
    }

    #[test]
    fn system_provider_monotonic_enough() {
        let provider = SystemProvider::new();
        let a = provider.now();
        let b = provider.now();
        assert!(b >= a);
    }

    #[test]
    fn mock_provider() {
        let provider = MockProvider::new(Time::from_timestamp_millis(0));
        assert_eq!(provider.now().timestamp_millis(), 0);

        provider.set(Time::from_timestamp_millis(12_000));
        assert_eq!(provider.now().timestamp_millis(), 12_000);

        provider.inc(Duration::from_secs(3));
        assert_eq!(provider.now().timestamp_millis(), 15_000);
    }
}
