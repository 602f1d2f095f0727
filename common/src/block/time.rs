//! Local and network-adjusted time.
//!
//! `TIMEDATA` is an external collaborator (§6): this module only defines the
//! types the core exchanges with it (`LocalTime`, `LocalDuration`) and the
//! trait it is consumed through (`Clock`, `AdjustedClock`). A minimal
//! in-memory implementation is provided for tests.
use std::collections::HashMap;
use std::ops::{Add, Sub};
use std::time::{SystemTime, UNIX_EPOCH};

/// A moment in time, measured in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalTime(u64);

impl LocalTime {
    /// The Unix epoch.
    pub const EPOCH: LocalTime = LocalTime(0);

    /// Get the current local time, according to the system clock.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is set before 1970");

        Self(duration.as_millis() as u64)
    }

    /// Get the time as a duration since the epoch.
    pub fn as_duration(&self) -> LocalDuration {
        LocalDuration(self.0)
    }

    /// Number of milliseconds since the Unix epoch.
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Number of seconds since the Unix epoch.
    pub fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// Construct a `LocalTime` from a block timestamp (seconds).
    pub fn from_block_time(t: u32) -> Self {
        Self(t as u64 * 1000)
    }
}

impl From<u64> for LocalTime {
    fn from(millis: u64) -> Self {
        Self(millis)
    }
}

impl Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.0.saturating_sub(other.0))
    }
}

impl Sub<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn sub(self, other: LocalDuration) -> LocalTime {
        LocalTime(self.0.saturating_sub(other.0))
    }
}

impl Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime(self.0 + other.0)
    }
}

/// A span of time, measured in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalDuration(u64);

impl LocalDuration {
    /// The zero duration.
    pub const ZERO: LocalDuration = LocalDuration(0);

    /// Create a duration from a number of milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Create a duration from a number of seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1000)
    }

    /// Create a duration from a number of minutes.
    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    /// Number of milliseconds in this duration.
    pub fn as_millis(&self) -> u128 {
        self.0 as u128
    }

    /// Number of whole seconds in this duration.
    pub fn as_secs(&self) -> u64 {
        self.0 / 1000
    }
}

impl Add<LocalDuration> for LocalDuration {
    type Output = LocalDuration;

    fn add(self, other: LocalDuration) -> LocalDuration {
        LocalDuration(self.0 + other.0)
    }
}

impl From<std::time::Duration> for LocalDuration {
    fn from(d: std::time::Duration) -> Self {
        Self(d.as_millis() as u64)
    }
}

/// Anything that can tell the time.
pub trait Clock {
    /// Returns the current local time.
    fn local_time(&self) -> LocalTime;
}

impl<T: Clock> Clock for &T {
    fn local_time(&self) -> LocalTime {
        (**self).local_time()
    }
}

/// A clock that can be adjusted by samples observed from peers, keyed by
/// some peer identifier `K` (typically a `SocketAddr`). This is the trait
/// `TIMEDATA` is consumed through.
pub trait AdjustedClock<K>: Clock + Clone {
    /// Set the local time directly, eg. from the event loop's tick.
    fn set(&mut self, time: LocalTime);
    /// Record a time sample (the offset reported by a peer's `version`
    /// message, or a ping round-trip) from a given source.
    fn sample(&mut self, source: K, sample: LocalDuration);
}

/// A clock that doesn't adjust itself from peer samples, suitable for
/// tests and for `node`'s default wiring until a real `TIMEDATA` is
/// plugged in.
#[derive(Debug, Clone)]
pub struct RefClock {
    time: LocalTime,
    samples: HashMap<std::net::SocketAddr, LocalDuration>,
}

impl Default for RefClock {
    fn default() -> Self {
        Self {
            time: LocalTime::now(),
            samples: HashMap::new(),
        }
    }
}

impl Clock for RefClock {
    fn local_time(&self) -> LocalTime {
        self.time
    }
}

impl AdjustedClock<std::net::SocketAddr> for RefClock {
    fn set(&mut self, time: LocalTime) {
        self.time = time;
    }

    fn sample(&mut self, source: std::net::SocketAddr, sample: LocalDuration) {
        self.samples.insert(source, sample);
    }
}
