//! Expiration times.
//!
//! Work is prioritised by the time at which it must be finished. Times are
//! coarse: a host timestamp is divided into 10ms units and async work is
//! further rounded up into buckets, so updates requested close together
//! collapse onto the same expiration time and get batched.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

const UNIT_SIZE: f64 = 10.0;
const MAGIC_NUMBER_OFFSET: u32 = 2;

/// An opaque, totally ordered priority value.
///
/// Numerically smaller times are more urgent. [`ExpirationTime::DONE`] is
/// the numeric minimum but means "no pending work", so it is treated as the
/// least urgent value by [`ExpirationTime::compare_urgency`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ExpirationTime(u32);

impl ExpirationTime {
    /// No pending work. Also the identity of `min` over pending times.
    pub const DONE: ExpirationTime = ExpirationTime(0);
    /// Synchronous work, the most urgent time.
    pub const SYNC: ExpirationTime = ExpirationTime(1);
    /// Idle work that never expires.
    pub const NEVER: ExpirationTime = ExpirationTime(1_073_741_823);

    pub const fn from_raw(raw: u32) -> Self {
        ExpirationTime(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn is_done(self) -> bool {
        self == Self::DONE
    }

    /// Orders by urgency: more urgent first, `DONE` after everything.
    pub fn compare_urgency(self, other: ExpirationTime) -> Ordering {
        match (self.is_done(), other.is_done()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.0.cmp(&other.0),
        }
    }

    /// True when `self` is not more urgent than `other`.
    pub fn is_same_or_later(self, other: ExpirationTime) -> bool {
        self.compare_urgency(other) != Ordering::Less
    }

    /// The more urgent of two times, ignoring `DONE`.
    pub fn most_urgent(self, other: ExpirationTime) -> ExpirationTime {
        if self.compare_urgency(other) == Ordering::Greater {
            other
        } else {
            self
        }
    }

    /// True for sync work, or work whose deadline has passed at `current`.
    pub fn is_expired(self, current: ExpirationTime) -> bool {
        !self.is_done() && (self == Self::SYNC || self <= current)
    }
}

impl fmt::Display for ExpirationTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::DONE => write!(f, "done"),
            Self::SYNC => write!(f, "sync"),
            Self::NEVER => write!(f, "never"),
            ExpirationTime(raw) => write!(f, "t{}", raw),
        }
    }
}

pub fn ms_to_expiration(ms: f64) -> ExpirationTime {
    let units = (ms.max(0.0) / UNIT_SIZE).floor() as u32;
    ExpirationTime(units.saturating_add(MAGIC_NUMBER_OFFSET).min(ExpirationTime::NEVER.0 - 1))
}

pub fn expiration_to_ms(time: ExpirationTime) -> f64 {
    f64::from(time.0.saturating_sub(MAGIC_NUMBER_OFFSET)) * UNIT_SIZE
}

fn ceiling(num: u32, precision: u32) -> u32 {
    (num / precision + 1) * precision
}

pub fn compute_expiration_bucket(
    current: ExpirationTime,
    expiration_ms: u32,
    bucket_size_ms: u32,
) -> ExpirationTime {
    let precision = (bucket_size_ms / UNIT_SIZE as u32).max(1);
    let offset = expiration_ms / UNIT_SIZE as u32;
    let num = current.0.saturating_sub(MAGIC_NUMBER_OFFSET) + offset;
    ExpirationTime(MAGIC_NUMBER_OFFSET + ceiling(num, precision))
}

/// Priority levels a caller can request an expiration time for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    Sync,
    Interactive,
    Async,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationConfig {
    pub async_expiration_ms: u32,
    pub async_bucket_ms: u32,
    pub interactive_expiration_ms: u32,
    pub interactive_bucket_ms: u32,
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            async_expiration_ms: 5000,
            async_bucket_ms: 250,
            interactive_expiration_ms: 150,
            interactive_bucket_ms: 100,
        }
    }
}

/// Converts host timestamps into expiration times.
///
/// The clock never reads time itself; callers pass the host's `now()`.
#[derive(Debug, Clone, Copy)]
pub struct ExpirationClock {
    epoch_ms: f64,
    config: ExpirationConfig,
}

impl ExpirationClock {
    pub fn new(epoch_ms: f64, config: ExpirationConfig) -> Self {
        Self { epoch_ms, config }
    }

    pub fn config(&self) -> &ExpirationConfig {
        &self.config
    }

    pub fn now(&self, host_ms: f64) -> ExpirationTime {
        ms_to_expiration(host_ms - self.epoch_ms)
    }

    pub fn compute_async_expiration(&self, current: ExpirationTime) -> ExpirationTime {
        compute_expiration_bucket(
            current,
            self.config.async_expiration_ms,
            self.config.async_bucket_ms,
        )
    }

    pub fn compute_interactive_expiration(&self, current: ExpirationTime) -> ExpirationTime {
        compute_expiration_bucket(
            current,
            self.config.interactive_expiration_ms,
            self.config.interactive_bucket_ms,
        )
    }

    pub fn expiration_for(&self, priority: Priority, host_ms: f64) -> ExpirationTime {
        let current = self.now(host_ms);
        match priority {
            Priority::Sync => ExpirationTime::SYNC,
            Priority::Interactive => self.compute_interactive_expiration(current),
            Priority::Async => self.compute_async_expiration(current),
            Priority::Idle => ExpirationTime::NEVER,
        }
    }

    pub fn compare(&self, a: ExpirationTime, b: ExpirationTime) -> Ordering {
        a.compare_urgency(b)
    }

    pub fn is_same_or_later(&self, a: ExpirationTime, b: ExpirationTime) -> bool {
        a.is_same_or_later(b)
    }
}
