//! Clock & Id service.
//!
//! Supplies monotonically-derived unique ids and millisecond wall timestamps.
//! Wall time is only ever used as a sort key and for timeout comparisons — the
//! core does not rely on it for causal ordering (see `event_log`'s comparator).

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Identifier of a node within one group. Fresh per group, not a global identity.
pub type PeerId = String;
/// Identifier shared by all members of a group.
pub type GroupId = String;
/// Opaque, collision-free identifier of a single event.
pub type EventId = String;

/// Abstraction over wall time so tests can supply deterministic clocks.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// The real clock, backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A clock that counts up from a fixed value on every read. Used in tests that
/// need events ordered by call sequence without racing the real clock.
#[derive(Debug)]
pub struct FixedClock(AtomicI64);

impl FixedClock {
    pub fn new(start_ms: i64) -> Self {
        Self(AtomicI64::new(start_ms))
    }

    /// Advance the clock and return the new value, without reading it.
    pub fn set(&self, ms: i64) {
        self.0.store(ms, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fresh collision-free id, suitable for event ids and peer ids alike.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
