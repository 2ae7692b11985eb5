//! Monotonic version and id generator
//!
//! Values track wall-clock milliseconds but never repeat or go backwards:
//! when the clock stalls or steps back, the previous value plus one is issued.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::Timestamp;

/// Strictly increasing generator, safe to share across threads
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume after a restart: every value issued is greater than `floor`
    pub fn with_floor(floor: u64) -> Self {
        Self {
            last: AtomicU64::new(floor),
        }
    }

    /// Next value, strictly greater than any value previously returned
    pub fn next(&self) -> u64 {
        let now = Timestamp::now().as_millis();
        let mut current = self.last.load(Ordering::Acquire);
        loop {
            let candidate = now.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }

    /// Highest value issued so far
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    /// Raise the floor to at least `value` (no-op if already higher)
    pub fn observe(&self, value: u64) {
        self.last.fetch_max(value, Ordering::AcqRel);
    }
}
