//! Clamped-monotonic wall-clock stamps for durable records.
//!
//! Migration jobs and decision-log records carry wall-clock stamps that are
//! compared across process restarts. A host clock stepping backwards between
//! a crash and a resume must never produce a record stamped earlier than one
//! already persisted, so stamps are clamped to a high-water mark.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Produces non-decreasing `DateTime<Utc>` stamps at millisecond precision.
#[derive(Debug, Default)]
pub struct MonotonicStamper {
    high_water_ms: AtomicI64,
}

impl MonotonicStamper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stamp, never earlier than any stamp previously returned.
    pub fn now(&self) -> DateTime<Utc> {
        let wall_ms = Utc::now().timestamp_millis();
        let mut observed = self.high_water_ms.load(Ordering::Acquire);
        loop {
            let candidate = wall_ms.max(observed);
            match self.high_water_ms.compare_exchange_weak(
                observed,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Utc
                        .timestamp_millis_opt(candidate)
                        .single()
                        .unwrap_or_else(Utc::now)
                }
                Err(current) => observed = current,
            }
        }
    }

    /// Raise the high-water mark to cover a stamp loaded from durable state.
    pub fn observe(&self, stamp: DateTime<Utc>) {
        let ms = stamp.timestamp_millis();
        self.high_water_ms.fetch_max(ms, Ordering::AcqRel);
    }
}
