//! Send timestamps and inbound staleness tracking.

use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Maps monotonic instants to wall-clock milliseconds.
///
/// Outbound units carry milliseconds since the Unix epoch. Anchoring the wall
/// clock once per connection keeps stamps monotonic even if the system clock
/// is stepped while the connection lives.
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    /// Instant the anchor was taken.
    origin: Instant,
    /// Wall-clock milliseconds at `origin`.
    origin_ms: u64,
}

impl WallClock {
    /// Anchor the clock at `now`.
    pub fn new(now: Instant) -> Self {
        let origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::with_origin(now, origin_ms)
    }

    /// Anchor the clock at `now` with a fixed millisecond value.
    pub fn with_origin(now: Instant, origin_ms: u64) -> Self {
        Self {
            origin: now,
            origin_ms,
        }
    }

    /// Timestamp for a unit sent at `now`.
    pub fn stamp(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin).as_millis() as u64;
        self.origin_ms.saturating_add(elapsed)
    }
}

/// Last timestamp seen per sequence number.
///
/// A sequenced unit is only accepted if its timestamp is strictly greater than
/// the last one recorded for the same sequence number, which rejects replayed
/// and duplicated datagrams while letting retransmissions (re-stamped by the
/// sender) through.
#[derive(Debug, Clone, Default)]
pub struct StalenessGuard {
    last_seen: HashMap<u16, u64>,
}

impl StalenessGuard {
    /// Create an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a unit and record its timestamp if it is fresh.
    ///
    /// Returns `false` if the unit is stale and must be dropped.
    pub fn check_and_record(&mut self, seq: u16, timestamp: u64) -> bool {
        match self.last_seen.get(&seq) {
            Some(&last) if last >= timestamp => false,
            _ => {
                self.last_seen.insert(seq, timestamp);
                true
            }
        }
    }

    /// Forget everything (connection teardown).
    pub fn clear(&mut self) {
        self.last_seen.clear();
    }
}
