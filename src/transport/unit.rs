//! In-flight units and their retransmission timers.

use std::time::{Duration, Instant};

use super::frame::Frame;

/// One sequence-numbered unit awaiting acknowledgment.
///
/// The timer is a deadline: `Some` while armed, `None` once the unit has been
/// acknowledged. The send window owns units by value, keyed by sequence
/// number, so disposal is removal from the window.
#[derive(Debug, Clone)]
pub struct PendingUnit {
    /// The unit as it goes on the wire.
    pub frame: Frame,
    /// Retransmissions so far.
    pub retries: u32,
    /// When the retransmission timer fires.
    deadline: Option<Instant>,
}

impl PendingUnit {
    /// Create a new, unarmed unit.
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            retries: 0,
            deadline: None,
        }
    }

    /// Sequence number.
    pub fn seq(&self) -> u16 {
        self.frame.seq
    }

    /// Arm the timer.
    pub fn arm(&mut self, now: Instant, timeout: Duration) {
        self.deadline = Some(now + timeout);
    }

    /// Disarm the timer (unit acknowledged).
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Check whether the timer is running.
    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    /// Timer deadline, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Check if the timer has fired.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Check whether another retransmission is allowed.
    pub fn can_retry(&self, limit: u32) -> bool {
        self.retries < limit
    }

    /// Mark as retransmitted and re-arm.
    pub fn retransmit(&mut self, now: Instant, timeout: Duration) {
        self.retries += 1;
        self.frame.mark_retry();
        self.arm(now, timeout);
    }
}
