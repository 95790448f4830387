//! Self-rearming single-shot timers driven by the control loop's clock.

use std::time::{Duration, Instant};

/// Single-shot timer. The owner rearms it after firing only while work remains.
#[derive(Debug, Clone)]
pub(crate) struct SupervisoryTimer {
    interval: Duration,
    deadline: Option<Instant>,
}

impl SupervisoryTimer {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    /// Arm unless already armed.
    pub(crate) fn arm_if_idle(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.interval);
        }
    }

    /// Consume the deadline when it has passed.
    pub(crate) fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}
