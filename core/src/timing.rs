//! # Monotonic Period Timer
//!
//! Absolute-deadline sleep for the SV tick loop. The timer accumulates
//! deadlines from an anchor instant, so jitter in one period does not drift
//! the stream rate: `wait_period` sleeps until the stored deadline and only
//! then advances it by one period.

use std::time::{Duration, Instant};

/// Accumulating periodic timer on the monotonic clock.
pub struct Timer {
    next_deadline: Instant,
}

impl Timer {
    /// Starts a period train: the first deadline is one period from now.
    pub fn start_period(period: Duration) -> Self {
        Timer {
            next_deadline: Instant::now() + period,
        }
    }

    /// Starts a period train from an explicit anchor instant.
    pub fn start_at(anchor: Instant) -> Self {
        Timer {
            next_deadline: anchor,
        }
    }

    /// Sleeps until the current absolute deadline, then advances it by
    /// `period`. Re-checks the clock after every wakeup, so early returns
    /// from the sleep never shorten a period.
    pub fn wait_period(&mut self, period: Duration) {
        loop {
            let now = Instant::now();
            if now >= self.next_deadline {
                break;
            }
            std::thread::sleep(self.next_deadline - now);
        }
        self.next_deadline += period;
    }

    /// The pending absolute deadline.
    pub fn next_deadline(&self) -> Instant {
        self.next_deadline
    }
}
