//! Fixed-rate tick pacing for the server loop.

use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

/// Falling further behind than this drops the backlog instead of catching up.
pub const MAX_LAG: Duration = Duration::from_millis(250);

/// Paces a loop to a fixed number of ticks per second.
#[derive(Debug)]
pub struct TickClock {
    period: Duration,
    next: Instant,
    ticks: u64,
}

impl TickClock {
    /// A clock for `rate` ticks per second. A zero rate counts as 1.
    pub fn new(rate: u32) -> Self {
        Self::starting_at(rate, Instant::now())
    }

    fn starting_at(rate: u32, now: Instant) -> Self {
        Self {
            period: Duration::from_secs(1) / rate.max(1),
            next: now,
            ticks: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Ticks completed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Block until the next tick is due.
    pub fn wait(&mut self) {
        if let Some(sleep) = self.advance(Instant::now()) {
            thread::sleep(sleep);
        }
    }

    /// Record a finished tick at `now` and return how long to sleep, if at all.
    fn advance(&mut self, now: Instant) -> Option<Duration> {
        self.ticks += 1;
        self.next += self.period;

        if self.next > now {
            return Some(self.next - now);
        }
        let behind = now - self.next;
        if behind > MAX_LAG {
            warn!(
                behind_ms = behind.as_millis() as u64,
                "tick loop fell behind, skipping ahead"
            );
            self.next = now;
        }
        None
    }
}
