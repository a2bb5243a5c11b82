//! Per-stream input rate limiting.
//!
//! A sliding one-second window of event timestamps. Events beyond the
//! limit are reported as disallowed (the stream drops them silently); the
//! timestamp queue itself is capped at twice the limit, with an emergency
//! trim that drops the oldest half when exceeded.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

pub struct RateLimitWindow {
    events: VecDeque<Instant>,
    limit: usize,
    queue_cap: usize,
}

impl RateLimitWindow {
    pub fn new(limit: u32) -> Self {
        let limit = limit.max(1) as usize;
        Self {
            events: VecDeque::with_capacity(limit),
            limit,
            queue_cap: limit * 2,
        }
    }

    /// Record an event at `now`; returns whether it is within the limit.
    pub fn allow(&mut self, now: Instant) -> bool {
        let cutoff = now.checked_sub(WINDOW);
        if let Some(cutoff) = cutoff {
            while let Some(&front) = self.events.front() {
                if front < cutoff {
                    self.events.pop_front();
                } else {
                    break;
                }
            }
        }

        let allowed = self.events.len() < self.limit;
        self.events.push_back(now);

        if self.events.len() > self.queue_cap {
            let excess = self.events.len() / 2;
            self.events.drain(..excess);
        }

        allowed
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.events.len()
    }
}
