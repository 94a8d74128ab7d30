use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::models::job::RateLimit;

/// Sliding-window limiter over job start times.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    starts: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            starts: VecDeque::with_capacity(limit.max as usize),
        }
    }

    /// Time to wait before another start is allowed at `now`.
    pub fn delay(&mut self, now: Instant) -> Duration {
        while let Some(&oldest) = self.starts.front() {
            if now.duration_since(oldest) >= self.limit.window {
                self.starts.pop_front();
            } else {
                break;
            }
        }

        if (self.starts.len() as u32) < self.limit.max {
            return Duration::ZERO;
        }

        match self.starts.front() {
            Some(&oldest) => (oldest + self.limit.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.starts.push_back(now);
    }
}
