use std::iter::FusedIterator;
use std::time::Duration;

use crate::config::BackoffConfig;

/// Infinite schedule of waits between polls.
///
/// Starts at the configured initial delay, multiplies on each step and then
/// holds at the ceiling forever. Each poll loop builds its own `Backoff`, so
/// concurrent loops never share a position in the sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    multiplier: u32,
    max: Duration,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let max = Duration::from_millis(config.max_ms.max(1));
        Self {
            next: Duration::from_millis(config.initial_ms.max(1)).min(max),
            multiplier: config.multiplier.max(1),
            max,
        }
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }

    /// The wait before the next attempt. Never runs out.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.next;
        self.next = current.saturating_mul(self.multiplier).min(self.max);
        current
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (usize::MAX, None)
    }
}

impl FusedIterator for Backoff {}
