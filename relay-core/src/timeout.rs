//! Monotonic stopwatch shared by every expiry decision.
//!
//! All timeouts (client idle, spam, transfer, queue, sleep) are evaluated the
//! same way: `elapsed() >= threshold` against [`Instant`]. Every reading has an
//! `_at(now)` twin so callers can evaluate a whole sweep against one instant
//! and tests can move time without sleeping.

use std::time::{Duration, Instant};

/// A stopwatch that is either stopped or running since some instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeout {
    started: Option<Instant>,
}

impl Timeout {
    /// A stopped clock.
    pub fn new() -> Self {
        Self { started: None }
    }

    /// A clock running from now.
    pub fn started() -> Self {
        Self::started_at(Instant::now())
    }

    /// A clock running from `now`.
    pub fn started_at(now: Instant) -> Self {
        Self { started: Some(now) }
    }

    /// Start the clock if it is stopped. A running clock keeps its origin.
    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    /// [`start`](Self::start) against an explicit instant.
    pub fn start_at(&mut self, now: Instant) {
        if self.started.is_none() {
            self.started = Some(now);
        }
    }

    /// Reset the origin to now, running or not.
    pub fn restart(&mut self) {
        self.restart_at(Instant::now());
    }

    /// [`restart`](Self::restart) against an explicit instant.
    pub fn restart_at(&mut self, now: Instant) {
        self.started = Some(now);
    }

    /// Stop the clock. A stopped clock never expires.
    pub fn stop(&mut self) {
        self.started = None;
    }

    /// Whether the clock is running.
    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Time since the origin, zero when stopped.
    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Instant::now())
    }

    /// [`elapsed`](Self::elapsed) against an explicit instant.
    pub fn elapsed_at(&self, now: Instant) -> Duration {
        match self.started {
            Some(origin) => now.saturating_duration_since(origin),
            None => Duration::ZERO,
        }
    }

    /// `elapsed() >= threshold` on a running clock.
    pub fn expired(&self, threshold: Duration) -> bool {
        self.expired_at(threshold, Instant::now())
    }

    /// [`expired`](Self::expired) against an explicit instant.
    pub fn expired_at(&self, threshold: Duration, now: Instant) -> bool {
        self.is_running() && self.elapsed_at(now) >= threshold
    }

    /// Time left until `threshold`, zero once expired or when stopped.
    pub fn remaining_at(&self, threshold: Duration, now: Instant) -> Duration {
        if !self.is_running() {
            return Duration::ZERO;
        }
        threshold.saturating_sub(self.elapsed_at(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn stopped_clock_never_expires() {
        let clock = Timeout::new();
        assert!(!clock.is_running());
        assert_eq!(clock.elapsed(), Duration::ZERO);
        assert!(!clock.expired(Duration::ZERO));
    }

    #[test]
    fn expiry_is_inclusive() {
        let t0 = Instant::now();
        let clock = Timeout::started_at(t0);

        assert!(!clock.expired_at(SECOND, t0 + Duration::from_millis(999)));
        assert!(clock.expired_at(SECOND, t0 + SECOND));
    }

    #[test]
    fn start_keeps_running_origin() {
        let t0 = Instant::now();
        let mut clock = Timeout::started_at(t0);

        clock.start_at(t0 + SECOND);
        assert_eq!(clock.elapsed_at(t0 + 2 * SECOND), 2 * SECOND);
    }

    #[test]
    fn restart_moves_origin() {
        let t0 = Instant::now();
        let mut clock = Timeout::started_at(t0);

        clock.restart_at(t0 + SECOND);
        assert_eq!(clock.elapsed_at(t0 + 2 * SECOND), SECOND);
    }

    #[test]
    fn stop_resets_elapsed() {
        let t0 = Instant::now();
        let mut clock = Timeout::started_at(t0);
        clock.stop();

        assert_eq!(clock.elapsed_at(t0 + SECOND), Duration::ZERO);
        assert_eq!(clock.remaining_at(SECOND, t0), Duration::ZERO);
    }

    #[test]
    fn remaining_counts_down() {
        let t0 = Instant::now();
        let clock = Timeout::started_at(t0);

        assert_eq!(
            clock.remaining_at(SECOND, t0 + Duration::from_millis(300)),
            Duration::from_millis(700)
        );
        assert_eq!(clock.remaining_at(SECOND, t0 + 2 * SECOND), Duration::ZERO);
    }

    #[test]
    fn earlier_now_does_not_underflow() {
        let t0 = Instant::now();
        let clock = Timeout::started_at(t0 + SECOND);
        assert_eq!(clock.elapsed_at(t0), Duration::ZERO);
    }
}
