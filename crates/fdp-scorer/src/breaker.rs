//! Circuit breaker for the scorer call: closed / open / half-open.
//!
//! Pure state machine over injected instants so every transition is unit
//! testable without clocks or sleeps. The breaker trips when
//! `failure_threshold` consecutive failures land inside `window`; it stays
//! open for `cooldown`, then admits a single half-open probe.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Call may proceed.
    Admit,
    /// Breaker is open; collapse to absent without calling out.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
pub struct Breaker {
    state: State,
    /// Consecutive failures and when the streak began.
    streak: u32,
    streak_started: Option<Instant>,
    failure_threshold: u32,
    window: Duration,
    cooldown: Duration,
}

impl Breaker {
    pub fn new(failure_threshold: u32, window: Duration, cooldown: Duration) -> Self {
        Self {
            state: State::Closed,
            streak: 0,
            streak_started: None,
            failure_threshold: failure_threshold.max(1),
            window,
            cooldown,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open { .. })
    }

    /// Gate one outbound call.
    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            State::Closed | State::HalfOpen => Admission::Admit,
            State::Open { since } => {
                if now.duration_since(since) >= self.cooldown {
                    self.state = State::HalfOpen;
                    Admission::Admit
                } else {
                    Admission::Reject
                }
            }
        }
    }

    pub fn on_success(&mut self) {
        self.state = State::Closed;
        self.streak = 0;
        self.streak_started = None;
    }

    pub fn on_failure(&mut self, now: Instant) {
        if self.state == State::HalfOpen {
            // Failed probe: straight back to open.
            self.state = State::Open { since: now };
            self.streak = 0;
            self.streak_started = None;
            return;
        }

        // Restart the streak when the previous one fell out of the window.
        match self.streak_started {
            Some(started) if now.duration_since(started) <= self.window => {
                self.streak += 1;
            }
            _ => {
                self.streak = 1;
                self.streak_started = Some(now);
            }
        }

        if self.streak >= self.failure_threshold {
            self.state = State::Open { since: now };
            self.streak = 0;
            self.streak_started = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> Breaker {
        Breaker::new(3, Duration::from_secs(10), Duration::from_secs(5))
    }

    #[test]
    fn trips_after_consecutive_failures() {
        let mut b = breaker();
        let t0 = Instant::now();
        b.on_failure(t0);
        b.on_failure(t0 + Duration::from_millis(10));
        assert!(!b.is_open());
        b.on_failure(t0 + Duration::from_millis(20));
        assert!(b.is_open());
        assert_eq!(b.admit(t0 + Duration::from_millis(30)), Admission::Reject);
    }

    #[test]
    fn success_resets_the_streak() {
        let mut b = breaker();
        let t0 = Instant::now();
        b.on_failure(t0);
        b.on_failure(t0);
        b.on_success();
        b.on_failure(t0);
        b.on_failure(t0);
        assert!(!b.is_open());
    }

    #[test]
    fn stale_streak_restarts_outside_window() {
        let mut b = breaker();
        let t0 = Instant::now();
        b.on_failure(t0);
        b.on_failure(t0 + Duration::from_millis(1));
        // Third failure lands far outside the window: streak restarts at 1.
        b.on_failure(t0 + Duration::from_secs(60));
        assert!(!b.is_open());
    }

    #[test]
    fn half_open_probe_closes_on_success() {
        let mut b = breaker();
        let t0 = Instant::now();
        for _ in 0..3 {
            b.on_failure(t0);
        }
        assert!(b.is_open());

        // Before cooldown: rejected.
        assert_eq!(b.admit(t0 + Duration::from_secs(1)), Admission::Reject);
        // After cooldown: one probe admitted.
        assert_eq!(b.admit(t0 + Duration::from_secs(6)), Admission::Admit);
        b.on_success();
        assert!(!b.is_open());
        assert_eq!(b.admit(t0 + Duration::from_secs(7)), Admission::Admit);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let mut b = breaker();
        let t0 = Instant::now();
        for _ in 0..3 {
            b.on_failure(t0);
        }
        assert_eq!(b.admit(t0 + Duration::from_secs(6)), Admission::Admit);
        b.on_failure(t0 + Duration::from_secs(6));
        assert_eq!(b.admit(t0 + Duration::from_secs(7)), Admission::Reject);
    }
}
