//! Circuit breaker protecting the queue from a failing dependency.
//!
//! Closed: calls pass through, failures inside the monitoring window are
//! counted. Open: calls fail fast until the cool-down elapses. Half-open:
//! one trial call decides between closing and re-opening.

use std::time::{Duration, Instant};

/// Breaker state visible to queue statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive-window failures before tripping.
    pub failure_threshold: u32,
    /// Only failures within this window count toward the threshold.
    pub monitoring_window: Duration,
    /// How long the breaker stays open before permitting a trial call.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            monitoring_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Fault-tolerance state machine for one job family.
///
/// Time is always passed in so transitions are testable without sleeping;
/// the worker feeds it `Instant::now()`.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_times: Vec<Instant>,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_times: Vec::new(),
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a call may proceed right now. Moves Open -> HalfOpen once
    /// the reset timeout has elapsed (the caller becomes the trial call).
    pub fn call_permitted(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| now.duration_since(t))
                    .unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    log::info!("circuit breaker half-open after cool-down");
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state == CircuitState::HalfOpen {
            log::info!("circuit breaker closed after successful trial call");
        }
        self.state = CircuitState::Closed;
        self.failure_times.clear();
        self.opened_at = None;
    }

    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::HalfOpen => {
                // Trial failed, back to open for another cool-down.
                self.trip(now);
            }
            CircuitState::Open => {}
            CircuitState::Closed => {
                self.failure_times.push(now);
                let window = self.config.monitoring_window;
                self.failure_times
                    .retain(|t| now.duration_since(*t) <= window);
                if self.failure_times.len() as u32 >= self.config.failure_threshold {
                    self.trip(now);
                }
            }
        }
    }

    fn trip(&mut self, now: Instant) {
        log::warn!(
            "circuit breaker open after {} failures within window",
            self.failure_times.len().max(1)
        );
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.failure_times.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, window_secs: u64, reset_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            monitoring_window: Duration::from_secs(window_secs),
            reset_timeout: Duration::from_secs(reset_secs),
        })
    }

    #[test]
    fn trips_open_after_threshold_failures_within_window() {
        // Scenario: threshold 5 trips after 5 consecutive failures.
        let mut cb = breaker(5, 60, 30);
        let now = Instant::now();

        for i in 0..4 {
            cb.record_failure(now + Duration::from_secs(i));
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        cb.record_failure(now + Duration::from_secs(4));
        assert_eq!(cb.state(), CircuitState::Open);

        // While open, calls fail fast without reaching the dependency.
        assert!(!cb.call_permitted(now + Duration::from_secs(5)));
        assert!(!cb.call_permitted(now + Duration::from_secs(20)));
    }

    #[test]
    fn failures_outside_the_window_do_not_count() {
        let mut cb = breaker(3, 10, 30);
        let now = Instant::now();

        cb.record_failure(now);
        cb.record_failure(now + Duration::from_secs(1));
        // Third failure arrives after the first two have aged out.
        cb.record_failure(now + Duration::from_secs(30));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_after_reset_then_closes_on_success() {
        let mut cb = breaker(2, 60, 30);
        let now = Instant::now();
        cb.record_failure(now);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Open);

        // Cool-down elapsed: the next caller is the trial.
        assert!(cb.call_permitted(now + Duration::from_secs(31)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.call_permitted(now + Duration::from_secs(32)));
    }

    #[test]
    fn failed_trial_reopens_the_breaker() {
        let mut cb = breaker(1, 60, 10);
        let now = Instant::now();
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Open);

        assert!(cb.call_permitted(now + Duration::from_secs(11)));
        cb.record_failure(now + Duration::from_secs(12));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.call_permitted(now + Duration::from_secs(13)));
    }
}
