//! Per-provider circuit breaker (C3, §4.3): closed / open / half-open state
//! machine guarding a single provider's eligibility for dispatch.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub max_failures: u32,
    pub open_timeout: Duration,
    pub half_open_probe_count: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            max_failures: 5,
            open_timeout: Duration::from_secs(60),
            half_open_probe_count: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BreakerStatistics {
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    half_open_probes_in_flight: u32,
    total_successes: u64,
    total_failures: u64,
}

/// Three-state breaker for one provider. All mutation happens under a plain
/// `Mutex` guarding a handful of scalars — per §9's design note, no lock is
/// ever held across I/O, only across these in-memory state transitions.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        CircuitBreaker {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                half_open_probes_in_flight: 0,
                total_successes: 0,
                total_failures: 0,
            }),
        }
    }

    fn transition_if_cooldown_elapsed(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            if let Some(last_failure) = inner.last_failure_at {
                if last_failure.elapsed() >= self.config.open_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_probes_in_flight = 0;
                }
            }
        }
    }

    pub fn current_state(&self) -> BreakerState {
        let mut inner = self.inner.lock().unwrap();
        self.transition_if_cooldown_elapsed(&mut inner);
        inner.state
    }

    /// Whether the provider manager may attempt a dispatch right now. In
    /// `HalfOpen`, only up to `half_open_probe_count` concurrent probes are
    /// allowed through; callers that pass must eventually report success or
    /// failure.
    pub fn should_attempt(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.transition_if_cooldown_elapsed(&mut inner);
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.half_open_probes_in_flight < self.config.half_open_probe_count {
                    inner.half_open_probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_probes_in_flight = 0;
        }
        inner.state = BreakerState::Closed;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_failures += 1;
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.half_open_probes_in_flight = 0;
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.max_failures {
                    inner.state = BreakerState::Open;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn statistics(&self) -> BreakerStatistics {
        let inner = self.inner.lock().unwrap();
        BreakerStatistics {
            consecutive_failures: inner.consecutive_failures,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_max_consecutive_failures() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            max_failures: 3,
            open_timeout: Duration::from_secs(60),
            half_open_probe_count: 1,
        });
        for _ in 0..2 {
            breaker.record_failure();
            assert_eq!(breaker.current_state(), BreakerState::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.current_state(), BreakerState::Open);
        assert!(!breaker.should_attempt());
    }

    #[test]
    fn half_open_probe_success_closes_and_resets_counter() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            max_failures: 1,
            open_timeout: Duration::from_millis(1),
            half_open_probe_count: 1,
        });
        breaker.record_failure();
        assert_eq!(breaker.current_state(), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.should_attempt());
        assert_eq!(breaker.current_state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.current_state(), BreakerState::Closed);
        assert_eq!(breaker.statistics().consecutive_failures, 0);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            max_failures: 1,
            open_timeout: Duration::from_millis(1),
            half_open_probe_count: 1,
        });
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.should_attempt());
        breaker.record_failure();
        assert_eq!(breaker.current_state(), BreakerState::Open);
    }

    #[test]
    fn half_open_limits_concurrent_probes() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            max_failures: 1,
            open_timeout: Duration::from_millis(1),
            half_open_probe_count: 1,
        });
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.should_attempt());
        // A second concurrent probe is rejected until the first resolves.
        assert!(!breaker.should_attempt());
    }
}
