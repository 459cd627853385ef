//! Per-component circuit breaker.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Failures are counted; the component is considered usable.
    Closed,
    /// Threshold reached; recovery for the component is suppressed until the
    /// open timeout elapses.
    Open,
    /// One probe attempt allowed. Success closes, failure reopens.
    HalfOpen,
}

/// Consecutive-failure breaker. The open -> half-open transition is lazy:
/// it happens on the next `state()` read after the timeout, there is no
/// background timer.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    open_timeout: Duration,
    failures: u32,
    state: BreakerState,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            open_timeout,
            failures: 0,
            state: BreakerState::Closed,
            opened_at: None,
        }
    }

    /// Current state, promoting Open to HalfOpen once the timeout has passed.
    pub fn state(&mut self) -> BreakerState {
        if self.state == BreakerState::Open {
            if let Some(at) = self.opened_at {
                if at.elapsed() >= self.open_timeout {
                    log::info!("Breaker half-open after {:?} timeout.", self.open_timeout);
                    self.state = BreakerState::HalfOpen;
                }
            }
        }
        self.state
    }

    /// Records a failure. A half-open probe failure reopens immediately;
    /// closed-state failures open once the threshold is hit. Returns the
    /// state after the update.
    pub fn record_failure(&mut self) -> BreakerState {
        match self.state() {
            BreakerState::HalfOpen => self.trip(),
            BreakerState::Closed => {
                self.failures += 1;
                if self.failures >= self.threshold {
                    self.trip();
                }
            }
            BreakerState::Open => {}
        }
        self.state
    }

    /// Records a success: clears the failure count and closes the breaker
    /// from any state.
    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            log::info!("Breaker closed after successful operation.");
        }
        self.failures = 0;
        self.state = BreakerState::Closed;
        self.opened_at = None;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Force-closes, e.g. after a full reset.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.state = BreakerState::Closed;
        self.opened_at = None;
    }

    fn trip(&mut self) {
        log::warn!("Breaker open after {} consecutive failures.", self.failures);
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_stays_open_until_timeout() {
        let mut b = breaker();
        assert_eq!(b.record_failure(), BreakerState::Closed);
        assert_eq!(b.record_failure(), BreakerState::Closed);
        assert_eq!(b.record_failure(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(b.state(), BreakerState::Open);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_failure_reopens() {
        let mut b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        assert_eq!(b.record_failure(), BreakerState::Open);
        // The reopen restarts the timeout clock.
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn success_closes_and_clears_the_count() {
        let mut b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failures(), 0);
        // The count starts over; one failure does not reopen.
        assert_eq!(b.record_failure(), BreakerState::Closed);
    }
}
