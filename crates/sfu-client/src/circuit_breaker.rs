use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use prometheus::IntGauge;
use tokio::time::Instant;

use crate::error::SfuError;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl From<u8> for BreakerState {
    fn from(value: u8) -> Self {
        match value {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` state before tripping to `Open`.
    pub failure_threshold: u32,
    /// How long the breaker stays `Open` before allowing a probe request.
    pub open_timeout: Duration,
    /// Concurrent probe requests allowed while `HalfOpen`.
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

/// Guards calls to a single SFU address, grounded on the
/// `parking_lot`-synchronized, interior-mutability-over-a-shared-handle
/// style (`RtcManager`'s `Arc<DashMap<_, Arc<RwLock<_>>>>`), trading the map
/// for a single atomic state word since there is only one breaker per client.
pub struct CircuitBreaker {
    state: AtomicU8,
    config: CircuitBreakerConfig,
    failure_count: AtomicU32,
    half_open_inflight: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
    state_gauge: Option<IntGauge>,
    failures_counter: Option<prometheus::IntCounter>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            config,
            failure_count: AtomicU32::new(0),
            half_open_inflight: AtomicU32::new(0),
            opened_at: Mutex::new(None),
            state_gauge: None,
            failures_counter: None,
        }
    }

    pub fn with_metrics(&mut self, state_gauge: IntGauge, failures_counter: prometheus::IntCounter) {
        self.state_gauge = Some(state_gauge);
        self.failures_counter = Some(failures_counter);
    }

    pub fn state(&self) -> BreakerState {
        self.reconcile_timeout();
        BreakerState::from(self.state.load(Ordering::Acquire))
    }

    /// Called immediately before dialing the SFU. Returns `Err` without a
    /// network attempt if the breaker is open, or if half-open and the probe
    /// budget is already spent.
    pub fn guard(&self) -> Result<CircuitGuard<'_>, SfuError> {
        self.reconcile_timeout();
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => Err(SfuError::BreakerOpen),
            STATE_HALF_OPEN => {
                let inflight = self.half_open_inflight.fetch_add(1, Ordering::AcqRel);
                if inflight >= self.config.half_open_max_requests {
                    self.half_open_inflight.fetch_sub(1, Ordering::AcqRel);
                    Err(SfuError::BreakerOpen)
                } else {
                    Ok(CircuitGuard { breaker: self, half_open: true })
                }
            }
            _ => Ok(CircuitGuard { breaker: self, half_open: false }),
        }
    }

    fn reconcile_timeout(&self) {
        if self.state.load(Ordering::Acquire) != STATE_OPEN {
            return;
        }
        let mut opened_at = self.opened_at.lock();
        if let Some(since) = *opened_at {
            if since.elapsed() >= self.config.open_timeout {
                self.transition(STATE_HALF_OPEN);
                self.half_open_inflight.store(0, Ordering::Release);
                *opened_at = None;
            }
        }
    }

    fn on_success(&self, half_open: bool) {
        if half_open {
            self.half_open_inflight.fetch_sub(1, Ordering::AcqRel);
        }
        self.failure_count.store(0, Ordering::Release);
        self.transition(STATE_CLOSED);
    }

    fn on_failure(&self, half_open: bool) {
        if half_open {
            self.half_open_inflight.fetch_sub(1, Ordering::AcqRel);
            self.trip();
            return;
        }
        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.config.failure_threshold {
            self.trip();
        }
        if let Some(counter) = &self.failures_counter {
            counter.inc();
        }
    }

    fn trip(&self) {
        *self.opened_at.lock() = Some(Instant::now());
        self.transition(STATE_OPEN);
    }

    fn transition(&self, new_state: u8) {
        self.state.store(new_state, Ordering::Release);
        if let Some(gauge) = &self.state_gauge {
            gauge.set(new_state as i64);
        }
    }
}

/// Tracks whether the in-flight call succeeded so the breaker can be updated
/// exactly once, regardless of which branch the caller takes.
pub struct CircuitGuard<'a> {
    breaker: &'a CircuitBreaker,
    half_open: bool,
}

impl CircuitGuard<'_> {
    pub fn record<T>(self, result: &Result<T, SfuError>) {
        match result {
            Ok(_) => self.breaker.on_success(self.half_open),
            Err(err) if err.counts_as_failure() => self.breaker.on_failure(self.half_open),
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            open_timeout: Duration::from_millis(20),
            half_open_max_requests: 1,
        }
    }

    #[test]
    fn trips_open_after_threshold_failures() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..2 {
            let guard = breaker.guard().unwrap();
            guard.record(&Err(SfuError::Rpc(tonic::Status::unavailable("sfu down"))));
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(breaker.guard(), Err(SfuError::BreakerOpen)));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_succeeds_closes_breaker() {
        let breaker = CircuitBreaker::new(config());
        breaker.trip();
        tokio::time::advance(Duration::from_millis(25)).await;

        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        let guard = breaker.guard().unwrap();
        guard.record(&Ok(()));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
