//! Circuit breaker guarding the vector store.
//!
//! ```text
//!   Closed ──(failure_threshold consecutive failures)──> Open
//!   Open ──(cooldown elapsed)──> HalfOpen
//!   HalfOpen ──(probe succeeds)──> Closed
//!   HalfOpen ──(probe fails)──> Open
//! ```

use std::sync::Mutex;

use tracing::{info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls go through.
    Closed,
    /// Calls are rejected until the cooldown elapses.
    Open,
    /// One probe call is allowed through.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: u64,
    probe_in_flight: bool,
}

/// Consecutive-failure circuit breaker driven by caller-supplied timestamps.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown_ms: u64,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown_ms: u64) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown_ms,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: 0,
                probe_in_flight: false,
            }),
        }
    }

    /// Current state, advancing Open to HalfOpen if the cooldown has passed.
    pub fn state(&self, now_millis: u64) -> CircuitState {
        let Ok(mut inner) = self.inner.lock() else {
            return CircuitState::Closed;
        };
        self.advance(&mut inner, now_millis);
        inner.state
    }

    /// Whether a call may proceed.
    pub fn allow(&self, now_millis: u64) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return true;
        };
        self.advance(&mut inner, now_millis);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.state != CircuitState::Closed {
            info!("Vector store circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self, now_millis: u64) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            warn!(
                "Vector store circuit opened after {} consecutive failures",
                inner.consecutive_failures
            );
            inner.state = CircuitState::Open;
            inner.opened_at = now_millis;
        }
        inner.probe_in_flight = false;
    }

    fn advance(&self, inner: &mut BreakerInner, now_millis: u64) {
        if inner.state == CircuitState::Open
            && now_millis.saturating_sub(inner.opened_at) >= self.cooldown_ms
        {
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
        }
    }
}
