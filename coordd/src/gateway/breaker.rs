use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the timeout elapses
    Open,
    /// Calls flow; the next outcome decides
    HalfOpen,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Circuit breaker for downstream calls made by one gateway process.
/// State is local and never shared with other gateway instances.
pub struct CircuitBreaker {
    threshold: u32,
    open_timeout: Duration,
    state: AtomicU8,
    failures: AtomicU32,
    /// Millis since `origin` when the circuit opened
    opened_at_ms: AtomicU64,
    origin: Instant,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            open_timeout,
            state: AtomicU8::new(STATE_CLOSED),
            failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            origin: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Whether a call may proceed. An open circuit whose timeout has
    /// elapsed moves to half-open and lets the call through.
    pub fn allow(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = self.opened_at_ms.load(Ordering::SeqCst);
                let elapsed = self.now_ms().saturating_sub(opened_at);
                if elapsed < self.open_timeout.as_millis() as u64 {
                    return false;
                }
                if self
                    .state
                    .compare_exchange(STATE_OPEN, STATE_HALF_OPEN, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    tracing::info!("Circuit breaker half-open");
                }
                true
            }
        }
    }

    pub fn success(&self) {
        match self.state() {
            CircuitState::Closed => self.failures.store(0, Ordering::SeqCst),
            CircuitState::HalfOpen => self.close(),
            // A call admitted before the circuit opened; ignore
            CircuitState::Open => {}
        }
    }

    pub fn failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let count = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.threshold {
                    self.open();
                }
            }
            CircuitState::HalfOpen => self.open(),
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    fn open(&self) {
        self.opened_at_ms.store(self.now_ms(), Ordering::SeqCst);
        self.state.store(STATE_OPEN, Ordering::SeqCst);
        tracing::warn!("Circuit breaker opened after {} failure(s)", self.failure_count());
    }

    fn close(&self) {
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.failures.store(0, Ordering::SeqCst);
        self.opened_at_ms.store(0, Ordering::SeqCst);
        tracing::info!("Circuit breaker closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_transitions() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));

        breaker.failure();
        breaker.failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!breaker.allow());
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));

        breaker.failure();
        breaker.failure();
        breaker.success();
        breaker.failure();
        breaker.failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(5));
        breaker.failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(breaker.allow());
        breaker.failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow(), "Reopened circuit restarts its timeout");
    }
}
