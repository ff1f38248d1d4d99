//! Circuit breaker: fail fast after repeated downstream failures.
//!
//! Three states per protected target. CLOSED counts failures and opens at
//! the threshold; OPEN rejects immediately until the reset timeout, then the
//! next admission check moves to HALF_OPEN; HALF_OPEN closes after enough
//! successful probes and re-opens on any failure.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::RagError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            half_open_requests: 1,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    probe_successes: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                probe_successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Current state. Reads are unsynchronized with in-flight transitions
    /// and may be slightly stale; fail-fast correctness is preserved.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Admission check. OPEN rejects with the remaining cool-down; an elapsed
    /// timeout transitions to HALF_OPEN and admits the probe.
    pub fn try_acquire(&self) -> Result<(), RagError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or_else(Instant::now);
                let elapsed_ms = opened_at.elapsed().as_millis() as u64;
                if elapsed_ms >= self.config.reset_timeout_ms {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_successes = 0;
                    tracing::info!("circuit half-open, admitting probe");
                    Ok(())
                } else {
                    Err(RagError::CircuitOpen {
                        remaining_ms: self.config.reset_timeout_ms - elapsed_ms,
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.half_open_requests {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.opened_at = None;
                    tracing::info!("circuit closed after successful probes");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        failures = inner.failure_count,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                tracing::warn!("probe failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    /// Run the protected operation through the breaker.
    pub async fn execute<T, Fut>(&self, fut: Fut) -> Result<T, RagError>
    where
        Fut: Future<Output = Result<T, RagError>>,
    {
        self.try_acquire()?;
        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(error)
            }
        }
    }

    /// Return to CLOSED with counters cleared.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.probe_successes = 0;
        inner.opened_at = None;
    }

    /// Force OPEN, starting the cool-down now.
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
    }
}

/// One breaker per named target, created on first use.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, target: &str, config: &BreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(config.clone())))
            .clone()
    }

    pub fn get(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(target).map(|entry| entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, Duration};

    fn breaker(threshold: u32, reset_ms: u64, probes: u32) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            reset_timeout_ms: reset_ms,
            half_open_requests: probes,
        })
    }

    async fn fail(b: &CircuitBreaker) {
        let _ = b
            .execute::<(), _>(async { Err(RagError::provider("down")) })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_transition_cycle() {
        let b = breaker(3, 500, 1);

        // Three consecutive failures open the circuit.
        for _ in 0..3 {
            fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Open);

        // At t=200 the call fails fast with ~300 ms remaining.
        advance(Duration::from_millis(200)).await;
        let err = b.execute(async { Ok(()) }).await.unwrap_err();
        match err {
            RagError::CircuitOpen { remaining_ms } => {
                assert!((290..=310).contains(&remaining_ms), "remaining {}", remaining_ms);
            }
            other => panic!("expected CircuitOpen, got {:?}", other),
        }

        // At t=600 the breaker half-opens and the probe executes.
        advance(Duration::from_millis(400)).await;
        b.execute(async { Ok(()) }).await.expect("probe runs");

        // Probe success closes the circuit and clears the fail count.
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 0);
        b.execute(async { Ok(()) }).await.expect("closed again");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let b = breaker(1, 100, 1);
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);

        advance(Duration::from_millis(150)).await;
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);

        // The cool-down restarted at the probe failure.
        let err = b.try_acquire().unwrap_err();
        assert!(matches!(err, RagError::CircuitOpen { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_running_the_function() {
        let b = breaker(1, 60_000, 1);
        fail(&b).await;

        let ran = std::sync::atomic::AtomicBool::new(false);
        let err = b
            .execute(async {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::CircuitOpen { .. }));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_probe_half_open() {
        let b = breaker(1, 100, 2);
        fail(&b).await;
        advance(Duration::from_millis(150)).await;

        b.execute(async { Ok(()) }).await.expect("first probe");
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.execute(async { Ok(()) }).await.expect("second probe");
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let b = breaker(3, 100, 1);
        fail(&b).await;
        fail(&b).await;
        assert_eq!(b.failure_count(), 2);
        b.execute(async { Ok(()) }).await.expect("success");
        assert_eq!(b.failure_count(), 0);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_trip_and_reset() {
        let b = breaker(5, 60_000, 1);
        b.trip();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.try_acquire().is_err());
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_registry_hands_out_one_breaker_per_target() {
        let registry = BreakerRegistry::new();
        let config = BreakerConfig::default();
        let a = registry.get_or_create("embeddings", &config);
        let b = registry.get_or_create("embeddings", &config);
        a.trip();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(registry.get("chat").is_none());
    }
}
