//! Error recovery: retry with backoff, circuit breaking, and their
//! composition with optional fallback responses.

mod breaker;
mod retry;

pub use breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState};
pub use retry::{RetryPolicy, RetryStrategy};

use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::error::RagError;

/// Outcome of a recovered call. A configured fallback converts an outer
/// failure into a synthetic success with `used_fallback` set.
#[derive(Debug)]
pub struct RecoveryOutcome<T> {
    pub success: bool,
    pub value: Option<T>,
    pub error: Option<RagError>,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub used_fallback: bool,
}

type ErrorCallback = Arc<dyn Fn(&RagError) + Send + Sync>;

/// Composes the retry strategy with an optional circuit breaker.
pub struct ErrorRecovery<T: Clone> {
    retry: RetryStrategy,
    breaker: Option<Arc<CircuitBreaker>>,
    fallback: Option<T>,
    on_error: Option<ErrorCallback>,
}

impl<T: Clone> ErrorRecovery<T> {
    pub fn new(retry: RetryStrategy) -> Self {
        Self {
            retry,
            breaker: None,
            fallback: None,
            on_error: None,
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_fallback(mut self, fallback: T) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&RagError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    fn emit_error(&self, error: &RagError) {
        if let Some(callback) = &self.on_error {
            callback(error);
        }
    }

    fn failure(&self, error: RagError, attempts: u32, started: Instant) -> RecoveryOutcome<T> {
        self.emit_error(&error);
        if let Some(fallback) = &self.fallback {
            return RecoveryOutcome {
                success: true,
                value: Some(fallback.clone()),
                error: Some(error),
                attempts,
                elapsed_ms: started.elapsed().as_millis() as u64,
                used_fallback: true,
            };
        }
        RecoveryOutcome {
            success: false,
            value: None,
            error: Some(error),
            attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
            used_fallback: false,
        }
    }

    /// Execute `op` under retry, each attempt admitted through the breaker
    /// when one is configured.
    pub async fn execute<F, Fut>(&self, cancel: &CancelToken, mut op: F) -> RecoveryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RagError>>,
    {
        let started = Instant::now();

        // Fast path: an open breaker rejects before any retry machinery runs.
        if let Some(breaker) = &self.breaker {
            if let Err(error) = breaker.try_acquire() {
                return self.failure(error, 0, started);
            }
        }

        let breaker = self.breaker.clone();
        let outcome = self
            .retry
            .run(cancel, |attempt| {
                let fut = op(attempt);
                let breaker = breaker.clone();
                async move {
                    match &breaker {
                        Some(b) => b.execute(fut).await,
                        None => fut.await,
                    }
                }
            })
            .await;

        match outcome {
            Ok((value, attempts)) => RecoveryOutcome {
                success: true,
                value: Some(value),
                error: None,
                attempts,
                elapsed_ms: started.elapsed().as_millis() as u64,
                used_fallback: false,
            },
            Err(error) => {
                let attempts = match &error {
                    RagError::RetryExhausted { attempts, .. } => *attempts,
                    _ => 1,
                };
                self.failure(error, attempts, started)
            }
        }
    }
}
