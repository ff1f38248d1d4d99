//! Retry with exponential backoff and optional jitter.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use rand::Rng;
use tokio::time::Duration;

use crate::cancel::CancelToken;
use crate::error::RagError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Multiply each delay by a uniform factor in [0.5, 1.0].
    pub jitter: bool,
    /// Error codes worth retrying. Empty means retry everything.
    pub retryable_codes: HashSet<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
            retryable_codes: HashSet::new(),
        }
    }
}

type RetryPredicate = Arc<dyn Fn(&RagError) -> bool + Send + Sync>;

pub struct RetryStrategy {
    policy: RetryPolicy,
    should_retry: Option<RetryPredicate>,
}

impl RetryStrategy {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            should_retry: None,
        }
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&RagError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Delay before retry `attempt` (0-indexed), before jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.policy.base_delay_ms as f64
            * self.policy.backoff_multiplier.powi(attempt as i32);
        let capped = raw.min(self.policy.max_delay_ms as f64);
        let jittered = if self.policy.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped
        };
        Duration::from_millis(jittered.round() as u64)
    }

    fn is_retryable(&self, error: &RagError) -> bool {
        // Cancellation is terminal no matter what the policy says.
        if matches!(error, RagError::Aborted) {
            return false;
        }
        if !self.policy.retryable_codes.is_empty()
            && !self.policy.retryable_codes.contains(error.code())
        {
            return false;
        }
        if let Some(predicate) = &self.should_retry {
            if !predicate(error) {
                return false;
            }
        }
        true
    }

    /// Run `op` up to `max_retries + 1` times. Returns the value together
    /// with the number of attempts spent. The cancellation token is checked
    /// before every attempt and during backoff sleep.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancelToken,
        mut op: F,
    ) -> Result<(T, u32), RagError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RagError>>,
    {
        let mut last_error: Option<RagError> = None;

        for attempt in 0..=self.policy.max_retries {
            cancel.check()?;

            match op(attempt).await {
                Ok(value) => return Ok((value, attempt + 1)),
                Err(error) => {
                    let final_attempt = attempt == self.policy.max_retries;
                    if !final_attempt && !self.is_retryable(&error) {
                        return Err(error);
                    }
                    tracing::warn!(
                        attempt = attempt + 1,
                        code = error.code(),
                        error = %error,
                        "attempt failed"
                    );
                    last_error = Some(error);

                    if !final_attempt {
                        let delay = self.delay_for(attempt);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => return Err(RagError::Aborted),
                        }
                    }
                }
            }
        }

        Err(RagError::RetryExhausted {
            attempts: self.policy.max_retries + 1,
            source: Box::new(last_error.unwrap_or(RagError::Aborted)),
        })
    }
}
