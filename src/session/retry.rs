use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retries an idempotent remote operation with exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries including the first (minimum 1)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Single try, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after failed try `attempt` (0-indexed)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds or the attempts are used up, returning
    /// the last error
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(e.context(format!(
                            "{} failed after {} attempt(s)",
                            operation, attempt
                        )));
                    }

                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {:#}",
                        operation, attempt, max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
