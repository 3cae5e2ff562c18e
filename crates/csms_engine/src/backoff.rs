use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Longest time `run` can take when every attempt takes `per_attempt`.
    pub fn worst_case(&self, per_attempt: Duration) -> Duration {
        (1..self.max_attempts).fold(
            per_attempt.saturating_mul(self.max_attempts),
            |total, attempt| total.saturating_add(self.delay_after(attempt)),
        )
    }

    /// Run `op` until it succeeds, `should_retry` refuses the error or the
    /// attempts are exhausted. The last error is returned.
    pub async fn run<T, E, F, Fut>(
        &self,
        what: &str,
        should_retry: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.max_attempts || !should_retry(&err) => return Err(err),
                Err(err) => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(attempt, ?delay, error = %err, "{what} failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
        }
    }

    #[test]
    fn test_delays_double_up_to_max() {
        let policy = policy();
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(250));
        assert_eq!(policy.delay_after(40), Duration::from_millis(250));
    }

    #[test]
    fn test_worst_case_adds_attempts_and_delays() {
        // 4 x 1 s plus 100 + 200 + 250 ms
        assert_eq!(
            policy().worst_case(Duration::from_secs(1)),
            Duration::from_millis(4_550)
        );
        assert_eq!(
            RetryPolicy::default().worst_case(Duration::from_secs(30)),
            Duration::from_millis(91_500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<u32, String> = policy()
            .run("flaky", |_| true, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("attempt {attempt}"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = policy()
            .run("broken", |_| true, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("attempt {attempt}")) }
            })
            .await;
        assert_eq!(result, Err("attempt 4".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = policy()
            .run("rejected", |err: &String| err != "permanent", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
