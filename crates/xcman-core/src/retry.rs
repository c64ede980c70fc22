use std::future::Future;
use std::time::Duration;

use log::debug;

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_DELAY: Duration = Duration::from_secs(2);

/// Fixed-delay retry budget: `attempts` tries, `delay` between consecutive
/// tries and none before the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay: DEFAULT_DELAY,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Run `operation` until it succeeds or the budget is spent, returning
    /// the last error. At least one attempt is always made.
    ///
    /// # Errors
    /// Returns the error of the final attempt when every attempt fails.
    pub async fn run<T, E, Op, Fut>(
        &self,
        operation_name: &'static str,
        mut operation: Op,
    ) -> Result<T, E>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < attempts => {
                    debug!("{operation_name} attempt {attempt}/{attempts} failed: {error}");
                }
                Err(error) => return Err(error),
            }

            attempt += 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
    }
}
