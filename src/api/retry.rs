//! Bounded retry with a fixed backoff interval.
//!
//! A `RetryPolicy` wraps a fallible async operation and re-runs it when the
//! error matches the policy's predicate. Policies are composable: a call site
//! may stack two independent policies (for example transport errors and
//! application-level lookup errors) by nesting `run` calls.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Retries an async operation a bounded number of times, waiting a fixed
/// interval between attempts.
pub struct RetryPolicy<E> {
	max_attempts: u32,
	interval: Duration,
	retry_on: Predicate<E>,
}

impl<E> Clone for RetryPolicy<E> {
	fn clone(&self) -> Self {
		Self {
			max_attempts: self.max_attempts,
			interval: self.interval,
			retry_on: self.retry_on.clone(),
		}
	}
}

impl<E: Display> RetryPolicy<E> {
	/// Create a policy that retries every error.
	pub fn new(max_attempts: u32, interval: Duration) -> Self {
		Self {
			max_attempts: max_attempts.max(1),
			interval,
			retry_on: Arc::new(|_| true),
		}
	}

	/// Restrict the policy to errors matching `predicate`. Non-matching
	/// errors are surfaced immediately without retrying.
	pub fn retry_on(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
		self.retry_on = Arc::new(predicate);
		self
	}

	/// Execute `op`, retrying on matching errors. The last error is surfaced
	/// once the attempt budget is exhausted.
	pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, E>>,
	{
		let mut attempt = 0;
		loop {
			attempt += 1;
			match op().await {
				Ok(value) => return Ok(value),
				Err(err) => {
					if !(self.retry_on)(&err) {
						return Err(err);
					}

					if attempt >= self.max_attempts {
						error!("{} failed with `{}`. Giving up.", label, err);
						return Err(err);
					}

					warn!(
						"{} failed with `{}`, attempt {}/{}",
						label, err, attempt, self.max_attempts
					);
					tokio::time::sleep(self.interval).await;
				}
			}
		}
	}
}
