//! Provides backoff timing control for guest and control-plane polling,
//! such as waiting for SSH, the apiserver or system pods.
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Decides the pause between two polls of something that is not ready yet.
#[async_trait::async_trait]
pub trait BackoffStrategy: Send {
    /// Starts over from the shortest pause.
    fn reset(&mut self);
    /// The pause before the next poll.
    fn next_duration(&mut self) -> Duration;
    /// Sleeps for [`BackoffStrategy::next_duration`].
    async fn wait(&mut self) {
        tokio::time::sleep(self.next_duration()).await
    }
}

/// Doubles the pause after every poll, up to `cap`.
pub struct ExponentialBackoffStrategy {
    base_duration: Duration,
    cap: Duration,
    last_duration: Duration,
}

impl Default for ExponentialBackoffStrategy {
    /// Half a second, doubling up to 15s: suited to a booting guest.
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(15))
    }
}

impl ExponentialBackoffStrategy {
    /// Creates a strategy starting at `base_duration` and never waiting
    /// longer than `cap`.
    pub fn new(base_duration: Duration, cap: Duration) -> Self {
        Self {
            base_duration,
            cap,
            last_duration: Duration::ZERO,
        }
    }

    fn capped_next_duration(&self) -> Duration {
        if self.last_duration.is_zero() {
            return self.base_duration.min(self.cap);
        }
        (self.last_duration * 2).min(self.cap)
    }
}

impl BackoffStrategy for ExponentialBackoffStrategy {
    fn reset(&mut self) {
        self.last_duration = Duration::ZERO;
    }

    fn next_duration(&mut self) -> Duration {
        self.last_duration = self.capped_next_duration();
        self.last_duration
    }
}

/// Bounds on a retry loop. Either bound may be absent, but not both.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: Option<usize>,
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    pub fn attempts(max_attempts: usize) -> Self {
        RetryPolicy {
            max_attempts: Some(max_attempts),
            deadline: None,
        }
    }

    pub fn deadline(deadline: Duration) -> Self {
        RetryPolicy {
            max_attempts: None,
            deadline: Some(deadline),
        }
    }
}

/// Runs `op` until it succeeds, waiting between attempts as dictated by
/// `strategy`. The last error is returned once `policy` is exhausted.
pub async fn retry<T, F, Fut>(
    what: &str,
    strategy: &mut dyn BackoffStrategy,
    policy: RetryPolicy,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match op().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        let out_of_attempts = policy.max_attempts.map_or(false, |max| attempt >= max);
        let wait = strategy.next_duration();
        let out_of_time = policy
            .deadline
            .map_or(false, |d| started.elapsed() + wait > d);
        if out_of_attempts || out_of_time {
            return Err(err.context(format!(
                "{} failed after {} attempt(s) in {:?}",
                what,
                attempt,
                started.elapsed()
            )));
        }
        debug!(%what, attempt, ?wait, error = %err, "will retry");
        tokio::time::sleep(wait).await;
    }
}
