use std::future::Future;
use std::time::Duration;

use super::error::EngineError;
use crate::util::env_u64;

/// Linear backoff: attempt 1 waits `base`, attempt 2 waits `2 * base`, etc.
pub(crate) fn backoff_delay(attempt: u64, base: Duration) -> Duration {
    base.saturating_mul(attempt.max(1) as u32)
}

pub(crate) fn lock_retry_base() -> Duration {
    Duration::from_millis(env_u64("FOIL_LOCK_RETRY_BASE_MS", 25))
}

pub(crate) fn lock_retry_max() -> u64 {
    env_u64("FOIL_LOCK_RETRY_MAX", 3).max(1)
}

/// Run `op`, retrying retryable failures with linear backoff. The final
/// attempt's error is returned as-is.
pub(crate) async fn with_backoff<T, F, Fut>(
    max_attempts: u64,
    base: Duration,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1u64;
    loop {
        match op().await {
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                tokio::time::sleep(backoff_delay(attempt, base)).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
