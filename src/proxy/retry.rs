use std::future::Future;

use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

// Exponential backoff for auxiliary calls (token refresh and the like).
// The relay itself never retries a dispatched request; that choice belongs
// to the caller.
pub async fn retry_with_backoff<T, E, F, Fut>(
    max_attempts: u32,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = max_attempts.max(1);
    let mut failures = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                if failures > 0 {
                    debug!("[Retry] {} succeeded after {} retr(ies)", label, failures);
                }
                return Ok(value);
            }
            Err(error) => {
                failures += 1;
                if failures >= attempts {
                    warn!("[Retry] {} failed after {} attempt(s): {}", label, failures, error);
                    return Err(error);
                }
                let delay = Duration::from_millis(1000u64 << (failures - 1));
                warn!(
                    "[Retry] {} attempt {}/{} failed: {}, retrying in {}ms",
                    label,
                    failures,
                    attempts,
                    error,
                    delay.as_millis()
                );
                sleep(delay).await;
            }
        }
    }
}
