use chrono::{DateTime, FixedOffset, Utc};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Timestamp format of the `Last Updated` column
pub const LAST_UPDATED_FORMAT: &str = "%Y-%m-%d %H:%M:%S CST";

const BEIJING_OFFSET_SECS: i32 = 8 * 3600;

/// Current time in China Standard Time (fixed UTC+8, no DST)
pub fn beijing_now() -> DateTime<FixedOffset> {
    let utc_now = Utc::now();
    match FixedOffset::east_opt(BEIJING_OFFSET_SECS) {
        Some(offset) => utc_now.with_timezone(&offset),
        None => utc_now.fixed_offset(),
    }
}

/// Bounded retry with multiplicative backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
}

impl RetryPolicy {
    /// Bulk spot snapshot: 3 attempts, 2s then 4s
    pub const fn price_snapshot() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
        }
    }

    /// Per-security forecast: 3 attempts, 1s then 1.5s
    pub const fn eps_forecast() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 1.5,
        }
    }
}

/// Run `operation` until it succeeds or the policy's attempts are used up.
/// The last error is returned on exhaustion.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts => {
                warn!(
                    "{}: attempt {}/{} failed: {}. Retrying in {:.1}s...",
                    label,
                    attempt,
                    max_attempts,
                    e,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(policy.backoff_factor);
                attempt += 1;
            }
            Err(e) => {
                error!("{}: all {} attempts failed: {}", label, max_attempts, e);
                return Err(e);
            }
        }
    }
}
