use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

pub(crate) const RATE_LIMIT_MAX_RETRIES: usize = 5;

/// Exponential backoff window shared by provider calls and tile retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub const RATE_LIMIT: Backoff = Backoff {
        base: Duration::from_secs(2),
        max: Duration::from_secs(60),
    };

    pub fn next_delay(&self, current: Duration) -> Duration {
        let next = current.saturating_mul(2).max(self.base);
        if next > self.max { self.max } else { next }
    }
}

pub(crate) fn is_rate_limited(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    let code = status.as_u16();
    if code == 529 || code == 503 {
        return true;
    }
    let lower = body.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
        || lower.contains("quota")
        || lower.contains("overloaded")
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    if value.is_empty() {
        return None;
    }
    value.parse::<u64>().ok().map(Duration::from_secs)
}

/// Sleeps for `delay` (or a longer server hint) and returns the next delay.
pub(crate) async fn wait_with_backoff(
    label: &str,
    attempt: usize,
    max_attempts: usize,
    delay: Duration,
    retry_after: Option<Duration>,
    backoff: Backoff,
) -> Duration {
    let mut wait = delay;
    if let Some(retry_after) = retry_after
        && retry_after > wait
    {
        wait = retry_after;
    }
    warn!(
        "{} retrying in {:.1}s (attempt {}/{})",
        label,
        wait.as_secs_f32(),
        attempt,
        max_attempts
    );
    sleep(wait).await;
    backoff.next_delay(delay)
}
