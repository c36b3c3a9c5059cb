//! Retry policy for provider calls: exponential backoff with jitter, applied
//! only to idempotent failures (network errors, 5xx, provider-declared
//! transient statuses). Auth and request errors raise immediately.

use std::time::Duration;

/// How a response status should be handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retryability {
    Ok,
    Transient,
    RateLimited,
    Fatal,
}

/// Status → retryability. 2xx ok; 408/429 and 5xx retry; everything else is
/// final.
pub fn classify_status(status: u16) -> Retryability {
    match status {
        200..=299 => Retryability::Ok,
        429 => Retryability::RateLimited,
        408 => Retryability::Transient,
        500..=599 => Retryability::Transient,
        _ => Retryability::Fatal,
    }
}

/// Exponential backoff: `base × 2^(attempt-1)`, capped, with ±25% jitter.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16));
        let capped = exp.min(self.cap);
        // Cheap jitter from the clock's sub-millisecond noise; spreads
        // synchronized retry storms without a rand dependency.
        let noise = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0);
        let jitter_range = capped.as_millis() as u64 / 2; // ±25%
        if jitter_range == 0 {
            return capped;
        }
        let offset = noise % (jitter_range + 1);
        capped - Duration::from_millis(jitter_range / 2) + Duration::from_millis(offset)
    }
}
