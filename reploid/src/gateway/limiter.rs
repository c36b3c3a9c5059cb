//! Per-provider token-bucket rate limiting.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Classic token bucket: `capacity` burst, `refill_per_sec` sustained.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

/// The bucket could not supply a token within the caller's wait budget.
#[derive(Debug, PartialEq, Eq)]
pub struct Exhausted;

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity.max(1.0),
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            state: Mutex::new(BucketState {
                tokens: capacity.max(1.0),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes one token, waiting up to `max_wait` for a refill.
    pub async fn acquire(&self, max_wait: Duration) -> Result<(), Exhausted> {
        let wait = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            state.last_refill = now;

            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return Ok(());
            }
            let needed = 1.0 - state.tokens;
            let wait = Duration::from_secs_f64(needed / self.refill_per_sec);
            if wait > max_wait {
                return Err(Exhausted);
            }
            // Claim the token now so concurrent waiters queue up behind it.
            state.tokens = 0.0;
            state.last_refill = now + wait;
            wait
        };
        tokio::time::sleep(wait).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_up_to_capacity_then_exhausted() {
        let bucket = TokenBucket::new(2.0, 0.001);
        assert!(bucket.acquire(Duration::ZERO).await.is_ok());
        assert!(bucket.acquire(Duration::ZERO).await.is_ok());
        assert_eq!(bucket.acquire(Duration::ZERO).await, Err(Exhausted));
    }

    #[tokio::test]
    async fn waits_for_refill_within_budget() {
        tokio::time::pause();
        let bucket = TokenBucket::new(1.0, 10.0); // refill in 100ms
        assert!(bucket.acquire(Duration::ZERO).await.is_ok());
        let acquired = bucket.acquire(Duration::from_secs(1));
        tokio::pin!(acquired);
        assert!(acquired.await.is_ok());
    }
}
