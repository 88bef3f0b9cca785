use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// Sliding-window limiter: at most `max_calls` grants in any `window`.
///
/// Waiters queue on a fair async mutex, so permits are handed out in
/// request order.
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    grants: AsyncMutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: u32, window: Duration) -> Self {
        let max_calls = max_calls.max(1) as usize;
        Self {
            max_calls,
            window,
            grants: AsyncMutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    /// Suspends until a call is permitted, then records the grant.
    pub async fn acquire(&self) {
        self.acquire_with(|| ()).await
    }

    /// Like [`acquire`](Self::acquire), running `on_grant` while the grant is
    /// recorded so bookkeeping cannot interleave with another caller's grant.
    pub async fn acquire_with<F: FnOnce()>(&self, on_grant: F) {
        let mut grants = self.grants.lock().await;
        loop {
            let now = Instant::now();
            while let Some(oldest) = grants.front() {
                if now.duration_since(*oldest) >= self.window {
                    grants.pop_front();
                } else {
                    break;
                }
            }
            if grants.len() < self.max_calls {
                break;
            }
            if let Some(oldest) = grants.front().copied() {
                let ready_at = oldest + self.window;
                trace!(wait = ?ready_at.duration_since(now), "rate window full");
                sleep_until(ready_at).await;
            }
        }
        grants.push_back(Instant::now());
        on_grant();
    }
}
