use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rate limiter backend failed: {0}")]
pub struct RateLimitError(pub String);

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Consumes one request from `key`'s budget; false once it is spent.
    async fn allow(&self, key: &str) -> Result<bool, RateLimitError>;
}

/// In-process limiter: at most `limit` requests per key in any `window`.
///
/// Keys idle for a full window are dropped on the next prune, which runs at
/// most once per window.
pub struct SlidingWindowLimiter {
    limit: usize,
    window: Duration,
    state: Mutex<WindowState>,
}

#[derive(Default)]
struct WindowState {
    hits: HashMap<String, VecDeque<Instant>>,
    last_prune: Option<Instant>,
}

impl WindowState {
    fn prune(&mut self, now: Instant, window: Duration) {
        if self
            .last_prune
            .is_some_and(|last| now.duration_since(last) < window)
        {
            return;
        }
        self.hits.retain(|_, entries| {
            entries
                .back()
                .is_some_and(|newest| now.duration_since(*newest) < window)
        });
        self.last_prune = Some(now);
    }
}

impl SlidingWindowLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit as usize,
            window,
            state: Mutex::new(WindowState::default()),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    async fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut state = self.state.lock().await;
        state.prune(now, self.window);
        let entries = state.hits.entry(key.to_string()).or_default();
        while entries
            .front()
            .is_some_and(|hit| now.duration_since(*hit) >= self.window)
        {
            entries.pop_front();
        }
        if entries.len() >= self.limit {
            return false;
        }
        entries.push_back(now);
        true
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn allow(&self, key: &str) -> Result<bool, RateLimitError> {
        Ok(self.allow_at(key, Instant::now()).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limit_per_key() {
        let limiter = SlidingWindowLimiter::per_minute(2);
        assert!(limiter.allow("10.0.0.1").await.unwrap());
        assert!(limiter.allow("10.0.0.1").await.unwrap());
        assert!(!limiter.allow("10.0.0.1").await.unwrap());
        assert!(limiter.allow("10.0.0.2").await.unwrap());
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();
        assert!(limiter.allow_at("k", start).await);
        assert!(!limiter.allow_at("k", start + Duration::from_secs(5)).await);
        assert!(limiter.allow_at("k", start + Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_idle_keys_are_dropped() {
        let limiter = SlidingWindowLimiter::new(5, Duration::from_secs(10));
        let start = Instant::now();
        for n in 0..50 {
            assert!(limiter.allow_at(&format!("10.0.0.{n}"), start).await);
        }
        assert_eq!(limiter.state.lock().await.hits.len(), 50);

        assert!(limiter.allow_at("10.0.1.1", start + Duration::from_secs(11)).await);
        let state = limiter.state.lock().await;
        assert_eq!(state.hits.len(), 1);
        assert!(state.hits.contains_key("10.0.1.1"));
    }
}
