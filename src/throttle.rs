//! Request and token throttling over a rolling window
//!
//! Every outbound call (pool fetches, history seeding, risk checks) goes
//! through one shared [`Throttler`]. Callers are suspended, never rejected,
//! when a ceiling is reached. Waiters are served in arrival order.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::ThrottleConfig;
use crate::error::{Error, Result};

/// Ceilings applied per window
#[derive(Debug, Clone)]
pub struct ThrottleLimits {
    pub max_requests: u32,
    pub max_tokens: u32,
    pub window: Duration,
    pub rate_limit_backoff: Duration,
}

impl From<&ThrottleConfig> for ThrottleLimits {
    fn from(config: &ThrottleConfig) -> Self {
        Self {
            max_requests: config.max_requests_per_minute,
            max_tokens: config.max_tokens_per_minute,
            window: Duration::from_secs(config.window_secs),
            rate_limit_backoff: Duration::from_secs_f64(config.rate_limit_backoff_seconds.max(0.0)),
        }
    }
}

/// Counters for the current window
#[derive(Debug, Clone, Copy)]
struct ThrottleWindow {
    started_at: Instant,
    requests: u32,
    tokens: u32,
    backoff_until: Option<Instant>,
}

impl ThrottleWindow {
    fn fresh(now: Instant) -> Self {
        Self {
            started_at: now,
            requests: 0,
            tokens: 0,
            backoff_until: None,
        }
    }

    fn roll_if_elapsed(&mut self, now: Instant, window: Duration) {
        if now >= self.started_at + window {
            self.started_at = now;
            self.requests = 0;
            self.tokens = 0;
        }
    }
}

/// Point-in-time view of the throttle state
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleSnapshot {
    pub requests: u32,
    pub tokens: u32,
    pub window_remaining: Duration,
    pub backoff_remaining: Option<Duration>,
}

pub struct Throttler {
    limits: ThrottleLimits,
    /// Fair queue; held by the head waiter until it is granted
    queue: tokio::sync::Mutex<()>,
    window: Mutex<ThrottleWindow>,
}

impl Throttler {
    pub fn new(limits: ThrottleLimits) -> Self {
        Self {
            limits,
            queue: tokio::sync::Mutex::new(()),
            window: Mutex::new(ThrottleWindow::fresh(Instant::now())),
        }
    }

    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self::new(ThrottleLimits::from(config))
    }

    pub fn limits(&self) -> &ThrottleLimits {
        &self.limits
    }

    /// Wait until `request_cost` requests and `token_cost` tokens fit in the
    /// current window, then consume them.
    ///
    /// Fails only when a cost can never fit.
    pub async fn acquire(&self, request_cost: u32, token_cost: u32) -> Result<()> {
        if request_cost > self.limits.max_requests {
            return Err(Error::ThrottleMisconfigured(format!(
                "request cost {} exceeds ceiling {}",
                request_cost, self.limits.max_requests
            )));
        }
        if token_cost > self.limits.max_tokens {
            return Err(Error::ThrottleMisconfigured(format!(
                "token cost {} exceeds ceiling {}",
                token_cost, self.limits.max_tokens
            )));
        }

        let _turn = self.queue.lock().await;

        loop {
            let wake_at = {
                let mut window = self.lock_window();
                let now = Instant::now();
                window.roll_if_elapsed(now, self.limits.window);

                match window.backoff_until {
                    Some(until) if until > now => until,
                    _ => {
                        window.backoff_until = None;
                        let requests = window
                            .requests
                            .checked_add(request_cost)
                            .filter(|r| *r <= self.limits.max_requests);
                        let tokens = window
                            .tokens
                            .checked_add(token_cost)
                            .filter(|t| *t <= self.limits.max_tokens);
                        if let (Some(requests), Some(tokens)) = (requests, tokens) {
                            window.requests = requests;
                            window.tokens = tokens;
                            trace!(
                                requests = window.requests,
                                tokens = window.tokens,
                                "Throttle granted"
                            );
                            return Ok(());
                        }
                        window.started_at + self.limits.window
                    }
                }
            };

            debug!(
                wait_ms = wake_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Throttle ceiling reached, waiting"
            );
            tokio::time::sleep_until(wake_at).await;
        }
    }

    /// Record an explicit rate-limit response. All acquires wait at least
    /// `rate_limit_backoff` from now.
    pub fn note_rate_limit(&self) {
        let mut window = self.lock_window();
        let until = Instant::now() + self.limits.rate_limit_backoff;
        let extended = match window.backoff_until {
            Some(existing) if existing >= until => existing,
            _ => until,
        };
        window.backoff_until = Some(extended);
        warn!(
            backoff_secs = self.limits.rate_limit_backoff.as_secs_f64(),
            "Rate limit signalled, pausing outbound calls"
        );
    }

    /// Start a fresh window and clear any backoff
    pub fn reset(&self) {
        *self.lock_window() = ThrottleWindow::fresh(Instant::now());
        debug!("Throttle window reset");
    }

    pub fn snapshot(&self) -> ThrottleSnapshot {
        let window = self.lock_window();
        let now = Instant::now();
        let window_end = window.started_at + self.limits.window;
        ThrottleSnapshot {
            requests: window.requests,
            tokens: window.tokens,
            window_remaining: window_end.saturating_duration_since(now),
            backoff_remaining: window
                .backoff_until
                .filter(|until| *until > now)
                .map(|until| until - now),
        }
    }

    fn lock_window(&self) -> std::sync::MutexGuard<'_, ThrottleWindow> {
        // Counter updates cannot leave the window inconsistent, so a poisoned lock is still usable
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limits(max_requests: u32, max_tokens: u32) -> ThrottleLimits {
        ThrottleLimits {
            max_requests,
            max_tokens,
            window: Duration::from_secs(60),
            rate_limit_backoff: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_request_ceiling() {
        const N: u32 = 5;
        let throttle = Arc::new(Throttler::new(limits(N, 1_000)));
        let start = Instant::now();

        let handles: Vec<_> = (0..2 * N)
            .map(|_| {
                let throttle = throttle.clone();
                tokio::spawn(async move {
                    throttle.acquire(1, 1).await.unwrap();
                    Instant::now().duration_since(start)
                })
            })
            .collect();

        let mut stamps = Vec::new();
        for h in handles {
            stamps.push(h.await.unwrap());
        }

        let mut per_window = std::collections::HashMap::new();
        for stamp in &stamps {
            *per_window.entry(stamp.as_secs() / 60).or_insert(0u32) += 1;
        }
        assert!(per_window.values().all(|count| *count <= N));
        assert_eq!(per_window.get(&0), Some(&N));
        assert_eq!(per_window.get(&1), Some(&N));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_ceiling_suspends() {
        let throttle = Throttler::new(limits(100, 1_000));
        let start = Instant::now();

        throttle.acquire(1, 600).await.unwrap();
        throttle.acquire(1, 600).await.unwrap();

        assert!(Instant::now().duration_since(start) >= Duration::from_secs(60));
        assert_eq!(throttle.snapshot().tokens, 600);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_granted_in_arrival_order() {
        let throttle = Arc::new(Throttler::new(limits(2, 1_000)));
        throttle.acquire(2, 0).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let throttle = throttle.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                throttle.acquire(1, 0).await.unwrap();
                order.lock().unwrap().push(i);
            }));
            // let each waiter enqueue before the next one arrives
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_backoff_overrides_window() {
        let throttle = Throttler::new(limits(10, 1_000));
        let start = Instant::now();

        throttle.note_rate_limit();
        assert!(throttle.snapshot().backoff_remaining.is_some());

        throttle.acquire(1, 1).await.unwrap();
        let waited = Instant::now().duration_since(start);
        assert!(waited >= Duration::from_secs(5));
        assert!(waited < Duration::from_secs(60));
        assert!(throttle.snapshot().backoff_remaining.is_none());
    }

    #[tokio::test]
    async fn test_cost_above_ceiling_fails_fast() {
        let throttle = Throttler::new(limits(10, 100));
        assert!(matches!(
            throttle.acquire(1, 101).await,
            Err(Error::ThrottleMisconfigured(_))
        ));
        assert!(matches!(
            throttle.acquire(11, 1).await,
            Err(Error::ThrottleMisconfigured(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_counters() {
        let throttle = Throttler::new(limits(3, 1_000));
        throttle.acquire(3, 30).await.unwrap();
        throttle.note_rate_limit();

        throttle.reset();
        let snap = throttle.snapshot();
        assert_eq!(snap.requests, 0);
        assert_eq!(snap.tokens, 0);
        assert!(snap.backoff_remaining.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_at_u32_max_does_not_overflow() {
        let throttle = Throttler::new(limits(u32::MAX, u32::MAX));
        throttle.acquire(u32::MAX, 1).await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_secs(1), throttle.acquire(1, 1)).await;
        assert!(blocked.is_err());
        assert_eq!(throttle.snapshot().requests, u32::MAX);

        // the next window grants again
        tokio::time::advance(Duration::from_secs(60)).await;
        throttle.acquire(1, 1).await.unwrap();
        assert_eq!(throttle.snapshot().requests, 1);
    }
}
