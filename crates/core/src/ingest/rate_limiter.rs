//! Token-bucket admission gate shared by every outbound quote API call.
//!
//! The bucket holds up to `calls_per_minute` tokens and refills continuously. On top of the
//! bucket a rolling 60 s log caps admissions at `window_budget`, so a full bucket plus a minute
//! of refill can never exceed the per-minute quota. The mutex only guards the counters; callers
//! sleep outside of it and race for network I/O after admission.

use crate::config::env_parse;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);

const DEFAULT_CALLS_PER_MINUTE: u32 = 60;
const DEFAULT_PAUSE_EVERY: u64 = 50;
const DEFAULT_PAUSE_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Bucket capacity and refill per minute.
    pub calls_per_minute: u32,

    /// Hard cap on admissions inside any rolling 60 s window.
    pub window_budget: u32,

    /// Tokens available at start. Kept low so a cold start does not burst.
    pub initial_tokens: f64,

    /// Every `pause_every`-th admission imposes `pause` before the next one. 0 disables.
    pub pause_every: u64,
    pub pause: Duration,
}

impl RateLimitConfig {
    pub fn new(calls_per_minute: u32) -> Self {
        let calls_per_minute = calls_per_minute.max(1);
        Self {
            calls_per_minute,
            window_budget: ((calls_per_minute as f64 * 0.92) as u32).max(1),
            initial_tokens: (calls_per_minute / 6).clamp(1, 10) as f64,
            pause_every: DEFAULT_PAUSE_EVERY,
            pause: Duration::from_millis(DEFAULT_PAUSE_MS),
        }
    }

    pub fn from_env() -> Self {
        let mut out = Self::new(
            env_parse::<u32>("RATE_LIMIT_CALLS_PER_MINUTE").unwrap_or(DEFAULT_CALLS_PER_MINUTE),
        );
        if let Some(n) = env_parse::<u32>("RATE_LIMIT_WINDOW_BUDGET") {
            out.window_budget = n.max(1);
        }
        if let Some(n) = env_parse::<f64>("RATE_LIMIT_INITIAL_TOKENS") {
            out.initial_tokens = n.max(0.0);
        }
        if let Some(n) = env_parse::<u64>("RATE_LIMIT_PAUSE_EVERY") {
            out.pause_every = n;
        }
        if let Some(ms) = env_parse::<u64>("RATE_LIMIT_PAUSE_MS") {
            out.pause = Duration::from_millis(ms);
        }
        out
    }

    /// No initial throttling and no periodic pause; only the bucket and the window cap.
    pub fn unthrottled(calls_per_minute: u32) -> Self {
        Self {
            window_budget: calls_per_minute.max(1),
            initial_tokens: calls_per_minute.max(1) as f64,
            pause_every: 0,
            pause: Duration::ZERO,
            ..Self::new(calls_per_minute)
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CALLS_PER_MINUTE)
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
    admitted: u64,
    recent: VecDeque<Instant>,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = config.calls_per_minute as f64;
        let state = BucketState {
            tokens: config.initial_tokens.min(capacity),
            last_refill: Instant::now(),
            blocked_until: None,
            admitted: 0,
            recent: VecDeque::with_capacity(config.window_budget as usize),
        };
        Self {
            refill_per_sec: capacity / WINDOW.as_secs_f64(),
            config,
            state: Mutex::new(state),
        }
    }

    /// Waits until one call may be issued. Never fails.
    pub async fn acquire(&self) {
        loop {
            match self.try_admit(Instant::now()) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Stalls every caller for `retry_after` after an upstream 429. The first caller after the
    /// deadline is admitted immediately; refill resumes from there.
    pub fn on_quota_rejected(&self, retry_after: Duration) {
        let now = Instant::now();
        let mut state = self.lock();
        let until = match state.blocked_until {
            Some(existing) if existing > now + retry_after => existing,
            _ => now + retry_after,
        };
        state.blocked_until = Some(until);
        state.tokens = 1.0;
        state.last_refill = until;
        tracing::warn!(
            retry_after_ms = retry_after.as_millis() as u64,
            "quota rejected upstream; stalling all callers"
        );
    }

    pub fn admitted(&self) -> u64 {
        self.lock().admitted
    }

    fn try_admit(&self, now: Instant) -> Result<(), Duration> {
        let mut state = self.lock();

        if let Some(until) = state.blocked_until {
            if now < until {
                return Err(until - now);
            }
            state.blocked_until = None;
        }

        self.refill(&mut state, now);

        while let Some(front) = state.recent.front().copied() {
            if now.duration_since(front) >= WINDOW {
                state.recent.pop_front();
            } else {
                break;
            }
        }
        if state.recent.len() >= self.config.window_budget as usize {
            if let Some(oldest) = state.recent.front().copied() {
                return Err(oldest + WINDOW - now);
            }
        }

        if state.tokens < 1.0 {
            let missing = 1.0 - state.tokens;
            return Err(Duration::from_secs_f64(missing / self.refill_per_sec));
        }

        state.tokens -= 1.0;
        state.recent.push_back(now);
        state.admitted += 1;

        let every = self.config.pause_every;
        if every != 0 && !self.config.pause.is_zero() && state.admitted % every == 0 {
            state.blocked_until = Some(now + self.config.pause);
            tracing::debug!(
                admitted = state.admitted,
                pause_ms = self.config.pause.as_millis() as u64,
                "periodic rate-limit pause"
            );
        }

        Ok(())
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        // last_refill may sit in the future while a quota stall is pending.
        if now <= state.last_refill {
            return;
        }
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        let capacity = self.config.calls_per_minute as f64;
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(capacity);
        state.last_refill = now;
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        // Counters stay consistent even if a holder panicked; every update is a single step.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn max_in_any_window(times: &[Instant]) -> usize {
        let mut sorted = times.to_vec();
        sorted.sort();
        let mut best = 0;
        for (i, start) in sorted.iter().enumerate() {
            let n = sorted[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < WINDOW)
                .count();
            best = best.max(n);
        }
        best
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_exceed_capacity_per_window() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::unthrottled(60)));
        let admitted = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            let admitted = admitted.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    limiter.acquire().await;
                    admitted.lock().unwrap().push(Instant::now());
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let times = admitted.lock().unwrap().clone();
        assert_eq!(times.len(), 200);
        assert_eq!(limiter.admitted(), 200);
        assert!(max_in_any_window(&times) <= 60);
    }

    #[tokio::test(start_paused = true)]
    async fn default_budget_stays_under_capacity() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            pause_every: 0,
            ..RateLimitConfig::new(60)
        }));
        let mut times = Vec::new();
        for _ in 0..120 {
            limiter.acquire().await;
            times.push(Instant::now());
        }
        assert!(max_in_any_window(&times) <= 55);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_rejection_stalls_then_resumes_immediately() {
        let limiter = RateLimiter::new(RateLimitConfig::unthrottled(60));
        limiter.acquire().await;
        limiter.acquire().await;

        let rejected_at = Instant::now();
        limiter.on_quota_rejected(Duration::from_secs(30));

        limiter.acquire().await;
        let waited = rejected_at.elapsed();
        assert!(waited >= Duration::from_secs(30), "waited {waited:?}");
        assert!(waited < Duration::from_secs(30) + Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn quota_rejection_blocks_concurrent_callers() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::unthrottled(60)));
        let rejected_at = Instant::now();
        limiter.on_quota_rejected(Duration::from_secs(10));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            tasks.push(tokio::spawn(async move {
                limiter.acquire().await;
                Instant::now()
            }));
        }
        for t in tasks {
            let at = t.await.unwrap();
            assert!(at.duration_since(rejected_at) >= Duration::from_secs(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_pause_applies_even_with_tokens_left() {
        let limiter = RateLimiter::new(RateLimitConfig {
            pause_every: 3,
            pause: Duration::from_secs(2),
            ..RateLimitConfig::unthrottled(60)
        });
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(10));
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[test]
    fn defaults_follow_capacity() {
        let c = RateLimitConfig::new(60);
        assert_eq!(c.window_budget, 55);
        assert_eq!(c.initial_tokens, 10.0);
        let small = RateLimitConfig::new(6);
        assert_eq!(small.initial_tokens, 1.0);
    }
}
