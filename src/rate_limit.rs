//! Sliding-window rate limiting for the model API.
//!
//! The provider enforces three independent quotas: requests per minute,
//! input tokens per minute and requests per day. The limiter tracks all
//! three and tells callers how long to pause before a request of a given
//! size may go out. Minute quotas are scaled by a safety factor so the
//! token estimator's slack never pushes a request over the real limit;
//! the daily quota is a hard stop.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::VersioningConfig;
use crate::error::{Error, Result};

const WINDOW: Duration = Duration::from_secs(60);
const SAFETY_FACTOR: f64 = 0.9;

/// Tracks request/token usage against provider quotas.
pub struct RateLimiter {
    rpm_safe: u32,
    tpm_safe: u64,
    rpd_limit: u32,
    requests_minute: VecDeque<Instant>,
    tokens_minute: VecDeque<(Instant, u64)>,
    requests_today: u32,
}

impl RateLimiter {
    pub fn new(rpm_limit: u32, tpm_limit: u64, rpd_limit: u32) -> Self {
        Self {
            rpm_safe: (f64::from(rpm_limit) * SAFETY_FACTOR) as u32,
            tpm_safe: (tpm_limit as f64 * SAFETY_FACTOR) as u64,
            rpd_limit,
            requests_minute: VecDeque::new(),
            tokens_minute: VecDeque::new(),
            requests_today: 0,
        }
    }

    pub fn from_config(cfg: &VersioningConfig) -> Self {
        Self::new(cfg.rpm_limit, cfg.tpm_limit, cfg.rpd_limit)
    }

    /// Requests recorded since the limiter was created.
    pub fn requests_today(&self) -> u32 {
        self.requests_today
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.requests_minute.front() {
            if now.duration_since(*front) >= WINDOW {
                self.requests_minute.pop_front();
            } else {
                break;
            }
        }
        while let Some((front, _)) = self.tokens_minute.front() {
            if now.duration_since(*front) >= WINDOW {
                self.tokens_minute.pop_front();
            } else {
                break;
            }
        }
    }

    fn tokens_in_window(&self) -> u64 {
        self.tokens_minute.iter().map(|(_, t)| t).sum()
    }

    /// Decides whether a request of `tokens` may proceed at `now`.
    ///
    /// `Ok(None)` means go; `Ok(Some(wait))` means pause at least `wait` and
    /// plan again; `Err` means the daily quota is gone and the run must stop.
    pub fn plan(&mut self, tokens: u64, now: Instant) -> Result<Option<Duration>> {
        self.prune(now);

        if self.requests_today >= self.rpd_limit {
            return Err(Error::DailyLimitReached(self.rpd_limit));
        }
        if self.requests_today + 5 >= self.rpd_limit {
            warn!(
                used = self.requests_today,
                limit = self.rpd_limit,
                "Approaching daily request limit"
            );
        }

        if self.requests_minute.len() >= self.rpm_safe as usize {
            let oldest = *self.requests_minute.front().expect("non-empty window");
            return Ok(Some(WINDOW.saturating_sub(now.duration_since(oldest))));
        }

        if self.tokens_in_window() + tokens > self.tpm_safe {
            if let Some((oldest, _)) = self.tokens_minute.front() {
                return Ok(Some(WINDOW.saturating_sub(now.duration_since(*oldest))));
            }
            // Window is empty and the request alone exceeds the budget:
            // let it through, the provider is the final arbiter.
        }

        Ok(None)
    }

    /// Records a request that was actually sent.
    pub fn record(&mut self, tokens: u64, now: Instant) {
        self.requests_minute.push_back(now);
        self.tokens_minute.push_back((now, tokens));
        self.requests_today += 1;
    }

    /// Waits until a request of `tokens` fits the quotas, then records it.
    pub async fn admit(&mut self, tokens: u64) -> Result<()> {
        loop {
            match self.plan(tokens, Instant::now())? {
                None => {
                    self.record(tokens, Instant::now());
                    return Ok(());
                }
                Some(wait) => {
                    info!(
                        wait_secs = wait.as_secs_f64(),
                        tokens, "Rate limit window full, pausing"
                    );
                    // One extra second so the oldest entry is truly expired.
                    tokio::time::sleep(wait + Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_until_rpm_window_fills() {
        let mut limiter = RateLimiter::new(10, 1_000_000, 100);
        let t0 = Instant::now();
        // safety factor of 0.9 leaves 9 request slots
        for _ in 0..9 {
            assert!(limiter.plan(100, t0).unwrap().is_none());
            limiter.record(100, t0);
        }
        let wait = limiter.plan(100, t0).unwrap();
        assert!(wait.is_some());
    }

    #[test]
    fn rpm_window_slides() {
        let mut limiter = RateLimiter::new(10, 1_000_000, 100);
        let t0 = Instant::now();
        for _ in 0..9 {
            limiter.record(100, t0);
        }
        let later = t0 + Duration::from_secs(61);
        assert!(limiter.plan(100, later).unwrap().is_none());
    }

    #[test]
    fn tpm_budget_blocks_large_requests() {
        let mut limiter = RateLimiter::new(100, 1000, 100);
        let t0 = Instant::now();
        // tpm_safe = 900
        limiter.record(800, t0);
        assert!(limiter.plan(200, t0).unwrap().is_some());
        assert!(limiter.plan(50, t0).unwrap().is_none());
    }

    #[test]
    fn oversized_single_request_passes_empty_window() {
        let mut limiter = RateLimiter::new(100, 1000, 100);
        let t0 = Instant::now();
        assert!(limiter.plan(5000, t0).unwrap().is_none());
    }

    #[test]
    fn daily_quota_is_a_hard_stop() {
        let mut limiter = RateLimiter::new(1000, 1_000_000, 3);
        let t0 = Instant::now();
        for _ in 0..3 {
            limiter.record(1, t0);
        }
        assert!(matches!(
            limiter.plan(1, t0),
            Err(Error::DailyLimitReached(3))
        ));
    }
}
