// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Process-global, minimum-interval rate limiter for upstream calls.
//!
//! Every caller that wants to hit the upstream API awaits [`RateLimiter::wait`]
//! on a shared [`RateLimiter`] first. Waiters queue FIFO on the limiter's
//! ticket mutex, so no two `wait` calls can return less than the configured
//! floor apart. The floor itself lives in an `AtomicU64` so
//! [`RateLimiter::configure`] never has to queue behind in-flight waiters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Shared, clonable handle to a minimum-interval gate.
///
/// Cloning a [`RateLimiter`] shares the same underlying state — clone it
/// freely across tasks instead of wrapping it in an `Arc` yourself.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    floor_ms: Arc<AtomicU64>,
    ticket_queue: Arc<Mutex<()>>,
    last_release: Arc<Mutex<Option<Instant>>>,
}

impl RateLimiter {
    /// Construct a limiter with no floor: the first `configure` call sets
    /// it, and until then `wait` never sleeps.
    #[must_use]
    pub fn new() -> Self {
        Self {
            floor_ms: Arc::new(AtomicU64::new(0)),
            ticket_queue: Arc::new(Mutex::new(())),
            last_release: Arc::new(Mutex::new(None)),
        }
    }

    /// Construct a limiter with an initial floor, in milliseconds.
    #[must_use]
    pub fn with_min_interval_ms(min_interval_ms: u64) -> Self {
        let limiter = Self::new();
        limiter.floor_ms.store(min_interval_ms, Ordering::SeqCst);
        limiter
    }

    /// Raise the minimum interval floor, in milliseconds.
    ///
    /// Monotonic: a call with a value smaller than the current floor is a
    /// no-op. There is no way to lower the floor once raised — the rate
    /// limiter only ever gets stricter for the life of the process.
    pub fn configure(&self, min_interval_ms: Option<u64>) {
        let Some(candidate) = min_interval_ms else {
            return;
        };
        self.floor_ms.fetch_max(candidate, Ordering::SeqCst);
    }

    /// The current floor, in milliseconds.
    #[must_use]
    pub fn min_interval_ms(&self) -> u64 {
        self.floor_ms.load(Ordering::SeqCst)
    }

    /// Block until at least the current floor has elapsed since the last
    /// successful `wait`, then record this call's release time.
    ///
    /// Callers are served strictly FIFO: whoever calls `wait` first is
    /// released first, regardless of how the floor changes while they
    /// queue.
    pub async fn wait(&self) {
        let _ticket = self.ticket_queue.lock().await;
        let min_interval = Duration::from_millis(self.min_interval_ms());
        let mut last_release = self.last_release.lock().await;
        if let Some(last) = *last_release {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                tokio::time::sleep(min_interval - elapsed).await;
            }
        }
        *last_release = Some(Instant::now());
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test(start_paused = true)]
    async fn first_wait_does_not_sleep() {
        let limiter = RateLimiter::with_min_interval_ms(100);
        let started = Instant::now();
        limiter.wait().await;
        assert_eq!(started.elapsed(), StdDuration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn second_wait_sleeps_for_the_remaining_interval() {
        let limiter = RateLimiter::with_min_interval_ms(500);
        limiter.wait().await;
        tokio::time::advance(StdDuration::from_millis(100)).await;
        let started = Instant::now();
        limiter.wait().await;
        assert_eq!(started.elapsed(), StdDuration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_after_interval_elapsed_does_not_sleep() {
        let limiter = RateLimiter::with_min_interval_ms(100);
        limiter.wait().await;
        tokio::time::advance(StdDuration::from_millis(200)).await;
        let started = Instant::now();
        limiter.wait().await;
        assert_eq!(started.elapsed(), StdDuration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfigured_limiter_never_sleeps() {
        let limiter = RateLimiter::new();
        limiter.wait().await;
        let started = Instant::now();
        limiter.wait().await;
        assert_eq!(started.elapsed(), StdDuration::ZERO);
    }

    #[test]
    fn configure_is_monotonic() {
        let limiter = RateLimiter::with_min_interval_ms(500);
        limiter.configure(Some(100));
        assert_eq!(limiter.min_interval_ms(), 500, "smaller floor must be a no-op");
        limiter.configure(Some(1000));
        assert_eq!(limiter.min_interval_ms(), 1000);
    }

    #[test]
    fn configure_with_none_is_a_no_op() {
        let limiter = RateLimiter::with_min_interval_ms(500);
        limiter.configure(None);
        assert_eq!(limiter.min_interval_ms(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn configure_raising_floor_mid_flight_applies_to_the_next_wait() {
        let limiter = RateLimiter::with_min_interval_ms(100);
        limiter.wait().await;
        limiter.configure(Some(1000));
        let started = Instant::now();
        limiter.wait().await;
        assert_eq!(started.elapsed(), StdDuration::from_secs(1));
    }

    #[tokio::test]
    async fn concurrent_waiters_are_serialized() {
        let limiter = RateLimiter::with_min_interval_ms(1);
        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.wait().await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
