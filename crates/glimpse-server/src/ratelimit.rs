//! Per-identity rate limiting with fixed-window counters.
//!
//! Every network-facing operation class carries its own limit. Entries are
//! swept on a timer decoupled from request volume, so bursty-then-idle
//! traffic cannot leave stale counters resident indefinitely.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

/// Operation classes with independently configured limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    /// Administrative operations (reset, stats, audit).
    Admin,
    /// Public visitor operations (admission check, progress, termination).
    Public,
    /// Signal ingestion.
    Ingest,
    /// Feed polling — intentionally the tightest limit, to resist scraping.
    Feed,
}

impl OpClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Public => "public",
            Self::Ingest => "ingest",
            Self::Feed => "feed",
        }
    }
}

/// Requests allowed per window, per operation class.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub admin: u32,
    pub public: u32,
    pub ingest: u32,
    pub feed: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            admin: 10,
            public: 60,
            ingest: 100,
            feed: 30,
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, PartialEq)]
pub enum RateDecision {
    Allowed,
    Exceeded { retry_after_secs: u64 },
}

struct Entry {
    count: u32,
    window_reset_at: Instant,
}

/// In-memory fixed-window rate limiter keyed by `(class, identity)`.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    limits: RateLimits,
    window: Duration,
    entries: DashMap<(OpClass, String), Entry>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits, window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                limits,
                window,
                entries: DashMap::new(),
            }),
        }
    }

    fn limit_for(&self, class: OpClass) -> u32 {
        match class {
            OpClass::Admin => self.inner.limits.admin,
            OpClass::Public => self.inner.limits.public,
            OpClass::Ingest => self.inner.limits.ingest,
            OpClass::Feed => self.inner.limits.feed,
        }
    }

    /// Count one request. Exactly `limit` requests pass per window; the
    /// next is rejected with the seconds remaining until the window resets.
    /// An entry past its reset instant is treated as absent whether or not
    /// the sweep has purged it yet.
    pub fn check(&self, class: OpClass, identity: &str) -> RateDecision {
        let now = Instant::now();
        let mut entry = self
            .inner
            .entries
            .entry((class, identity.to_owned()))
            .or_insert_with(|| Entry {
                count: 0,
                window_reset_at: now + self.inner.window,
            });

        if now >= entry.window_reset_at {
            // Logically expired — roll a fresh window.
            entry.count = 1;
            entry.window_reset_at = now + self.inner.window;
            return RateDecision::Allowed;
        }

        entry.count += 1;
        if entry.count > self.limit_for(class) {
            let retry_after_secs = entry
                .window_reset_at
                .saturating_duration_since(now)
                .as_secs()
                .max(1);
            return RateDecision::Exceeded { retry_after_secs };
        }
        RateDecision::Allowed
    }

    /// Purge expired entries. Called by the periodic sweep, not by `check`,
    /// so an idle period still releases memory.
    pub fn sweep(&self) {
        let now = Instant::now();
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, e| now < e.window_reset_at);
        let removed = before - self.inner.entries.len();
        if removed > 0 {
            debug!(removed, "swept expired rate-limit entries");
        }
    }

    /// Number of resident entries (expired-but-unswept included).
    pub fn entry_count(&self) -> usize {
        self.inner.entries.len()
    }

    /// Spawn a background task that sweeps expired entries every `interval`.
    /// The handle can be aborted at shutdown.
    pub fn spawn_sweep(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(window: Duration) -> RateLimiter {
        RateLimiter::new(
            RateLimits {
                admin: 2,
                public: 5,
                ingest: 100,
                feed: 3,
            },
            window,
        )
    }

    #[test]
    fn exactly_limit_requests_pass() {
        let rl = limiter(Duration::from_secs(60));
        for _ in 0..5 {
            assert_eq!(rl.check(OpClass::Public, "1.2.3.4"), RateDecision::Allowed);
        }
        match rl.check(OpClass::Public, "1.2.3.4") {
            RateDecision::Exceeded { retry_after_secs } => {
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
            }
            RateDecision::Allowed => panic!("request over the limit was allowed"),
        }
    }

    #[test]
    fn window_expiry_allows_again() {
        let rl = limiter(Duration::from_millis(40));
        for _ in 0..5 {
            assert_eq!(rl.check(OpClass::Public, "1.2.3.4"), RateDecision::Allowed);
        }
        assert!(matches!(
            rl.check(OpClass::Public, "1.2.3.4"),
            RateDecision::Exceeded { .. }
        ));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(rl.check(OpClass::Public, "1.2.3.4"), RateDecision::Allowed);
    }

    #[test]
    fn classes_count_independently() {
        let rl = limiter(Duration::from_secs(60));
        assert_eq!(rl.check(OpClass::Admin, "1.2.3.4"), RateDecision::Allowed);
        assert_eq!(rl.check(OpClass::Admin, "1.2.3.4"), RateDecision::Allowed);
        assert!(matches!(
            rl.check(OpClass::Admin, "1.2.3.4"),
            RateDecision::Exceeded { .. }
        ));
        // The same identity is untouched under another class.
        assert_eq!(rl.check(OpClass::Feed, "1.2.3.4"), RateDecision::Allowed);
    }

    #[test]
    fn identities_count_independently() {
        let rl = limiter(Duration::from_secs(60));
        for _ in 0..3 {
            assert_eq!(rl.check(OpClass::Feed, "1.1.1.1"), RateDecision::Allowed);
        }
        assert!(matches!(
            rl.check(OpClass::Feed, "1.1.1.1"),
            RateDecision::Exceeded { .. }
        ));
        assert_eq!(rl.check(OpClass::Feed, "2.2.2.2"), RateDecision::Allowed);
    }

    #[test]
    fn sweep_releases_expired_entries() {
        let rl = limiter(Duration::from_millis(20));
        rl.check(OpClass::Public, "1.1.1.1");
        rl.check(OpClass::Public, "2.2.2.2");
        assert_eq!(rl.entry_count(), 2);

        std::thread::sleep(Duration::from_millis(40));
        rl.sweep();
        assert_eq!(rl.entry_count(), 0);
    }

    #[tokio::test]
    async fn background_sweep_runs_and_aborts() {
        let rl = limiter(Duration::from_millis(10));
        rl.check(OpClass::Public, "1.1.1.1");

        let handle = rl.clone().spawn_sweep(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(rl.entry_count(), 0);

        handle.abort();
    }
}
