//! Login/2FA/reset rate limiting.
//!
//! Three independent limiters share the same sliding-counter policy:
//! `max_failures` within `window` locks the key for `lock` and the error
//! advertises the remaining seconds. A success resets the key. Entries
//! idle for 24 hours are pruned. State is in-memory behind a single mutex;
//! limits reset on process restart, which is acceptable for a lockout
//! mechanism.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::types::{DrawbridgeError, Result};

/// Default failure window (10 minutes).
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(600);

/// Default failure budget inside the window.
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// Default lockout duration (15 minutes).
pub const DEFAULT_LOCK: Duration = Duration::from_secs(900);

/// Entries idle this long are pruned (24 hours).
const PRUNE_AFTER: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone)]
struct Counter {
    failures: u32,
    window_start: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
    last_activity: DateTime<Utc>,
}

/// Policy parameters for one limiter.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub max_failures: u32,
    pub lock: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_failures: DEFAULT_MAX_FAILURES,
            lock: DEFAULT_LOCK,
        }
    }
}

/// One keyed sliding-counter limiter.
pub struct RateLimiter {
    /// What this limiter protects; used in lockout logs.
    scope: &'static str,
    policy: RateLimitPolicy,
    counters: Mutex<HashMap<String, Counter>>,
}

impl RateLimiter {
    pub fn new(scope: &'static str, policy: RateLimitPolicy) -> Self {
        Self {
            scope,
            policy,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether an attempt for `key` may proceed.
    ///
    /// Must be called before any credential work so a locked caller learns
    /// nothing about the account.
    pub fn check(&self, key: &str) -> Result<()> {
        let now = Utc::now();
        let counters = self.counters.lock().expect("rate limiter lock poisoned");
        if let Some(counter) = counters.get(key) {
            if let Some(until) = counter.locked_until {
                if now < until {
                    let remaining_seconds = (until - now).num_seconds().max(1) as u64;
                    return Err(DrawbridgeError::RateLimited { remaining_seconds });
                }
            }
        }
        Ok(())
    }

    /// Record a failed attempt, locking the key when the budget is spent.
    pub fn record_failure(&self, key: &str) {
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.policy.window).expect("window fits");
        let mut counters = self.counters.lock().expect("rate limiter lock poisoned");

        let counter = counters.entry(key.to_string()).or_insert(Counter {
            failures: 0,
            window_start: now,
            locked_until: None,
            last_activity: now,
        });

        // A lapsed lock or window starts a fresh count.
        let lock_lapsed = counter.locked_until.is_some_and(|until| now >= until);
        if lock_lapsed || now - counter.window_start > window {
            counter.failures = 0;
            counter.window_start = now;
            counter.locked_until = None;
        }

        counter.failures += 1;
        counter.last_activity = now;

        if counter.failures >= self.policy.max_failures {
            let lock = chrono::Duration::from_std(self.policy.lock).expect("lock fits");
            counter.locked_until = Some(now + lock);
            warn!(
                scope = self.scope,
                key = %key,
                failures = counter.failures,
                "Rate limit lockout"
            );
        }
    }

    /// Record a success, resetting the key's counter.
    pub fn record_success(&self, key: &str) {
        let mut counters = self.counters.lock().expect("rate limiter lock poisoned");
        counters.remove(key);
    }

    /// Drop entries idle for more than 24 hours.
    pub fn prune(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(PRUNE_AFTER).expect("prune window fits");
        let mut counters = self.counters.lock().expect("rate limiter lock poisoned");
        let before = counters.len();
        counters.retain(|_, c| c.last_activity > cutoff);
        before - counters.len()
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.counters.lock().unwrap().len()
    }
}

/// The three limiters of the auth surface.
pub struct RateLimiters {
    /// Keyed `client_ip|username`
    pub login: RateLimiter,
    /// Keyed by user id
    pub totp: RateLimiter,
    /// Keyed by username
    pub reset: RateLimiter,
}

impl RateLimiters {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            login: RateLimiter::new("login", policy.clone()),
            totp: RateLimiter::new("totp-verify", policy.clone()),
            reset: RateLimiter::new("reset-code-verify", policy),
        }
    }

    /// Composite key for the login limiter.
    pub fn login_key(client_ip: &str, username: &str) -> String {
        format!("{client_ip}|{username}")
    }

    /// Prune all three maps; called by the app's periodic sweeper.
    pub fn prune(&self) -> usize {
        self.login.prune() + self.totp.prune() + self.reset.prune()
    }
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::new(RateLimitPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(
            "test",
            RateLimitPolicy {
                window: Duration::from_secs(60),
                max_failures: 3,
                lock: Duration::from_secs(60),
            },
        )
    }

    #[test]
    fn test_allows_until_budget_spent() {
        let rl = limiter();
        let key = "203.0.113.1|alice";

        for _ in 0..2 {
            assert!(rl.check(key).is_ok());
            rl.record_failure(key);
        }
        assert!(rl.check(key).is_ok());
        rl.record_failure(key);

        // Third failure locks.
        let err = rl.check(key).unwrap_err();
        match err {
            DrawbridgeError::RateLimited { remaining_seconds } => {
                assert!(remaining_seconds >= 1);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn test_success_resets_counter() {
        let rl = limiter();
        let key = "203.0.113.1|alice";

        rl.record_failure(key);
        rl.record_failure(key);
        rl.record_success(key);

        for _ in 0..2 {
            rl.record_failure(key);
        }
        // Two failures after the reset: still under budget.
        assert!(rl.check(key).is_ok());
    }

    #[test]
    fn test_keys_are_independent() {
        let rl = limiter();
        for _ in 0..3 {
            rl.record_failure("ip-1|alice");
        }
        assert!(rl.check("ip-1|alice").is_err());
        assert!(rl.check("ip-2|alice").is_ok());
        assert!(rl.check("ip-1|bob").is_ok());
    }

    #[test]
    fn test_prune_removes_idle_entries() {
        let rl = limiter();
        rl.record_failure("old-key");

        {
            let mut counters = rl.counters.lock().unwrap();
            counters.get_mut("old-key").unwrap().last_activity =
                Utc::now() - chrono::Duration::hours(25);
        }

        assert_eq!(rl.prune(), 1);
        assert_eq!(rl.entry_count(), 0);
    }

    #[test]
    fn test_lock_expires() {
        let rl = RateLimiter::new(
            "test",
            RateLimitPolicy {
                window: Duration::from_secs(60),
                max_failures: 1,
                lock: Duration::from_millis(30),
            },
        );
        rl.record_failure("key");
        assert!(rl.check("key").is_err());

        std::thread::sleep(Duration::from_millis(50));
        assert!(rl.check("key").is_ok());
    }

    #[test]
    fn test_login_key_format() {
        assert_eq!(RateLimiters::login_key("203.0.113.1", "alice"), "203.0.113.1|alice");
    }
}
