//! Fixed-window rate limiter keyed by `(procedure, identity, window_index)`.
//!
//! Deliberately not a probabilistic sketch (e.g. a count-min structure):
//! a sketch can under- or over-count under hash collisions, which breaks
//! the exactness rate limiting needs here (the `(N+1)`-th call in a window
//! must always be rejected). This is a small exact counter instead, backed
//! by `dashmap` locally and by `redis` pipelined INCR/EXPIRE when a
//! cluster-wide store is configured.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use redis::aio::ConnectionManager as RedisConnectionManager;

const SWEEP_INTERVAL_SECS: i64 = 60;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitExceeded {
    pub retry_after: u64,
}

struct LocalCounter {
    hits: u64,
    window_ends_at: i64,
}

/// Exact fixed-window counter. One instance is shared (via `Arc`) across
/// every session on the node; `check` is the only entry point.
pub struct Limiter {
    local: DashMap<String, LocalCounter>,
    redis: Option<RedisConnectionManager>,
    last_sweep: AtomicI64,
}

impl Limiter {
    pub fn new(redis: Option<RedisConnectionManager>) -> Arc<Self> {
        Arc::new(Self { local: DashMap::new(), redis, last_sweep: AtomicI64::new(now_secs()) })
    }

    /// `identity` should be `u:<user_id>` or `ip:<addr>` — prefixing by
    /// kind means a user id and an IP address never silently collide.
    pub async fn check(
        &self,
        procedure_name: &str,
        identity: &str,
        max_requests: u64,
        window_seconds: u64,
    ) -> Result<(), RateLimitExceeded> {
        let now = now_secs();
        let window_seconds = window_seconds.max(1) as i64;
        let window_index = now.div_euclid(window_seconds);
        let window_end = (window_index + 1) * window_seconds;
        let key = format!("ephaptic:rl:{procedure_name}:{identity}:{window_index}");

        let hits = if let Some(redis) = &self.redis {
            self.check_redis(redis.clone(), &key, window_seconds).await
        } else {
            self.check_local(&key, window_end, now)
        };

        if hits > max_requests {
            let retry_after = (window_end - now).max(1) as u64;
            return Err(RateLimitExceeded { retry_after });
        }
        Ok(())
    }

    async fn check_redis(&self, mut conn: RedisConnectionManager, key: &str, window_seconds: i64) -> u64 {
        let (hits,): (u64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .expire(key, window_seconds + 1)
            .ignore()
            .query_async(&mut conn)
            .await
            .unwrap_or((1,));
        hits
    }

    fn check_local(&self, key: &str, window_end: i64, now: i64) -> u64 {
        self.maybe_sweep(now);

        let mut entry = self.local.entry(key.to_string()).or_insert(LocalCounter { hits: 0, window_ends_at: window_end });
        entry.hits += 1;
        entry.hits
    }

    fn maybe_sweep(&self, now: i64) {
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now - last < SWEEP_INTERVAL_SECS {
            return;
        }
        if self
            .last_sweep
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        self.local.retain(|_, counter| counter.window_ends_at >= now);
    }
}

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs() as i64
}

/// Identity precedence for rate limiting: logged-in user id, else remote
/// IP, else a single shared anonymous bucket per procedure (documented
/// edge case — two anonymous callers behind the same limiter share a
/// budget only when neither identity is known at all).
pub fn rate_limit_identity(user_id: Option<&str>, remote_addr: Option<&str>) -> String {
    match (user_id, remote_addr) {
        (Some(uid), _) => format!("u:{uid}"),
        (None, Some(addr)) => format!("ip:{addr}"),
        (None, None) => "anonymous".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nth_plus_one_call_is_always_rejected() {
        let limiter = Limiter::new(None);
        for _ in 0..3 {
            limiter.check("spam_me", "u:alice", 3, 60).await.unwrap();
        }
        let err = limiter.check("spam_me", "u:alice", 3, 60).await.unwrap_err();
        assert!(err.retry_after >= 1 && err.retry_after <= 60);
    }

    #[tokio::test]
    async fn distinct_identities_have_independent_budgets() {
        let limiter = Limiter::new(None);
        limiter.check("spam_me", "u:alice", 1, 60).await.unwrap();
        limiter.check("spam_me", "u:bob", 1, 60).await.unwrap();
        assert!(limiter.check("spam_me", "u:alice", 1, 60).await.is_err());
    }

    #[test]
    fn identity_precedence_prefers_user_then_ip() {
        assert_eq!(rate_limit_identity(Some("user123"), Some("1.2.3.4")), "u:user123");
        assert_eq!(rate_limit_identity(None, Some("1.2.3.4")), "ip:1.2.3.4");
        assert_eq!(rate_limit_identity(None, None), "anonymous");
    }
}
