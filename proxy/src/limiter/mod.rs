// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use alloy_primitives::Address;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tracing::warn;

use crate::metrics::ProxyMetrics;

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("redis rate limit check failed")]
    Redis {
        #[source]
        source: redis::RedisError,
    },
}

// INCR the window key and attach its TTL on first touch, in one server-side
// step so concurrent proxies cannot race the expiry.
const INCR_WITH_TTL: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u64,
}

#[derive(Default)]
struct LocalBuckets {
    windows: Mutex<HashMap<String, Window>>,
    // WS connection counts live outside the windows map: they have no
    // expiry and must survive the window pruning pass.
    conns: Mutex<HashMap<String, u64>>,
}

impl LocalBuckets {
    /// Counts one hit against `key` within a fixed `interval` window and
    /// reports whether the count stayed at or under `limit`.
    fn incr_within(&self, key: &str, limit: u64, interval: Duration) -> bool {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .expect("rate limit windows mutex poisoned");

        // Opportunistic pruning keeps one-shot keys (sender addresses) from
        // accumulating forever.
        if windows.len() > 4096 {
            windows.retain(|_, w| now.duration_since(w.started) < interval);
        }

        let window = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(window.started) >= interval {
            window.started = now;
            window.count = 0;
        }
        window.count = window.count.saturating_add(1);
        window.count <= limit
    }
}

struct RedisBuckets {
    conn: ConnectionManager,
    script: redis::Script,
    metrics: Arc<ProxyMetrics>,
}

impl RedisBuckets {
    fn new(conn: ConnectionManager, metrics: Arc<ProxyMetrics>) -> Self {
        Self {
            conn,
            script: redis::Script::new(INCR_WITH_TTL),
            metrics,
        }
    }

    async fn incr_within(
        &self,
        key: &str,
        limit: u64,
        interval: Duration,
    ) -> Result<bool, LimiterError> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .script
            .key(key)
            .arg(interval.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|source| LimiterError::Redis { source })?;
        Ok(count <= limit)
    }
}

enum Buckets {
    Local(LocalBuckets),
    Redis(RedisBuckets),
}

/// Per-backend request-rate and WebSocket-connection accounting.
///
/// The local flavor keeps in-process windows on a monotonic clock; the Redis
/// flavor shares windows between proxy instances with one atomic server-side
/// op per check. The noop flavor always admits.
pub struct BackendRateLimiter {
    buckets: Option<Buckets>,
}

impl BackendRateLimiter {
    pub fn noop() -> Self {
        Self { buckets: None }
    }

    pub fn local() -> Self {
        Self {
            buckets: Some(Buckets::Local(LocalBuckets::default())),
        }
    }

    pub fn redis(conn: ConnectionManager, metrics: Arc<ProxyMetrics>) -> Self {
        Self {
            buckets: Some(Buckets::Redis(RedisBuckets::new(conn, metrics))),
        }
    }

    /// Counts one forward against the backend's RPS budget.
    ///
    /// A Redis outage fails open: the backend keeps serving and the caller
    /// records the degradation. `max_rps == 0` means unlimited.
    pub async fn inc_backend_rps(&self, backend: &str, max_rps: u64) -> bool {
        if max_rps == 0 {
            return true;
        }
        match &self.buckets {
            None => true,
            Some(Buckets::Local(local)) => local.incr_within(
                &format!("backend_rps:{backend}"),
                max_rps,
                Duration::from_secs(1),
            ),
            Some(Buckets::Redis(redis)) => {
                let key = format!("rate_limit:backend_rps:{backend}");
                match redis
                    .incr_within(&key, max_rps, Duration::from_secs(1))
                    .await
                {
                    Ok(ok) => ok,
                    Err(err) => {
                        warn!(backend, error = %err, "backend rps check degraded to allow");
                        ProxyMetrics::inc(&redis.metrics.redis_degraded_total);
                        true
                    }
                }
            }
        }
    }

    /// Takes one WebSocket connection slot for the backend, if available.
    /// `max_conns == 0` means unlimited.
    pub async fn inc_ws_conns(&self, backend: &str, max_conns: u64) -> bool {
        match &self.buckets {
            None => true,
            Some(Buckets::Local(local)) => {
                let mut conns = local.conns.lock().expect("ws conns mutex poisoned");
                let count = conns.entry(backend.to_string()).or_insert(0);
                if max_conns > 0 && *count >= max_conns {
                    return false;
                }
                *count = count.saturating_add(1);
                true
            }
            Some(Buckets::Redis(redis)) => {
                let mut conn = redis.conn.clone();
                let key = format!("rate_limit:ws_conns:{backend}");
                let count: Result<u64, _> = redis::cmd("INCR").arg(&key).query_async(&mut conn).await;
                match count {
                    Ok(count) if max_conns > 0 && count > max_conns => {
                        let _: Result<u64, _> =
                            redis::cmd("DECR").arg(&key).query_async(&mut conn).await;
                        false
                    }
                    Ok(_) => true,
                    Err(err) => {
                        warn!(backend, error = %err, "ws conn check degraded to allow");
                        ProxyMetrics::inc(&redis.metrics.redis_degraded_total);
                        true
                    }
                }
            }
        }
    }

    /// Releases one WebSocket connection slot for the backend.
    pub async fn dec_ws_conns(&self, backend: &str) {
        match &self.buckets {
            None => {}
            Some(Buckets::Local(local)) => {
                let mut conns = local.conns.lock().expect("ws conns mutex poisoned");
                if let Some(count) = conns.get_mut(backend) {
                    *count = count.saturating_sub(1);
                }
            }
            Some(Buckets::Redis(redis)) => {
                let mut conn = redis.conn.clone();
                let key = format!("rate_limit:ws_conns:{backend}");
                let result: Result<i64, _> =
                    redis::cmd("DECR").arg(&key).query_async(&mut conn).await;
                if let Err(err) = result {
                    warn!(backend, error = %err, "failed to release ws conn slot");
                }
            }
        }
    }

    /// Zeroes the WebSocket connection counters for the named backends.
    /// Called on shutdown so restarts do not inherit stale counts.
    pub async fn flush_backend_ws_conns(&self, backends: &[String]) -> Result<(), LimiterError> {
        match &self.buckets {
            None => Ok(()),
            Some(Buckets::Local(local)) => {
                let mut conns = local.conns.lock().expect("ws conns mutex poisoned");
                for backend in backends {
                    conns.remove(backend);
                }
                Ok(())
            }
            Some(Buckets::Redis(redis)) => {
                let mut conn = redis.conn.clone();
                for backend in backends {
                    let key = format!("rate_limit:ws_conns:{backend}");
                    let _: u64 = redis::cmd("DEL")
                        .arg(&key)
                        .query_async(&mut conn)
                        .await
                        .map_err(|source| LimiterError::Redis { source })?;
                }
                Ok(())
            }
        }
    }
}

/// Caps submission calls per recovered sender address over a fixed interval.
///
/// Unlike the backend limiter this one fails closed on a Redis outage:
/// admitting unmetered raw sends would let a sender bypass the cap entirely.
pub struct SenderRateLimiter {
    limit: u64,
    interval: Duration,
    buckets: Buckets,
}

impl SenderRateLimiter {
    pub fn local(limit: u64, interval: Duration) -> Self {
        Self {
            limit,
            interval,
            buckets: Buckets::Local(LocalBuckets::default()),
        }
    }

    pub fn redis(
        limit: u64,
        interval: Duration,
        conn: ConnectionManager,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            limit,
            interval,
            buckets: Buckets::Redis(RedisBuckets::new(conn, metrics)),
        }
    }

    pub async fn inc_sender(&self, sender: Address) -> Result<bool, LimiterError> {
        let key = format!("rate_limit:sender:{sender}");
        match &self.buckets {
            Buckets::Local(local) => Ok(local.incr_within(&key, self.limit, self.interval)),
            Buckets::Redis(redis) => redis.incr_within(&key, self.limit, self.interval).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BackendRateLimiter, LocalBuckets, SenderRateLimiter};
    use alloy_primitives::Address;
    use std::time::Duration;

    #[test]
    fn local_window_admits_up_to_limit() {
        let buckets = LocalBuckets::default();
        for _ in 0..5 {
            assert!(buckets.incr_within("k", 5, Duration::from_secs(60)));
        }
        assert!(!buckets.incr_within("k", 5, Duration::from_secs(60)));
    }

    #[test]
    fn local_window_resets_after_interval() {
        let buckets = LocalBuckets::default();
        assert!(buckets.incr_within("k", 1, Duration::from_millis(20)));
        assert!(!buckets.incr_within("k", 1, Duration::from_millis(20)));
        std::thread::sleep(Duration::from_millis(25));
        assert!(buckets.incr_within("k", 1, Duration::from_millis(20)));
    }

    #[test]
    fn keys_are_independent() {
        let buckets = LocalBuckets::default();
        assert!(buckets.incr_within("a", 1, Duration::from_secs(60)));
        assert!(!buckets.incr_within("a", 1, Duration::from_secs(60)));
        assert!(buckets.incr_within("b", 1, Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn noop_limiter_always_admits() {
        let limiter = BackendRateLimiter::noop();
        for _ in 0..100 {
            assert!(limiter.inc_backend_rps("any", 1).await);
        }
    }

    #[tokio::test]
    async fn zero_rps_means_unlimited() {
        let limiter = BackendRateLimiter::local();
        for _ in 0..100 {
            assert!(limiter.inc_backend_rps("b", 0).await);
        }
    }

    #[tokio::test]
    async fn ws_conn_slots_release_on_dec() {
        let limiter = BackendRateLimiter::local();
        assert!(limiter.inc_ws_conns("b", 1).await);
        assert!(!limiter.inc_ws_conns("b", 1).await);
        limiter.dec_ws_conns("b").await;
        assert!(limiter.inc_ws_conns("b", 1).await);
    }

    #[tokio::test]
    async fn flush_zeroes_ws_conns() {
        let limiter = BackendRateLimiter::local();
        assert!(limiter.inc_ws_conns("b", 1).await);
        limiter
            .flush_backend_ws_conns(&["b".to_string()])
            .await
            .expect("flush ws conns");
        assert!(limiter.inc_ws_conns("b", 1).await);
    }

    #[tokio::test]
    async fn sender_limit_rejects_the_sixth_call_in_interval() {
        let limiter = SenderRateLimiter::local(5, Duration::from_secs(1));
        let sender = Address::from_slice(&[0x11; 20]);
        for _ in 0..5 {
            assert!(limiter.inc_sender(sender).await.expect("local never errs"));
        }
        assert!(!limiter.inc_sender(sender).await.expect("local never errs"));
    }
}
