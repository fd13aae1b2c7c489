// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Default)]
pub struct BackendCounters {
    pub forwards: u64,
    pub errors: u64,
    pub rate_limited: u64,
}

/// Process-wide counters, served in text exposition format on the metrics
/// listener. Plain atomics; increments sit on hot paths.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    pub requests_total: AtomicU64,
    pub calls_total: AtomicU64,
    pub cache_hits_total: AtomicU64,
    pub cache_misses_total: AtomicU64,
    pub cache_shared_total: AtomicU64,
    pub rate_limited_total: AtomicU64,
    pub sender_rate_limited_total: AtomicU64,
    pub unauthorized_total: AtomicU64,
    pub redis_degraded_total: AtomicU64,
    pub ws_connections_total: AtomicU64,
    backends: Mutex<HashMap<String, BackendCounters>>,
}

impl ProxyMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forward(&self, backend: &str, errored: bool) {
        let mut backends = self.backends.lock().expect("metrics mutex poisoned");
        let counters = backends.entry(backend.to_string()).or_default();
        counters.forwards = counters.forwards.saturating_add(1);
        if errored {
            counters.errors = counters.errors.saturating_add(1);
        }
    }

    pub fn record_backend_rate_limited(&self, backend: &str) {
        let mut backends = self.backends.lock().expect("metrics mutex poisoned");
        let counters = backends.entry(backend.to_string()).or_default();
        counters.rate_limited = counters.rate_limited.saturating_add(1);
    }

    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            requests: self.requests_total.load(Ordering::Relaxed),
            calls: self.calls_total.load(Ordering::Relaxed),
            cache_hits: self.cache_hits_total.load(Ordering::Relaxed),
            cache_misses: self.cache_misses_total.load(Ordering::Relaxed),
            cache_shared: self.cache_shared_total.load(Ordering::Relaxed),
            rate_limited: self.rate_limited_total.load(Ordering::Relaxed),
            sender_rate_limited: self.sender_rate_limited_total.load(Ordering::Relaxed),
            unauthorized: self.unauthorized_total.load(Ordering::Relaxed),
            redis_degraded: self.redis_degraded_total.load(Ordering::Relaxed),
            ws_connections: self.ws_connections_total.load(Ordering::Relaxed),
        }
    }

    /// Point-in-time error count for one backend, for diagnostics.
    pub fn backend_errors(&self, backend: &str) -> u64 {
        self.backends
            .lock()
            .expect("metrics mutex poisoned")
            .get(backend)
            .map(|counters| counters.errors)
            .unwrap_or(0)
    }

    /// Text exposition of all counters.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let globals = [
            ("proxy_requests_total", &self.requests_total),
            ("proxy_calls_total", &self.calls_total),
            ("proxy_cache_hits_total", &self.cache_hits_total),
            ("proxy_cache_misses_total", &self.cache_misses_total),
            ("proxy_cache_shared_total", &self.cache_shared_total),
            ("proxy_rate_limited_total", &self.rate_limited_total),
            (
                "proxy_sender_rate_limited_total",
                &self.sender_rate_limited_total,
            ),
            ("proxy_unauthorized_total", &self.unauthorized_total),
            ("proxy_redis_degraded_total", &self.redis_degraded_total),
            ("proxy_ws_connections_total", &self.ws_connections_total),
        ];
        for (name, counter) in globals {
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", counter.load(Ordering::Relaxed));
        }

        let backends = self.backends.lock().expect("metrics mutex poisoned");
        let mut names: Vec<_> = backends.keys().collect();
        names.sort();
        let _ = writeln!(out, "# TYPE proxy_backend_forwards_total counter");
        let _ = writeln!(out, "# TYPE proxy_backend_errors_total counter");
        let _ = writeln!(out, "# TYPE proxy_backend_rate_limited_total counter");
        for name in names {
            let counters = &backends[name];
            let _ = writeln!(
                out,
                "proxy_backend_forwards_total{{backend=\"{name}\"}} {}",
                counters.forwards
            );
            let _ = writeln!(
                out,
                "proxy_backend_errors_total{{backend=\"{name}\"}} {}",
                counters.errors
            );
            let _ = writeln!(
                out,
                "proxy_backend_rate_limited_total{{backend=\"{name}\"}} {}",
                counters.rate_limited
            );
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CounterSnapshot {
    requests: u64,
    calls: u64,
    cache_hits: u64,
    cache_misses: u64,
    cache_shared: u64,
    rate_limited: u64,
    sender_rate_limited: u64,
    unauthorized: u64,
    redis_degraded: u64,
    ws_connections: u64,
}

impl CounterSnapshot {
    fn delta(self, earlier: Self) -> Self {
        Self {
            requests: self.requests.saturating_sub(earlier.requests),
            calls: self.calls.saturating_sub(earlier.calls),
            cache_hits: self.cache_hits.saturating_sub(earlier.cache_hits),
            cache_misses: self.cache_misses.saturating_sub(earlier.cache_misses),
            cache_shared: self.cache_shared.saturating_sub(earlier.cache_shared),
            rate_limited: self.rate_limited.saturating_sub(earlier.rate_limited),
            sender_rate_limited: self
                .sender_rate_limited
                .saturating_sub(earlier.sender_rate_limited),
            unauthorized: self.unauthorized.saturating_sub(earlier.unauthorized),
            redis_degraded: self.redis_degraded.saturating_sub(earlier.redis_degraded),
            ws_connections: self.ws_connections.saturating_sub(earlier.ws_connections),
        }
    }

    fn is_idle(&self) -> bool {
        *self == Self::default()
    }

    fn log(&self, window: Duration) {
        info!(
            window_ms = window.as_millis() as u64,
            requests = self.requests,
            calls = self.calls,
            cache_hits = self.cache_hits,
            cache_misses = self.cache_misses,
            cache_shared = self.cache_shared,
            rate_limited = self.rate_limited,
            sender_rate_limited = self.sender_rate_limited,
            unauthorized = self.unauthorized,
            redis_degraded = self.redis_degraded,
            ws_connections = self.ws_connections,
            "proxy metrics window"
        );
    }
}

/// Periodically logs per-window counter deltas through tracing, alongside
/// the pull-based exposition listener. Quiet windows are skipped.
pub struct MetricsReporter {
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl MetricsReporter {
    pub fn start(metrics: Arc<ProxyMetrics>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let task_stop = Arc::clone(&stop);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; take the baseline there.
            ticker.tick().await;
            let mut last = metrics.snapshot();
            while !task_stop.load(Ordering::Relaxed) {
                ticker.tick().await;
                let current = metrics.snapshot();
                let delta = current.delta(last);
                if !delta.is_idle() {
                    delta.log(interval);
                }
                last = current;
            }
        });
        Self {
            stop,
            task: Some(task),
        }
    }

    /// Idempotent; the reporter task exits at its next tick.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for MetricsReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Standalone metrics listener.
pub async fn serve(addr: SocketAddr, metrics: Arc<ProxyMetrics>) -> std::io::Result<()> {
    let render = move || {
        let metrics = Arc::clone(&metrics);
        async move { metrics.render() }
    };
    let app = Router::new()
        .route("/", get(render.clone()))
        .route("/metrics", get(render));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "metrics listener up");
    axum::serve(listener, app)
        .await
        .map_err(std::io::Error::other)
}
