// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use super::Cache;
use crate::client::{ChainClient, ChainClientError};

pub const KEY_BLOCK_NUMBER: &str = "lvc:block_number";
pub const KEY_GAS_PRICE: &str = "lvc:gas_price";

type UpdateFn = Box<
    dyn Fn(Arc<ChainClient>) -> Pin<Box<dyn Future<Output = Result<u64, ChainClientError>> + Send>>
        + Send
        + Sync,
>;

/// Periodically refreshes one named scalar from the chain client into the
/// shared cache. Reads never block on the updater; they see whatever value
/// landed last.
pub struct LastValueCache {
    key: &'static str,
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl LastValueCache {
    pub fn start(
        key: &'static str,
        interval: Duration,
        client: Arc<ChainClient>,
        cache: Arc<Cache>,
        update: UpdateFn,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let task_stop = Arc::clone(&stop);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while !task_stop.load(Ordering::Relaxed) {
                ticker.tick().await;
                match update(Arc::clone(&client)).await {
                    Ok(value) => {
                        let encoded = value.to_string();
                        if let Err(err) = cache.put(key, encoded.as_bytes()).await {
                            warn!(key, error = %err, "last value cache write failed");
                        }
                    }
                    Err(err) => {
                        warn!(key, error = %err, "last value cache update failed");
                    }
                }
            }
        });
        Self {
            key,
            stop,
            task: Some(task),
        }
    }

    pub fn start_block_number(
        interval: Duration,
        client: Arc<ChainClient>,
        cache: Arc<Cache>,
    ) -> Self {
        Self::start(
            KEY_BLOCK_NUMBER,
            interval,
            client,
            cache,
            Box::new(|client| Box::pin(async move { client.block_number().await })),
        )
    }

    pub fn start_gas_price(interval: Duration, client: Arc<ChainClient>, cache: Arc<Cache>) -> Self {
        Self::start(
            KEY_GAS_PRICE,
            interval,
            client,
            cache,
            Box::new(|client| Box::pin(async move { client.gas_price().await })),
        )
    }

    pub fn reader(&self, cache: Arc<Cache>) -> LastValueReader {
        LastValueReader {
            key: self.key,
            cache,
        }
    }

    /// Idempotent; the refresh task exits at its next tick.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for LastValueCache {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Non-blocking read handle for one cached scalar.
#[derive(Clone)]
pub struct LastValueReader {
    key: &'static str,
    cache: Arc<Cache>,
}

impl LastValueReader {
    /// The last stored value, or `None` when no refresh has landed yet or
    /// the stored bytes are unreadable.
    pub async fn read(&self) -> Option<u64> {
        let bytes = match self.cache.get(self.key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                warn!(key = self.key, error = %err, "last value cache read failed");
                return None;
            }
        };
        std::str::from_utf8(&bytes).ok()?.parse().ok()
    }

    /// Test-only seam for fixing the observed chain tip.
    #[cfg(test)]
    pub(crate) async fn seed(&self, value: u64) {
        self.cache
            .put(self.key, value.to_string().as_bytes())
            .await
            .expect("seed last value");
    }

    #[cfg(test)]
    pub(crate) fn fixed(cache: Arc<Cache>, key: &'static str) -> Self {
        Self { key, cache }
    }
}
