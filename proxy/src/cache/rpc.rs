// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rpc_core::block::BlockRef;
use rpc_core::error::RpcError;
use rpc_core::jsonrpc::{RpcCall, RpcResponse};
use rpc_core::method::{self, CachePolicy};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use super::{Cache, LastValueReader};

#[derive(Debug, Clone, Copy)]
pub struct RpcCacheConfig {
    /// How deep under the chain tip a block-keyed result must be buried
    /// before the cache may serve it.
    pub num_block_confirmations: u64,
    pub entry_ttl: Duration,
}

impl Default for RpcCacheConfig {
    fn default() -> Self {
        Self {
            num_block_confirmations: 0,
            entry_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
    /// Coalesced onto another caller's in-flight upstream fetch.
    Shared,
    /// Method or params are not cacheable; the call went straight upstream.
    Bypass,
}

type FlightResult = Result<Value, RpcError>;

/// Clears a registered flight if the leader never completes it. Dropping
/// the parked senders wakes every waiter with a recv error.
struct FlightGuard<'a> {
    inflight: &'a Mutex<HashMap<String, Vec<oneshot::Sender<FlightResult>>>>,
    key: &'a str,
    armed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.remove(self.key);
        }
    }
}

/// Memoizes cacheable RPC results keyed on method+params, with block
/// confirmation gating and single-flight miss coalescing.
///
/// Callers must rewrite chain-tip tags to numeric values before lookup;
/// a call still carrying `latest`/`safe`/`finalized` bypasses the cache.
pub struct RpcCache {
    cache: Arc<Cache>,
    latest_block: LastValueReader,
    config: RpcCacheConfig,
    inflight: Mutex<HashMap<String, Vec<oneshot::Sender<FlightResult>>>>,
}

impl RpcCache {
    pub fn new(cache: Arc<Cache>, latest_block: LastValueReader, config: RpcCacheConfig) -> Self {
        Self {
            cache,
            latest_block,
            config,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Key and referenced height for a call, or `None` when the call must
    /// not be cached.
    fn storable(call: &RpcCall) -> Option<(String, Option<u64>)> {
        match method::cache_policy(&call.method) {
            CachePolicy::Never => None,
            CachePolicy::Static => Some((method::cache_key(call), None)),
            CachePolicy::BlockKeyed { .. } => match method::block_ref(call) {
                Some(BlockRef::Number(height)) => Some((method::cache_key(call), Some(height))),
                // Unrewritten tags, hashes and EIP-1898 objects are
                // forwarded uncached.
                _ => None,
            },
        }
    }

    async fn confirmed(&self, height: Option<u64>) -> bool {
        let Some(height) = height else {
            return true;
        };
        match self.latest_block.read().await {
            Some(latest) => latest.saturating_sub(height) >= self.config.num_block_confirmations,
            // No tip observation yet: cannot prove depth, do not serve.
            None => false,
        }
    }

    /// Cache lookup for one call. Returns the memoized response only when
    /// the call is cacheable and its referenced height is confirmed.
    pub async fn get_rpc(&self, call: &RpcCall) -> Option<RpcResponse> {
        let (key, height) = Self::storable(call)?;
        if !self.confirmed(height).await {
            return None;
        }
        let bytes = match self.cache.get(&key).await {
            Ok(found) => found?,
            Err(err) => {
                warn!(method = %call.method, error = %err, "rpc cache read degraded to miss");
                return None;
            }
        };
        let result: Value = serde_json::from_slice(&bytes).ok()?;
        Some(RpcResponse::result(call.id.clone(), result))
    }

    /// Stores a successful response for later hits. Error responses and
    /// null results (blocks not yet visible everywhere) are never stored.
    pub async fn put_rpc(&self, call: &RpcCall, response: &RpcResponse) {
        let Some((key, _)) = Self::storable(call) else {
            return;
        };
        let Some(result) = &response.result else {
            return;
        };
        if result.is_null() {
            return;
        }
        let bytes = match serde_json::to_vec(result) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        if let Err(err) = self.cache.set_ex(&key, &bytes, self.config.entry_ttl).await {
            warn!(method = %call.method, error = %err, "rpc cache write failed");
        }
    }

    /// Serves the call from cache or forwards it, coalescing concurrent
    /// misses for the same key onto a single upstream fetch.
    pub async fn get_or_forward<F, Fut>(&self, call: &RpcCall, forward: F) -> (RpcResponse, CacheOutcome)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RpcResponse, RpcError>>,
    {
        let Some((key, _)) = Self::storable(call) else {
            let response = match forward().await {
                Ok(response) => response,
                Err(err) => RpcResponse::error(call.id.clone(), err),
            };
            return (response, CacheOutcome::Bypass);
        };

        if let Some(hit) = self.get_rpc(call).await {
            return (hit, CacheOutcome::Hit);
        }

        // Join an existing flight if one is up; otherwise register as the
        // leader. The map lock never spans the upstream call.
        let waiter = {
            let mut inflight = self.inflight.lock().expect("inflight mutex poisoned");
            match inflight.get_mut(&key) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    inflight.insert(key.clone(), Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return match rx.await {
                Ok(Ok(result)) => (
                    RpcResponse::result(call.id.clone(), result),
                    CacheOutcome::Shared,
                ),
                Ok(Err(err)) => (RpcResponse::error(call.id.clone(), err), CacheOutcome::Shared),
                // Leader dropped mid-flight (request cancelled); answer
                // with a transient error rather than re-dialing upstream.
                Err(_) => (
                    RpcResponse::error(
                        call.id.clone(),
                        RpcError::internal("coalesced upstream fetch was cancelled"),
                    ),
                    CacheOutcome::Shared,
                ),
            };
        }

        // If this future is dropped mid-fetch (client cancelled), the guard
        // clears the flight so parked waiters fail fast instead of waiting
        // out the request timeout.
        let mut guard = FlightGuard {
            inflight: &self.inflight,
            key: &key,
            armed: true,
        };

        let outcome = forward().await;
        let flight_result: FlightResult = match &outcome {
            Ok(response) => match (&response.result, &response.error) {
                (Some(result), None) => Ok(result.clone()),
                (_, Some(err)) => Err(err.clone()),
                (None, None) => Err(RpcError::internal("upstream returned empty response")),
            },
            Err(err) => Err(err.clone()),
        };

        if let Ok(response) = &outcome {
            if !response.is_error() {
                self.put_rpc(call, response).await;
            }
        }

        let waiters = {
            let mut inflight = self.inflight.lock().expect("inflight mutex poisoned");
            inflight.remove(&key).unwrap_or_default()
        };
        guard.armed = false;
        for tx in waiters {
            let _ = tx.send(flight_result.clone());
        }

        let response = match outcome {
            Ok(response) => response,
            Err(err) => RpcResponse::error(call.id.clone(), err),
        };
        (response, CacheOutcome::Miss)
    }

    #[cfg(test)]
    fn inflight_len(&self) -> usize {
        self.inflight.lock().expect("inflight mutex poisoned").len()
    }

    #[cfg(test)]
    fn inflight_waiters(&self) -> usize {
        self.inflight
            .lock()
            .expect("inflight mutex poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }
}
