// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;

use futures_util::future::join_all;
use rpc_core::block::{format_quantity, BlockRef};
use rpc_core::error::RpcError;
use rpc_core::jsonrpc::{chunk_calls, order_responses, RpcCall, RpcResponse};
use rpc_core::method;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Backend, ForwardError, Health};
use crate::consensus::{AgreedBlocks, Consensus, ConsensusConfig};
use crate::limiter::BackendRateLimiter;
use crate::metrics::ProxyMetrics;
use crate::server::error::ErrorMessages;

/// Ordered set of interchangeable backends serving one chain.
///
/// The group owns routing, retry-to-next-backend, and upstream batch
/// splitting. When consensus-aware, routing is restricted to the poller's
/// current consensus set and chain-tip tags are rewritten to the agreed
/// numeric heights so every backend answers the same question.
pub struct BackendGroup {
    pub name: String,
    backends: Vec<Arc<Backend>>,
    consensus: Option<Consensus>,
    max_upstream_batch_size: usize,
    limiter: Arc<BackendRateLimiter>,
    metrics: Arc<ProxyMetrics>,
    messages: Arc<ErrorMessages>,
}

impl BackendGroup {
    pub fn new(
        name: String,
        backends: Vec<Arc<Backend>>,
        consensus_config: Option<ConsensusConfig>,
        max_upstream_batch_size: usize,
        limiter: Arc<BackendRateLimiter>,
        metrics: Arc<ProxyMetrics>,
        messages: Arc<ErrorMessages>,
    ) -> Self {
        Self {
            name,
            backends,
            consensus: consensus_config.map(Consensus::new),
            max_upstream_batch_size,
            limiter,
            metrics,
            messages,
        }
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn consensus(&self) -> Option<&Consensus> {
        self.consensus.as_ref()
    }

    pub fn is_consensus_aware(&self) -> bool {
        self.consensus.is_some()
    }

    /// Agreed chain heads, once the poller has published a round.
    pub fn agreed(&self) -> Option<AgreedBlocks> {
        let consensus = self.consensus.as_ref()?;
        let snapshot = consensus.snapshot();
        snapshot.initialized.then(|| snapshot.agreed.clone())
    }

    /// Backends currently worth offering, in configured order.
    fn eligible(&self) -> Vec<Arc<Backend>> {
        if let Some(consensus) = &self.consensus {
            let snapshot = consensus.snapshot();
            // Until the first poll round lands there is no consensus view;
            // falling back to plain health keeps a cold start routable.
            if snapshot.initialized {
                return self
                    .backends
                    .iter()
                    .filter(|backend| snapshot.set.iter().any(|name| name.as_str() == backend.name()))
                    .cloned()
                    .collect();
            }
        }
        self.backends
            .iter()
            .filter(|backend| backend.health() != Health::OutOfService)
            .cloned()
            .collect()
    }

    /// Rewrites `latest`/`safe`/`finalized` params to the agreed numeric
    /// heights. Numeric params pass through untouched, so the rewrite is
    /// idempotent. Without an agreed view only `fallback_latest` (the
    /// block-sync tip) rewrites `latest`.
    pub fn rewrite_block_tags(&self, calls: &mut [RpcCall], fallback_latest: Option<u64>) {
        let agreed = self.agreed();
        for call in calls.iter_mut() {
            let Some(index) = method::cache_policy(&call.method).block_param_index() else {
                continue;
            };
            let Some(reference) = call.param(index).and_then(BlockRef::from_param) else {
                continue;
            };
            let height = match (&reference, &agreed) {
                (BlockRef::Latest, Some(agreed)) => Some(agreed.latest),
                (BlockRef::Safe, Some(agreed)) => Some(agreed.safe),
                (BlockRef::Finalized, Some(agreed)) => Some(agreed.finalized),
                (BlockRef::Latest, None) => fallback_latest,
                _ => None,
            };
            if let Some(height) = height {
                call.set_param(index, Value::String(format_quantity(height)));
            }
        }
    }

    /// Forwards the batch to the first usable backend, moving down the
    /// configured order on transport-class failures until one answers or
    /// the list runs out.
    pub async fn forward(
        &self,
        mut calls: Vec<RpcCall>,
        single: bool,
        xff: Option<&str>,
    ) -> Result<Vec<RpcResponse>, RpcError> {
        if self.is_consensus_aware() {
            self.rewrite_block_tags(&mut calls, None);
        }

        let eligible = self.eligible();
        if eligible.is_empty() {
            return Err(RpcError::no_backends());
        }

        let mut last_error: Option<ForwardError> = None;
        for backend in &eligible {
            if !self
                .limiter
                .inc_backend_rps(backend.name(), backend.config.max_rps)
                .await
            {
                self.metrics.record_backend_rate_limited(backend.name());
                debug!(group = %self.name, backend = %backend.name(), "backend over rps, skipping");
                last_error = Some(ForwardError::OverCapacity);
                continue;
            }

            match self.forward_to(backend, &calls, single, xff).await {
                Ok(responses) => {
                    self.metrics.record_forward(backend.name(), false);
                    return Ok(order_responses(&calls, responses));
                }
                Err(err) => {
                    self.metrics.record_forward(backend.name(), true);
                    warn!(
                        group = %self.name,
                        backend = %backend.name(),
                        error = %err,
                        "forward failed, trying next backend"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(match last_error {
            // Every usable backend was skipped at its rps budget: that is
            // the client-facing rate-limit condition, not a proxy fault.
            Some(ForwardError::OverCapacity) => {
                ProxyMetrics::inc(&self.metrics.rate_limited_total);
                self.messages.over_rate_limit()
            }
            Some(err) => RpcError::internal(format!("all backends failed: {err}")),
            None => RpcError::no_backends(),
        })
    }

    /// One attempt against one backend. Oversized batches are split into
    /// chunks raced concurrently against the same backend; the caller
    /// restores client order by id afterwards.
    async fn forward_to(
        &self,
        backend: &Arc<Backend>,
        calls: &[RpcCall],
        single: bool,
        xff: Option<&str>,
    ) -> Result<Vec<RpcResponse>, ForwardError> {
        let chunks = chunk_calls(calls, self.max_upstream_batch_size);
        if chunks.len() == 1 {
            return backend.forward(calls, single, xff).await;
        }

        let forwards = chunks
            .into_iter()
            .map(|chunk| backend.forward(chunk, false, xff));
        let mut responses = Vec::with_capacity(calls.len());
        for outcome in join_all(forwards).await {
            responses.extend(outcome?);
        }
        Ok(responses)
    }

    /// First eligible backend that can take another WebSocket client.
    pub async fn ws_backend(&self) -> Option<Arc<Backend>> {
        for backend in self.eligible() {
            if backend.config.ws_url.is_none() {
                continue;
            }
            if self
                .limiter
                .inc_ws_conns(backend.name(), backend.config.max_ws_conns)
                .await
            {
                return Some(backend);
            }
        }
        None
    }

    pub fn limiter(&self) -> &Arc<BackendRateLimiter> {
        &self.limiter
    }
}
