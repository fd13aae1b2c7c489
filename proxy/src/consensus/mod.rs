// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

use futures_util::future::join_all;
use rpc_core::block::parse_quantity;
use rpc_core::jsonrpc::{CallId, RpcCall, RpcResponse};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::group::BackendGroup;
use crate::backend::{Backend, ForwardError, Health};

/// One backend's last reported view of the chain.
#[derive(Debug, Clone)]
pub struct ConsensusObservation {
    pub latest: u64,
    pub safe: u64,
    pub finalized: u64,
    pub peer_count: u64,
    pub observed_at: SystemTime,
}

#[derive(Debug, Clone, Copy)]
pub struct ConsensusConfig {
    pub interval: Duration,
    pub ban_period: Duration,
    /// Consecutive failed polls before a backend is banned from the set.
    pub max_update_threshold: u32,
    pub max_block_lag: u64,
    pub min_peer_count: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            ban_period: Duration::from_secs(300),
            max_update_threshold: 3,
            max_block_lag: 8,
            min_peer_count: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgreedBlocks {
    pub latest: u64,
    pub safe: u64,
    pub finalized: u64,
}

/// One round's full output. Published wholesale so readers never see a
/// torn mix of old set and new heights.
#[derive(Debug, Clone, Default)]
pub struct ConsensusSnapshot {
    pub initialized: bool,
    pub set: Vec<String>,
    pub agreed: AgreedBlocks,
}

/// Consensus state holder owned by the group. The poller writes through
/// `publish`; the router reads copies through `snapshot`.
pub struct Consensus {
    config: ConsensusConfig,
    snapshot: RwLock<Arc<ConsensusSnapshot>>,
}

impl Consensus {
    pub fn new(config: ConsensusConfig) -> Self {
        Self {
            config,
            snapshot: RwLock::new(Arc::new(ConsensusSnapshot::default())),
        }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Arc<ConsensusSnapshot> {
        Arc::clone(&self.snapshot.read().expect("consensus snapshot poisoned"))
    }

    pub(crate) fn publish(&self, snapshot: ConsensusSnapshot) {
        let mut slot = self.snapshot.write().expect("consensus snapshot poisoned");
        *slot = Arc::new(snapshot);
    }
}

/// Receives membership churn after each round that changes the consensus
/// set. Implementations must not block; the poller calls this inline.
pub trait AsyncHandler: Send + Sync {
    fn on_consensus_change(&self, group: &str, added: &[String], removed: &[String]);
}

pub struct NoopAsyncHandler;

impl AsyncHandler for NoopAsyncHandler {
    fn on_consensus_change(&self, _group: &str, _added: &[String], _removed: &[String]) {}
}

#[derive(Debug, Clone, Default)]
pub struct ConsensusStop {
    shutdown: Arc<AtomicBool>,
}

impl ConsensusStop {
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct BanState {
    consecutive_errors: u32,
    banned_until: Option<Instant>,
}

/// Per-group poller: refreshes every backend's chain view on a fixed
/// interval, bans flapping backends, and publishes the agreed heights and
/// routable subset. The poller borrows the group; the group outlives it.
pub struct ConsensusPoller {
    group: Arc<BackendGroup>,
    handler: Arc<dyn AsyncHandler>,
    stop: ConsensusStop,
}

impl ConsensusPoller {
    pub fn new(group: Arc<BackendGroup>, handler: Arc<dyn AsyncHandler>) -> Self {
        Self {
            group,
            handler,
            stop: ConsensusStop::default(),
        }
    }

    pub fn spawn(self) -> (JoinHandle<()>, ConsensusStop) {
        let stop = self.stop.clone();
        let handle = tokio::spawn(self.run());
        (handle, stop)
    }

    async fn run(self) {
        let interval = match self.group.consensus() {
            Some(consensus) => consensus.config().interval,
            None => {
                warn!(group = %self.group.name, "poller started for non-consensus group");
                return;
            }
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut bans: HashMap<String, BanState> = HashMap::new();

        while !self.stop.is_shutdown_requested() {
            ticker.tick().await;
            self.poll_round(&mut bans).await;
        }
    }

    async fn poll_round(&self, bans: &mut HashMap<String, BanState>) {
        let Some(consensus) = self.group.consensus() else {
            return;
        };
        let config = *consensus.config();
        let now = Instant::now();

        let polls = self
            .group
            .backends()
            .iter()
            .map(|backend| async move { (Arc::clone(backend), poll_backend(backend).await) });
        for (backend, outcome) in join_all(polls).await {
            let state = bans.entry(backend.name().to_string()).or_default();
            match outcome {
                Ok(observation) => {
                    state.consecutive_errors = 0;
                    backend.set_observation(observation);
                }
                Err(err) => {
                    state.consecutive_errors = state.consecutive_errors.saturating_add(1);
                    if state.consecutive_errors >= config.max_update_threshold
                        && state.banned_until.is_none()
                    {
                        state.banned_until = Some(now + config.ban_period);
                        info!(
                            group = %self.group.name,
                            backend = %backend.name(),
                            "backend banned from consensus set"
                        );
                    }
                    warn!(
                        group = %self.group.name,
                        backend = %backend.name(),
                        error = %err,
                        "consensus poll failed"
                    );
                }
            }
        }

        // Lift expired bans so recovered backends get polled back in.
        for state in bans.values_mut() {
            if matches!(state.banned_until, Some(until) if until <= now) {
                state.banned_until = None;
                state.consecutive_errors = 0;
            }
        }

        let banned: HashSet<String> = bans
            .iter()
            .filter(|(_, state)| matches!(state.banned_until, Some(until) if until > now))
            .map(|(name, _)| name.clone())
            .collect();

        let previous = consensus.snapshot();
        let snapshot = compute_snapshot(self.group.backends(), &banned, &config);
        let (added, removed) = diff_membership(&previous.set, &snapshot.set);
        consensus.publish(snapshot);
        if previous.initialized && (!added.is_empty() || !removed.is_empty()) {
            self.handler
                .on_consensus_change(&self.group.name, &added, &removed);
        }
    }
}

/// Queries one backend's latest/safe/finalized heads and peer count in a
/// single fused batch.
async fn poll_backend(backend: &Arc<Backend>) -> Result<ConsensusObservation, ForwardError> {
    let calls = vec![
        block_call(1, "latest"),
        block_call(2, "safe"),
        block_call(3, "finalized"),
        RpcCall::new(CallId::Number(4), "net_peerCount", Some(json!([]))),
    ];
    let responses = backend.forward(&calls, false, None).await?;

    let latest = block_number_of(&responses, 1).ok_or_else(|| ForwardError::Malformed {
        reason: "latest block observation is unusable".to_string(),
    })?;
    // Chains without safe/finalized support answer null; treat as height 0
    // so the clamp keeps them below latest.
    let safe = block_number_of(&responses, 2).unwrap_or(0);
    let finalized = block_number_of(&responses, 3).unwrap_or(0);
    let peer_count = find_result(&responses, 4)
        .and_then(|value| value.as_str().map(str::to_string))
        .and_then(|text| parse_quantity(&text).ok())
        .unwrap_or(0);

    Ok(ConsensusObservation {
        latest,
        safe,
        finalized,
        peer_count,
        observed_at: SystemTime::now(),
    })
}

fn block_call(id: i64, tag: &str) -> RpcCall {
    RpcCall::new(
        CallId::Number(id),
        "eth_getBlockByNumber",
        Some(json!([tag, false])),
    )
}

fn find_result(responses: &[RpcResponse], id: i64) -> Option<&serde_json::Value> {
    responses
        .iter()
        .find(|response| response.id == CallId::Number(id))
        .and_then(|response| response.result.as_ref())
}

fn block_number_of(responses: &[RpcResponse], id: i64) -> Option<u64> {
    let number = find_result(responses, id)?.get("number")?.as_str()?;
    parse_quantity(number).ok()
}

/// Highest height that at least half the reporters have reached: sort
/// descending and take index ceil(n/2)-1. Never advances the agreed tip
/// past what that many backends have already seen.
fn majority_height(mut values: Vec<u64>) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable_by(|a, b| b.cmp(a));
    Some(values[values.len().div_ceil(2) - 1])
}

/// Derives the agreed heights and routable subset from the non-banned
/// backends' observations. Pure; the poller task is the only writer of its
/// inputs.
pub(crate) fn compute_snapshot(
    backends: &[Arc<Backend>],
    banned: &HashSet<String>,
    config: &ConsensusConfig,
) -> ConsensusSnapshot {
    let observed: Vec<(&Arc<Backend>, ConsensusObservation)> = backends
        .iter()
        .filter(|backend| !banned.contains(backend.name()))
        .filter_map(|backend| backend.observation().map(|obs| (backend, obs)))
        .collect();

    let Some(latest) = majority_height(observed.iter().map(|(_, obs)| obs.latest).collect()) else {
        return ConsensusSnapshot {
            initialized: true,
            set: Vec::new(),
            agreed: AgreedBlocks::default(),
        };
    };
    let safe = majority_height(observed.iter().map(|(_, obs)| obs.safe).collect())
        .unwrap_or(0)
        .min(latest);
    let finalized = majority_height(observed.iter().map(|(_, obs)| obs.finalized).collect())
        .unwrap_or(0)
        .min(safe);

    let set = observed
        .iter()
        .filter(|(backend, obs)| {
            let in_lag = latest.saturating_sub(obs.latest) > config.max_block_lag;
            let enough_peers = backend.config.skip_peer_count_check
                || obs.peer_count >= config.min_peer_count;
            !in_lag && enough_peers && backend.health() != Health::OutOfService
        })
        .map(|(backend, _)| backend.name().to_string())
        .collect();

    ConsensusSnapshot {
        initialized: true,
        set,
        agreed: AgreedBlocks {
            latest,
            safe,
            finalized,
        },
    }
}

fn diff_membership(previous: &[String], current: &[String]) -> (Vec<String>, Vec<String>) {
    let added = current
        .iter()
        .filter(|name| !previous.contains(name))
        .cloned()
        .collect();
    let removed = previous
        .iter()
        .filter(|name| !current.contains(name))
        .cloned()
        .collect();
    (added, removed)
}
