// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

pub mod error;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::body::Bytes;
use axum::{Json, Router};
use futures_util::future::join_all;
use rpc_core::error::RpcError;
use rpc_core::jsonrpc::{CallId, Payload, RpcCall, RpcResponse};
use rpc_core::method;
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::backend::group::BackendGroup;
use crate::backend::ws::proxy_ws;
use crate::cache::{CacheOutcome, LastValueReader, RpcCache};
use crate::limiter::SenderRateLimiter;
use crate::metrics::ProxyMetrics;
use crate::router::{MethodRouter, RouteError};
use crate::sender::recover_sender;

pub use error::ErrorMessages;

const AUTH_HEADER: &str = "x-api-key";

/// Everything a request needs, wired once at startup.
pub struct ProxyState {
    pub router: Arc<MethodRouter>,
    pub rpc_cache: Option<Arc<RpcCache>>,
    /// Block-sync tip, the tag-rewrite fallback for non-consensus groups.
    pub latest_block: Option<LastValueReader>,
    pub sender_limiter: Option<SenderRateLimiter>,
    pub concurrency: Option<(Arc<Semaphore>, u32)>,
    /// Resolved secret -> alias. `None` disables authentication.
    pub auth: Option<HashMap<String, String>>,
    pub messages: Arc<ErrorMessages>,
    pub metrics: Arc<ProxyMetrics>,
    pub max_batch_size: usize,
    pub request_timeout: Duration,
    pub enable_request_log: bool,
    pub max_request_body_log_len: usize,
    pub ws_group: Option<Arc<BackendGroup>>,
}

pub fn rpc_router(state: Arc<ProxyState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", post(handle_rpc))
        .route("/{secret}", post(handle_rpc_with_secret))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
}

pub fn ws_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/", get(handle_ws))
        .route("/{secret}", get(handle_ws_with_secret))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn handle_rpc(
    State(state): State<Arc<ProxyState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve_rpc(state, None, peer, headers, body).await
}

async fn handle_rpc_with_secret(
    State(state): State<Arc<ProxyState>>,
    Path(secret): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve_rpc(state, Some(secret), peer, headers, body).await
}

async fn handle_ws(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    serve_ws(state, None, headers, ws)
}

async fn handle_ws_with_secret(
    State(state): State<Arc<ProxyState>>,
    Path(secret): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    serve_ws(state, Some(secret), headers, ws)
}

/// Maps the request's secret (path segment or header) to its alias.
fn authenticate(
    state: &ProxyState,
    path_secret: Option<&str>,
    headers: &HeaderMap,
) -> Result<Option<String>, StatusCode> {
    let Some(auth) = &state.auth else {
        return Ok(None);
    };
    let header_secret = headers.get(AUTH_HEADER).and_then(|v| v.to_str().ok());
    let secret = path_secret.or(header_secret);
    match secret.and_then(|secret| auth.get(secret)) {
        Some(alias) => Ok(Some(alias.clone())),
        None => {
            ProxyMetrics::inc(&state.metrics.unauthorized_total);
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Appends the connecting peer to the inbound X-Forwarded-For chain.
fn forwarded_for(headers: &HeaderMap, peer: SocketAddr) -> String {
    match headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        Some(existing) if !existing.is_empty() => format!("{existing}, {}", peer.ip()),
        _ => peer.ip().to_string(),
    }
}

async fn serve_rpc(
    state: Arc<ProxyState>,
    path_secret: Option<String>,
    peer: SocketAddr,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    ProxyMetrics::inc(&state.metrics.requests_total);
    let alias = match authenticate(&state, path_secret.as_deref(), &headers) {
        Ok(alias) => alias,
        Err(status) => return status.into_response(),
    };

    if state.enable_request_log {
        let shown = body.len().min(state.max_request_body_log_len);
        info!(
            auth = alias.as_deref().unwrap_or("none"),
            body = %String::from_utf8_lossy(&body[..shown]),
            "inbound rpc request"
        );
    }

    let payload = match Payload::parse(&body) {
        Ok(payload) => payload,
        Err(err) => return single_response(RpcResponse::error(CallId::Null, err)),
    };
    let is_batch = payload.is_batch();
    let entries = payload.into_entries();
    if entries.len() > state.max_batch_size {
        return single_response(RpcResponse::error(
            CallId::Null,
            state.messages.batch_too_large(),
        ));
    }

    let calls: Vec<Result<RpcCall, RpcError>> = entries
        .into_iter()
        .map(|entry| {
            let call: RpcCall = serde_json::from_value(entry)
                .map_err(|_| RpcError::invalid_request("not a valid jsonrpc call"))?;
            call.validate()?;
            Ok(call)
        })
        .collect();
    state
        .metrics
        .calls_total
        .fetch_add(calls.len() as u64, std::sync::atomic::Ordering::Relaxed);

    // Global in-flight cap, weighted by batch size. Dropping the permit on
    // any return path releases the slots.
    let _permit = match &state.concurrency {
        Some((semaphore, capacity)) => {
            let want = (calls.len() as u32).min(*capacity);
            match Arc::clone(semaphore).acquire_many_owned(want).await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            }
        }
        None => None,
    };

    let xff = forwarded_for(&headers, peer);
    let work = process_calls(&state, &calls, &xff);
    let responses = match tokio::time::timeout(state.request_timeout, work).await {
        Ok(responses) => responses,
        Err(_) => calls
            .iter()
            .map(|call| {
                let id = call.as_ref().map(|c| c.id.clone()).unwrap_or(CallId::Null);
                RpcResponse::error(id, RpcError::internal("request timed out"))
            })
            .collect(),
    };

    if is_batch {
        (StatusCode::OK, Json(responses)).into_response()
    } else {
        single_response(responses.into_iter().next().unwrap_or_else(|| {
            RpcResponse::error(CallId::Null, RpcError::internal("empty response set"))
        }))
    }
}

fn single_response(response: RpcResponse) -> Response {
    (StatusCode::OK, Json(response)).into_response()
}

struct GroupWork {
    group: Arc<BackendGroup>,
    items: Vec<(usize, RpcCall)>,
}

/// Runs every call of the request to completion and returns one response
/// per call, in call order. Per-call failures fill their own slot; sibling
/// calls proceed.
async fn process_calls(
    state: &Arc<ProxyState>,
    calls: &[Result<RpcCall, RpcError>],
    xff: &str,
) -> Vec<RpcResponse> {
    let mut slots: Vec<Option<RpcResponse>> = Vec::with_capacity(calls.len());
    slots.resize_with(calls.len(), || None);
    let mut buckets: HashMap<String, GroupWork> = HashMap::new();

    for (index, entry) in calls.iter().enumerate() {
        let call = match entry {
            Ok(call) => call,
            Err(err) => {
                slots[index] = Some(RpcResponse::error(CallId::Null, err.clone()));
                continue;
            }
        };

        let group = match state.router.route(&call.method) {
            Ok(group) => Arc::clone(group),
            Err(RouteError::NotWhitelisted) => {
                slots[index] =
                    Some(RpcResponse::error(call.id.clone(), state.messages.not_whitelisted()));
                continue;
            }
            Err(RouteError::NoGroup) => {
                slots[index] = Some(RpcResponse::error(call.id.clone(), RpcError::no_backends()));
                continue;
            }
        };

        if let Some(response) = check_sender_limit(state, call).await {
            slots[index] = Some(response);
            continue;
        }

        buckets
            .entry(group.name.clone())
            .or_insert_with(|| GroupWork {
                group,
                items: Vec::new(),
            })
            .items
            .push((index, call.clone()));
    }

    let work = buckets
        .into_values()
        .map(|bucket| process_group(state, bucket, xff));
    for placed in join_all(work).await {
        for (index, response) in placed {
            slots[index] = Some(response);
        }
    }

    slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| {
                RpcResponse::error(CallId::Null, RpcError::internal("call was never dispatched"))
            })
        })
        .collect()
}

/// Sender-address rate limiting for submission methods. Fails closed when
/// the shared limiter is unreachable; an unmetered bypass is worse than a
/// rejected send.
async fn check_sender_limit(state: &Arc<ProxyState>, call: &RpcCall) -> Option<RpcResponse> {
    let limiter = state.sender_limiter.as_ref()?;
    if !method::is_sender_rate_limited(&call.method) {
        return None;
    }
    let sender = match recover_sender(call) {
        Ok(sender) => sender,
        Err(err) => {
            debug!(method = %call.method, error = %err, "cannot recover sender");
            return Some(RpcResponse::error(
                call.id.clone(),
                RpcError::invalid_request("invalid raw transaction"),
            ));
        }
    };
    match limiter.inc_sender(sender).await {
        Ok(true) => None,
        Ok(false) => {
            ProxyMetrics::inc(&state.metrics.sender_rate_limited_total);
            Some(RpcResponse::error(
                call.id.clone(),
                state.messages.over_sender_rate_limit(),
            ))
        }
        Err(err) => {
            warn!(error = %err, "sender rate limiter unreachable, failing closed");
            ProxyMetrics::inc(&state.metrics.redis_degraded_total);
            Some(RpcResponse::error(
                call.id.clone(),
                state.messages.over_sender_rate_limit(),
            ))
        }
    }
}

/// One group's share of the batch: rewrite chain-tip tags, serve cacheable
/// calls through the memoizer (single-flight included), batch the rest to
/// the group.
async fn process_group(
    state: &Arc<ProxyState>,
    bucket: GroupWork,
    xff: &str,
) -> Vec<(usize, RpcResponse)> {
    let GroupWork { group, mut items } = bucket;

    let fallback_latest = match (&state.latest_block, group.is_consensus_aware()) {
        (Some(reader), false) => reader.read().await,
        _ => None,
    };
    for (_, call) in items.iter_mut() {
        group.rewrite_block_tags(std::slice::from_mut(call), fallback_latest);
    }

    let mut placed = Vec::with_capacity(items.len());
    let mut passthrough: Vec<(usize, RpcCall)> = Vec::new();
    let mut cached_work = Vec::new();

    for (index, call) in items {
        match &state.rpc_cache {
            Some(cache) if method::cache_policy(&call.method).is_cacheable() => {
                cached_work.push((index, call, Arc::clone(cache)));
            }
            _ => passthrough.push((index, call)),
        }
    }

    let cache_futures = cached_work.into_iter().map(|(index, call, cache)| {
        let group = Arc::clone(&group);
        let state = Arc::clone(state);
        let xff = xff.to_string();
        async move {
            let forward_call = call.clone();
            let (response, outcome) = cache
                .get_or_forward(&call, move || async move {
                    let responses = group
                        .forward(vec![forward_call], true, Some(&xff))
                        .await?;
                    responses
                        .into_iter()
                        .next()
                        .ok_or_else(|| RpcError::internal("empty upstream response"))
                })
                .await;
            match outcome {
                CacheOutcome::Hit => ProxyMetrics::inc(&state.metrics.cache_hits_total),
                CacheOutcome::Miss => ProxyMetrics::inc(&state.metrics.cache_misses_total),
                CacheOutcome::Shared => ProxyMetrics::inc(&state.metrics.cache_shared_total),
                CacheOutcome::Bypass => {}
            }
            (index, response)
        }
    });

    let batch_future = async {
        if passthrough.is_empty() {
            return Vec::new();
        }
        let indices: Vec<usize> = passthrough.iter().map(|(index, _)| *index).collect();
        let ids: Vec<CallId> = passthrough.iter().map(|(_, call)| call.id.clone()).collect();
        let batch: Vec<RpcCall> = passthrough.into_iter().map(|(_, call)| call).collect();
        let single = batch.len() == 1;
        match group.forward(batch, single, Some(xff)).await {
            Ok(responses) => indices.into_iter().zip(responses).collect(),
            Err(err) => indices
                .into_iter()
                .zip(ids)
                .map(|(index, id)| (index, RpcResponse::error(id, err.clone())))
                .collect(),
        }
    };

    let (cached_placed, batch_placed) = tokio::join!(join_all(cache_futures), batch_future);
    placed.extend(cached_placed);
    placed.extend(batch_placed);
    placed
}

fn serve_ws(
    state: Arc<ProxyState>,
    path_secret: Option<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(status) = authenticate(&state, path_secret.as_deref(), &headers) {
        return status.into_response();
    }
    let Some(group) = state.ws_group.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let router = Arc::clone(&state.router);
    let messages = Arc::clone(&state.messages);
    let metrics = Arc::clone(&state.metrics);
    ws.on_upgrade(move |socket| proxy_ws(group, router, messages, metrics, socket))
}
