// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::oneshot;

use proxy::backend::group::BackendGroup;
use proxy::backend::{Backend, BackendConfig};
use proxy::cache::{Cache, LastValueCache, LastValueReader, RpcCache, RpcCacheConfig};
use proxy::client::ChainClient;
use proxy::limiter::{BackendRateLimiter, SenderRateLimiter};
use proxy::metrics::ProxyMetrics;
use proxy::router::MethodRouter;
use proxy::server::{rpc_router, ErrorMessages, ProxyState};

const TEST_METHODS: &[&str] = &[
    "eth_chainId",
    "eth_getBalance",
    "eth_getBlockByNumber",
    "eth_blockNumber",
    "eth_sendRawTransaction",
];

#[derive(Clone, Default)]
struct MockUpstream {
    payloads: Arc<Mutex<Vec<Value>>>,
    fail: Arc<AtomicBool>,
}

impl MockUpstream {
    fn recorded(&self) -> Vec<Value> {
        self.payloads.lock().expect("mock payloads mutex").clone()
    }

    /// Payloads that carry at least one call of `method`.
    fn payloads_with_method(&self, method: &str) -> Vec<Value> {
        self.recorded()
            .into_iter()
            .filter(|payload| {
                let calls: Vec<&Value> = match payload {
                    Value::Array(entries) => entries.iter().collect(),
                    single => vec![single],
                };
                calls
                    .iter()
                    .any(|call| call.get("method").and_then(Value::as_str) == Some(method))
            })
            .collect()
    }
}

async fn mock_rpc_handler(
    State(state): State<MockUpstream>,
    Json(payload): Json<Value>,
) -> axum::response::Response {
    state
        .payloads
        .lock()
        .expect("mock payloads mutex")
        .push(payload.clone());
    if state.fail.load(Ordering::Relaxed) {
        return axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let respond = |call: &Value| -> Value {
        let id = call.get("id").cloned().unwrap_or(Value::Null);
        let method = call.get("method").and_then(Value::as_str).unwrap_or("");
        let result = match method {
            "eth_chainId" => json!("0xa"),
            "eth_blockNumber" => json!("0xabc"),
            "eth_getBalance" => json!("0x10"),
            "eth_getBlockByNumber" => {
                let tag = call.pointer("/params/0").cloned().unwrap_or(Value::Null);
                json!({ "number": tag, "transactions": [] })
            }
            "eth_sendRawTransaction" => json!(format!("0x{}", "66".repeat(32))),
            _ => json!("0x1"),
        };
        json!({ "jsonrpc": "2.0", "id": id, "result": result })
    };

    let body = match &payload {
        Value::Array(calls) => Value::Array(calls.iter().map(respond).collect()),
        single => respond(single),
    };
    Json(body).into_response()
}

async fn start_mock_upstream() -> Option<(SocketAddr, MockUpstream)> {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(value) => value,
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            eprintln!("skipping http integration test: cannot bind listener in this environment");
            return None;
        }
        Err(err) => panic!("bind mock upstream: {err}"),
    };
    let addr = listener.local_addr().expect("read mock upstream addr");
    let state = MockUpstream::default();
    let app = Router::new()
        .route("/", post(mock_rpc_handler))
        .with_state(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("run mock upstream");
    });
    Some((addr, state))
}

#[derive(Default)]
struct ProxyOptions {
    cache_block_sync: Option<SocketAddr>,
    num_block_confirmations: u64,
    max_upstream_batch_size: usize,
    max_batch_size: usize,
    sender_limit: Option<u64>,
    /// Applies to every backend; a non-zero value enables the local
    /// backend rate limiter.
    max_rps: u64,
    auth: Option<HashMap<String, String>>,
}

struct TestProxy {
    addr: SocketAddr,
    metrics: Arc<ProxyMetrics>,
    latest_block: Option<LastValueReader>,
    _lvcs: Vec<LastValueCache>,
    shutdown: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl TestProxy {
    async fn stop(self) {
        self.shutdown.send(()).expect("request proxy shutdown");
        self.task.await.expect("join proxy task");
    }
}

async fn start_proxy(
    upstreams: Vec<(&str, SocketAddr)>,
    options: ProxyOptions,
) -> Option<TestProxy> {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(value) => value,
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            eprintln!("skipping http integration test: cannot bind listener in this environment");
            return None;
        }
        Err(err) => panic!("bind proxy listener: {err}"),
    };
    let addr = listener.local_addr().expect("read proxy addr");

    let metrics = ProxyMetrics::new();
    let limiter = Arc::new(if options.max_rps > 0 {
        BackendRateLimiter::local()
    } else {
        BackendRateLimiter::noop()
    });
    let messages = Arc::new(ErrorMessages::new(
        Some("backends are saturated".to_string()),
        Some("sender is sending too fast".to_string()),
        None,
        None,
    ));
    let backends = upstreams
        .iter()
        .map(|(name, upstream)| {
            Arc::new(Backend::new(
                BackendConfig {
                    name: name.to_string(),
                    rpc_url: format!("http://{upstream}/"),
                    timeout: Duration::from_secs(2),
                    max_rps: options.max_rps,
                    ..BackendConfig::default()
                },
                reqwest::Client::new(),
            ))
        })
        .collect();
    let group = Arc::new(BackendGroup::new(
        "main".to_string(),
        backends,
        None,
        options.max_upstream_batch_size,
        Arc::clone(&limiter),
        Arc::clone(&metrics),
        Arc::clone(&messages),
    ));

    let mappings = TEST_METHODS
        .iter()
        .map(|method| (method.to_string(), Arc::clone(&group)))
        .collect();
    let router = Arc::new(MethodRouter::new(mappings, HashSet::new()));

    let mut lvcs = Vec::new();
    let (rpc_cache, latest_block) = match options.cache_block_sync {
        Some(block_sync) => {
            let store = Arc::new(Cache::memory());
            let chain_client = Arc::new(
                ChainClient::new(format!("http://{block_sync}/"), Duration::from_secs(2))
                    .expect("build chain client"),
            );
            let lvc = LastValueCache::start_block_number(
                Duration::from_millis(20),
                chain_client,
                Arc::clone(&store),
            );
            let reader = lvc.reader(Arc::clone(&store));
            lvcs.push(lvc);
            let rpc_cache = Arc::new(RpcCache::new(
                Arc::clone(&store),
                reader.clone(),
                RpcCacheConfig {
                    num_block_confirmations: options.num_block_confirmations,
                    ..RpcCacheConfig::default()
                },
            ));
            (Some(rpc_cache), Some(reader))
        }
        None => (None, None),
    };

    // A wide interval keeps the rejection independent of test wall-clock.
    let sender_limiter = options
        .sender_limit
        .map(|limit| SenderRateLimiter::local(limit, Duration::from_secs(60)));

    let state = Arc::new(ProxyState {
        router,
        rpc_cache,
        latest_block: latest_block.clone(),
        sender_limiter,
        concurrency: None,
        auth: options.auth,
        messages,
        metrics: Arc::clone(&metrics),
        max_batch_size: if options.max_batch_size > 0 {
            options.max_batch_size
        } else {
            100
        },
        request_timeout: Duration::from_secs(5),
        enable_request_log: false,
        max_request_body_log_len: 2000,
        ws_group: None,
    });

    let app = rpc_router(state, 1024 * 1024);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        })
        .await
        .expect("run proxy server");
    });

    Some(TestProxy {
        addr,
        metrics,
        latest_block,
        _lvcs: lvcs,
        shutdown: shutdown_tx,
        task,
    })
}

async fn post_rpc(addr: SocketAddr, body: Value) -> Value {
    reqwest::Client::new()
        .post(format!("http://{addr}/"))
        .json(&body)
        .send()
        .await
        .expect("post rpc request")
        .json()
        .await
        .expect("parse rpc response")
}

async fn wait_for_tip(proxy: &TestProxy, expected: u64) {
    let reader = proxy.latest_block.as_ref().expect("lvc reader");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if reader.read().await == Some(expected) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "block sync tip never reached {expected:#x}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn call(id: i64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chain_id_is_served_from_cache_after_one_upstream_call() {
    let Some((addr_a, mock_a)) = start_mock_upstream().await else {
        return;
    };
    let Some((addr_b, mock_b)) = start_mock_upstream().await else {
        return;
    };
    let Some(proxy) = start_proxy(
        vec![("a", addr_a), ("b", addr_b)],
        ProxyOptions {
            cache_block_sync: Some(addr_a),
            ..ProxyOptions::default()
        },
    )
    .await
    else {
        return;
    };

    let first = post_rpc(proxy.addr, call(1, "eth_chainId", json!([]))).await;
    let second = post_rpc(proxy.addr, call(2, "eth_chainId", json!([]))).await;
    let upstream_calls = mock_a.payloads_with_method("eth_chainId").len()
        + mock_b.payloads_with_method("eth_chainId").len();
    proxy.stop().await;

    assert_eq!(first["result"], json!("0xa"));
    assert_eq!(second["result"], json!("0xa"));
    assert_eq!(second["id"], json!(2));
    assert_eq!(upstream_calls, 1, "second request must come from cache");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_backend_is_retried_on_the_next_one() {
    let Some((addr_a, mock_a)) = start_mock_upstream().await else {
        return;
    };
    let Some((addr_b, mock_b)) = start_mock_upstream().await else {
        return;
    };
    mock_a.fail.store(true, Ordering::Relaxed);

    let Some(proxy) = start_proxy(
        vec![("a", addr_a), ("b", addr_b)],
        ProxyOptions::default(),
    )
    .await
    else {
        return;
    };

    let response = post_rpc(
        proxy.addr,
        call(1, "eth_getBalance", json!(["0x1111111111111111111111111111111111111111", "0x5"])),
    )
    .await;
    let a_errors = proxy.metrics.backend_errors("a");
    let b_errors = proxy.metrics.backend_errors("b");
    proxy.stop().await;

    assert_eq!(response["result"], json!("0x10"));
    assert_eq!(a_errors, 1, "failing backend records the error");
    assert_eq!(b_errors, 0, "serving backend stays clean");
    assert_eq!(mock_a.recorded().len(), 1);
    assert_eq!(mock_b.recorded().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_batches_split_upstream_and_merge_in_order() {
    let Some((addr_a, mock_a)) = start_mock_upstream().await else {
        return;
    };
    let Some(proxy) = start_proxy(
        vec![("a", addr_a)],
        ProxyOptions {
            max_upstream_batch_size: 10,
            ..ProxyOptions::default()
        },
    )
    .await
    else {
        return;
    };

    let batch: Vec<Value> = (1..=20)
        .map(|id| call(id, "eth_blockNumber", json!([])))
        .collect();
    let response = post_rpc(proxy.addr, Value::Array(batch)).await;
    let recorded = mock_a.recorded();
    proxy.stop().await;

    let responses = response.as_array().expect("batch response");
    assert_eq!(responses.len(), 20);
    for (index, entry) in responses.iter().enumerate() {
        assert_eq!(entry["id"], json!(index as i64 + 1), "responses keep order");
        assert_eq!(entry["result"], json!("0xabc"));
    }

    let sizes: Vec<usize> = recorded
        .iter()
        .map(|payload| payload.as_array().expect("upstream batch").len())
        .collect();
    assert_eq!(sizes, vec![10, 10]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn latest_tag_is_rewritten_to_the_numeric_tip_and_keyed_in_cache() {
    let Some((addr_a, mock_a)) = start_mock_upstream().await else {
        return;
    };
    let Some(proxy) = start_proxy(
        vec![("a", addr_a)],
        ProxyOptions {
            cache_block_sync: Some(addr_a),
            ..ProxyOptions::default()
        },
    )
    .await
    else {
        return;
    };
    wait_for_tip(&proxy, 0xabc).await;

    let first = post_rpc(
        proxy.addr,
        call(1, "eth_getBlockByNumber", json!(["latest", false])),
    )
    .await;
    let second = post_rpc(
        proxy.addr,
        call(2, "eth_getBlockByNumber", json!(["latest", false])),
    )
    .await;
    let upstream = mock_a.payloads_with_method("eth_getBlockByNumber");
    proxy.stop().await;

    assert_eq!(first["result"]["number"], json!("0xabc"));
    assert_eq!(second["result"]["number"], json!("0xabc"));
    assert_eq!(upstream.len(), 1, "rewritten tag must hit the cache");
    assert_eq!(
        upstream[0].pointer("/params/0"),
        Some(&json!("0xabc")),
        "upstream must see the numeric tip, not the tag"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sixth_send_in_the_interval_is_sender_rate_limited() {
    use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
    use alloy_eips::eip2718::Encodable2718;
    use alloy_primitives::{hex, Address, TxKind, U256};
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;

    let Some((addr_a, mock_a)) = start_mock_upstream().await else {
        return;
    };
    let Some(proxy) = start_proxy(
        vec![("a", addr_a)],
        ProxyOptions {
            sender_limit: Some(5),
            ..ProxyOptions::default()
        },
    )
    .await
    else {
        return;
    };

    let signer = PrivateKeySigner::random();
    let mut raw_txs = Vec::new();
    for nonce in 0..6_u64 {
        let tx = TxLegacy {
            chain_id: Some(1),
            nonce,
            gas_price: 1_000_000_000,
            gas_limit: 21_000,
            to: TxKind::Call(Address::from_slice(&[0x22; 20])),
            value: U256::from(1),
            input: Default::default(),
        };
        let signature = signer
            .sign_hash_sync(&tx.signature_hash())
            .expect("sign tx");
        let envelope: TxEnvelope = tx.into_signed(signature).into();
        raw_txs.push(hex::encode_prefixed(envelope.encoded_2718()));
    }

    let mut responses = Vec::new();
    for (index, raw) in raw_txs.iter().enumerate() {
        responses.push(
            post_rpc(
                proxy.addr,
                call(index as i64 + 1, "eth_sendRawTransaction", json!([raw])),
            )
            .await,
        );
    }
    let forwarded = mock_a.payloads_with_method("eth_sendRawTransaction").len();
    proxy.stop().await;

    for response in &responses[..5] {
        assert!(response.get("error").is_none(), "first five pass: {response}");
    }
    let rejected = &responses[5];
    assert_eq!(rejected["error"]["code"], json!(-32017));
    assert_eq!(
        rejected["error"]["message"],
        json!("sender is sending too fast"),
        "configured message is returned"
    );
    assert_eq!(forwarded, 5, "the rejected send must not reach upstream");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backend_rps_exhaustion_returns_the_configured_rate_limit_error() {
    let Some((addr_a, mock_a)) = start_mock_upstream().await else {
        return;
    };
    let Some(proxy) = start_proxy(
        vec![("a", addr_a)],
        ProxyOptions {
            max_rps: 1,
            ..ProxyOptions::default()
        },
    )
    .await
    else {
        return;
    };

    let first = post_rpc(proxy.addr, call(1, "eth_blockNumber", json!([]))).await;
    let second = post_rpc(proxy.addr, call(2, "eth_blockNumber", json!([]))).await;
    let forwarded = mock_a.payloads_with_method("eth_blockNumber").len();
    let limited = proxy
        .metrics
        .rate_limited_total
        .load(std::sync::atomic::Ordering::Relaxed);
    proxy.stop().await;

    assert_eq!(first["result"], json!("0xabc"));
    assert_eq!(second["error"]["code"], json!(-32016));
    assert_eq!(
        second["error"]["message"],
        json!("backends are saturated"),
        "configured rate limit message is returned"
    );
    assert_eq!(second["id"], json!(2), "rate limit errors keep the call id");
    assert_eq!(forwarded, 1, "the limited call must not reach upstream");
    assert_eq!(limited, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requests_without_a_known_secret_are_unauthorized() {
    let Some((addr_a, _mock_a)) = start_mock_upstream().await else {
        return;
    };
    let Some(proxy) = start_proxy(
        vec![("a", addr_a)],
        ProxyOptions {
            auth: Some(HashMap::from([(
                "sekrit".to_string(),
                "team-chain".to_string(),
            )])),
            ..ProxyOptions::default()
        },
    )
    .await
    else {
        return;
    };
    let client = reqwest::Client::new();
    let body = call(1, "eth_chainId", json!([]));

    let anonymous = client
        .post(format!("http://{}/", proxy.addr))
        .json(&body)
        .send()
        .await
        .expect("post anonymous");
    assert_eq!(anonymous.status(), reqwest::StatusCode::UNAUTHORIZED);

    let with_header = client
        .post(format!("http://{}/", proxy.addr))
        .header("x-api-key", "sekrit")
        .json(&body)
        .send()
        .await
        .expect("post with header");
    assert_eq!(with_header.status(), reqwest::StatusCode::OK);

    let with_path = client
        .post(format!("http://{}/sekrit", proxy.addr))
        .json(&body)
        .send()
        .await
        .expect("post with path secret");
    assert_eq!(with_path.status(), reqwest::StatusCode::OK);

    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn over_limit_batches_and_unmapped_methods_error_cleanly() {
    let Some((addr_a, mock_a)) = start_mock_upstream().await else {
        return;
    };
    let Some(proxy) = start_proxy(
        vec![("a", addr_a)],
        ProxyOptions {
            max_batch_size: 3,
            ..ProxyOptions::default()
        },
    )
    .await
    else {
        return;
    };

    let batch: Vec<Value> = (1..=4).map(|id| call(id, "eth_chainId", json!([]))).collect();
    let too_large = post_rpc(proxy.addr, Value::Array(batch)).await;
    assert_eq!(too_large["error"]["code"], json!(-32014));

    let unmapped = post_rpc(proxy.addr, call(1, "debug_traceTransaction", json!([]))).await;
    assert_eq!(unmapped["error"]["code"], json!(-32001));
    assert_eq!(unmapped["id"], json!(1), "whitelist errors keep the call id");

    assert!(mock_a.recorded().is_empty(), "nothing may reach upstream");
    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batch_responses_mix_errors_and_results_per_slot() {
    let Some((addr_a, _mock_a)) = start_mock_upstream().await else {
        return;
    };
    let Some(proxy) = start_proxy(vec![("a", addr_a)], ProxyOptions::default()).await else {
        return;
    };

    let batch = json!([
        call(1, "eth_blockNumber", json!([])),
        call(2, "debug_traceTransaction", json!([])),
        call(3, "eth_blockNumber", json!([])),
    ]);
    let response = post_rpc(proxy.addr, batch).await;
    proxy.stop().await;

    let responses = response.as_array().expect("batch response");
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0]["result"], json!("0xabc"));
    assert_eq!(responses[1]["error"]["code"], json!(-32001));
    assert_eq!(responses[2]["result"], json!("0xabc"));
}
