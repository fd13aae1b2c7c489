// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use proxy::backend::group::BackendGroup;
use proxy::backend::{build_client, Backend, BackendConfig};
use proxy::cache::{Cache, LastValueCache, RpcCache, RpcCacheConfig};
use proxy::client::ChainClient;
use proxy::config::{resolve_env, BackendEntry, Config};
use proxy::consensus::{ConsensusConfig, ConsensusPoller, ConsensusStop, NoopAsyncHandler};
use proxy::limiter::{BackendRateLimiter, SenderRateLimiter};
use proxy::metrics::{MetricsReporter, ProxyMetrics};
use proxy::router::MethodRouter;
use proxy::server::{rpc_router, ws_router, ErrorMessages, ProxyState};

const DEFAULT_CONFIG_PATH: &str = "proxy.toml";
const LVC_INTERVAL: Duration = Duration::from_secs(1);
const CHAIN_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);
const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)?;
    info!(path = %config_path, "loaded config");

    let metrics = ProxyMetrics::new();
    let mut metrics_reporter = MetricsReporter::start(Arc::clone(&metrics), METRICS_LOG_INTERVAL);

    let messages = Arc::new(ErrorMessages::new(
        config.rate_limit.error_message.clone(),
        config.sender_rate_limit.error_message.clone(),
        config.whitelist_error_message.clone(),
        config.batch_config.error_message.clone(),
    ));

    let redis_conn = match &config.redis.url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())?;
            Some(client.get_connection_manager().await?)
        }
        None => None,
    };

    let limiter = Arc::new(if config.rate_limit.enable_backend_rate_limiter {
        match &redis_conn {
            Some(conn) => BackendRateLimiter::redis(conn.clone(), Arc::clone(&metrics)),
            None => {
                warn!("redis is not configured, using local rate limiter");
                BackendRateLimiter::local()
            }
        }
    } else {
        BackendRateLimiter::noop()
    });

    let mut backend_names = Vec::new();
    let mut backends: HashMap<String, Arc<Backend>> = HashMap::new();
    for (name, entry) in &config.backends {
        let backend = Arc::new(build_backend(name, entry, &config)?);
        info!(
            name = %name,
            rpc_url = %backend.config.rpc_url,
            ws_url = backend.config.ws_url.as_deref().unwrap_or(""),
            "configured backend"
        );
        backend_names.push(name.clone());
        backends.insert(name.clone(), backend);
    }

    let mut groups: HashMap<String, Arc<BackendGroup>> = HashMap::new();
    for (group_name, entry) in &config.backend_groups {
        let members = entry
            .backends
            .iter()
            .map(|backend_name| Arc::clone(&backends[backend_name]))
            .collect();
        let consensus = entry.consensus_aware.then(|| {
            let defaults = ConsensusConfig::default();
            ConsensusConfig {
                interval: defaults.interval,
                ban_period: if entry.consensus_ban_period_seconds > 0 {
                    Duration::from_secs(entry.consensus_ban_period_seconds)
                } else {
                    defaults.ban_period
                },
                max_update_threshold: if entry.consensus_max_update_threshold > 0 {
                    entry.consensus_max_update_threshold
                } else {
                    defaults.max_update_threshold
                },
                max_block_lag: if entry.consensus_max_block_lag > 0 {
                    entry.consensus_max_block_lag
                } else {
                    defaults.max_block_lag
                },
                min_peer_count: entry.consensus_min_peer_count,
            }
        });
        let group = Arc::new(BackendGroup::new(
            group_name.clone(),
            members,
            consensus,
            config.server.max_upstream_batch_size,
            Arc::clone(&limiter),
            Arc::clone(&metrics),
            Arc::clone(&messages),
        ));
        groups.insert(group_name.clone(), group);
    }

    let mappings = config
        .rpc_method_mappings
        .iter()
        .map(|(method, group_name)| (method.clone(), Arc::clone(&groups[group_name])))
        .collect();
    let ws_whitelist: HashSet<String> = config.ws_method_whitelist.iter().cloned().collect();
    let router = Arc::new(MethodRouter::new(mappings, ws_whitelist));

    let mut lvcs: Vec<LastValueCache> = Vec::new();
    let (rpc_cache, latest_block) = if config.cache.enabled {
        let block_sync_url = config
            .cache
            .block_sync_rpc_url
            .clone()
            .ok_or("block_sync_rpc_url is required when the cache is enabled")?;
        let chain_client = Arc::new(ChainClient::new(block_sync_url, CHAIN_CLIENT_TIMEOUT)?);
        let store = match &redis_conn {
            Some(conn) => Cache::redis(conn.clone()),
            None => {
                warn!("redis is not configured, using in-memory cache");
                Cache::memory()
            }
        };
        let store = Arc::new(if config.cache.compression {
            store.with_compression()
        } else {
            store
        });

        let block_lvc = LastValueCache::start_block_number(
            LVC_INTERVAL,
            Arc::clone(&chain_client),
            Arc::clone(&store),
        );
        let gas_lvc =
            LastValueCache::start_gas_price(LVC_INTERVAL, chain_client, Arc::clone(&store));
        let latest_block = block_lvc.reader(Arc::clone(&store));
        lvcs.push(block_lvc);
        lvcs.push(gas_lvc);

        let rpc_cache = Arc::new(RpcCache::new(
            Arc::clone(&store),
            latest_block.clone(),
            RpcCacheConfig {
                num_block_confirmations: config.cache.num_block_confirmations,
                ..RpcCacheConfig::default()
            },
        ));
        (Some(rpc_cache), Some(latest_block))
    } else {
        (None, None)
    };

    let sender_limiter = if config.sender_rate_limit.enabled {
        let interval = Duration::from_secs(config.sender_rate_limit.interval_seconds);
        Some(match &redis_conn {
            Some(conn) => SenderRateLimiter::redis(
                config.sender_rate_limit.limit,
                interval,
                conn.clone(),
                Arc::clone(&metrics),
            ),
            None => SenderRateLimiter::local(config.sender_rate_limit.limit, interval),
        })
    } else {
        None
    };

    let mut resolved_auth: Option<HashMap<String, String>> = None;
    if !config.authentication.is_empty() {
        let mut resolved = HashMap::new();
        for (secret, alias) in &config.authentication {
            resolved.insert(resolve_env(secret)?, alias.clone());
        }
        resolved_auth = Some(resolved);
    }

    let concurrency = (config.server.max_concurrent_rpcs > 0).then(|| {
        let capacity = config.server.max_concurrent_rpcs.min(u32::MAX as u64) as u32;
        (
            Arc::new(tokio::sync::Semaphore::new(capacity as usize)),
            capacity,
        )
    });

    let ws_group = config
        .ws_backend_group
        .as_ref()
        .map(|name| Arc::clone(&groups[name]));

    let state = Arc::new(ProxyState {
        router,
        rpc_cache,
        latest_block,
        sender_limiter,
        concurrency,
        auth: resolved_auth,
        messages,
        metrics: Arc::clone(&metrics),
        max_batch_size: config.batch_config.max_size,
        request_timeout: Duration::from_secs(config.server.timeout_seconds),
        enable_request_log: config.server.enable_request_log,
        max_request_body_log_len: config.server.max_request_body_log_len,
        ws_group,
    });

    let mut poller_stops: Vec<ConsensusStop> = Vec::new();
    for (group_name, group) in &groups {
        if group.is_consensus_aware() {
            let handler_name = config.backend_groups[group_name]
                .consensus_async_handler
                .as_deref()
                .unwrap_or("noop");
            if handler_name != "noop" {
                warn!(group = %group.name, handler = handler_name, "unknown consensus handler, using noop");
            }
            info!(group = %group.name, "starting consensus poller");
            let poller = ConsensusPoller::new(Arc::clone(group), Arc::new(NoopAsyncHandler));
            let (_handle, stop) = poller.spawn();
            poller_stops.push(stop);
        }
    }

    if config.metrics.enabled {
        let addr: SocketAddr = format!("{}:{}", config.metrics.host, config.metrics.port).parse()?;
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            if let Err(err) = proxy::metrics::serve(addr, metrics).await {
                warn!(error = %err, "metrics listener failed");
            }
        });
    }

    let rpc_addr = format!("{}:{}", config.server.rpc_host, config.server.rpc_port);
    let rpc_listener = tokio::net::TcpListener::bind(&rpc_addr).await?;
    info!(address = %rpc_addr, "rpc listener up");
    let (rpc_shutdown_tx, rpc_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let rpc_app = rpc_router(Arc::clone(&state), config.server.max_body_size_bytes);
    let rpc_task = tokio::spawn(async move {
        axum::serve(
            rpc_listener,
            rpc_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = rpc_shutdown_rx.await;
        })
        .await
    });

    let mut ws_shutdown_tx = None;
    let mut ws_task = None;
    if config.server.ws_port != 0 {
        let ws_addr = format!("{}:{}", config.server.ws_host, config.server.ws_port);
        let ws_listener = tokio::net::TcpListener::bind(&ws_addr).await?;
        info!(address = %ws_addr, "ws listener up");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        ws_shutdown_tx = Some(tx);
        let ws_app = ws_router(Arc::clone(&state));
        ws_task = Some(tokio::spawn(async move {
            axum::serve(
                ws_listener,
                ws_app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await
        }));
    } else {
        info!("ws listener not enabled (ws_port is 0)");
    }

    info!("proxy started");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    let _ = rpc_shutdown_tx.send(());
    if let Some(tx) = ws_shutdown_tx {
        let _ = tx.send(());
    }
    for stop in &poller_stops {
        stop.request_shutdown();
    }
    for lvc in &mut lvcs {
        lvc.stop();
    }
    metrics_reporter.stop();
    if let Err(err) = limiter.flush_backend_ws_conns(&backend_names).await {
        warn!(error = %err, "failed to flush backend ws conns");
    }

    rpc_task.await??;
    if let Some(task) = ws_task {
        task.await??;
    }
    info!("goodbye");
    Ok(())
}

/// Builds one backend from its config entry, loading TLS material when set.
fn build_backend(
    name: &str,
    entry: &BackendEntry,
    config: &Config,
) -> Result<Backend, Box<dyn std::error::Error>> {
    let ca_pem = entry.ca_file.as_ref().map(std::fs::read).transpose()?;
    let identity_pem = match (&entry.client_cert_file, &entry.client_key_file) {
        (Some(cert), Some(key)) => {
            let mut pem = std::fs::read(cert)?;
            pem.extend(std::fs::read(key)?);
            Some(pem)
        }
        _ => None,
    };
    let client = build_client(ca_pem.as_deref(), identity_pem.as_deref())?;

    let options = &config.backend_options;
    Ok(Backend::new(
        BackendConfig {
            name: name.to_string(),
            rpc_url: entry.rpc_url.clone(),
            ws_url: entry.ws_url.clone(),
            username: entry.username.clone(),
            password: entry.password.clone(),
            max_rps: entry.max_rps,
            max_ws_conns: entry.max_ws_conns,
            timeout: Duration::from_secs(options.response_timeout_seconds),
            max_response_bytes: options.max_response_size_bytes,
            out_of_service_window: Duration::from_secs(options.out_of_service_seconds),
            max_degraded_latency: Duration::from_millis(options.max_degraded_latency_ms),
            max_latency: Duration::from_millis(options.max_latency_ms),
            max_error_rate: options.max_error_rate_threshold,
            skip_peer_count_check: entry.skip_peer_count_check,
            strip_trailing_xff: entry.strip_trailing_xff,
        },
        client,
    ))
}
