// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file")]
    Read {
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file")]
    Parse {
        #[source]
        source: toml::de::Error,
    },
    #[error("config references unset environment variable {name}")]
    MissingEnv { name: String },
    #[error("must define at least one backend")]
    NoBackends,
    #[error("must define at least one backend group")]
    NoGroups,
    #[error("must define at least one rpc method mapping")]
    NoMappings,
    #[error("backend {backend} must define an rpc_url")]
    MissingRpcUrl { backend: String },
    #[error("backend group {group} references undefined backend {backend}")]
    UnknownBackend { group: String, backend: String },
    #[error("method {method} maps to undefined backend group {group}")]
    UnknownGroup { method: String, group: String },
    #[error("ws backend group {group} is not defined")]
    UnknownWsGroup { group: String },
    #[error("a ws port was defined, but no ws backend group")]
    WsPortWithoutGroup,
    #[error("cannot use none as an auth alias")]
    ForbiddenAuthAlias,
    #[error("limit in sender_rate_limit must be > 0")]
    SenderLimitValue,
    #[error("interval in sender_rate_limit must be >= 1s")]
    SenderLimitInterval,
    #[error("must specify a redis url when use_redis is set")]
    RedisRequired,
    #[error("block_sync_rpc_url is required when the cache is enabled")]
    CacheNeedsBlockSync,
}

fn default_rpc_host() -> String {
    "0.0.0.0".to_string()
}

fn default_rpc_port() -> u16 {
    8080
}

fn default_max_body_size() -> usize {
    10 * 1024 * 1024
}

fn default_timeout_seconds() -> u64 {
    10
}

fn default_batch_max_size() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub rpc_host: String,
    pub rpc_port: u16,
    pub ws_host: String,
    pub ws_port: u16,
    pub max_body_size_bytes: usize,
    pub timeout_seconds: u64,
    /// 0 means unbounded in-flight calls.
    pub max_concurrent_rpcs: u64,
    /// 0 means never split upstream batches.
    pub max_upstream_batch_size: usize,
    pub enable_request_log: bool,
    pub max_request_body_log_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rpc_host: default_rpc_host(),
            rpc_port: default_rpc_port(),
            ws_host: default_rpc_host(),
            ws_port: 0,
            max_body_size_bytes: default_max_body_size(),
            timeout_seconds: default_timeout_seconds(),
            max_concurrent_rpcs: 0,
            max_upstream_batch_size: 0,
            enable_request_log: false,
            max_request_body_log_len: 2000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendEntry {
    pub rpc_url: String,
    pub ws_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub max_rps: u64,
    pub max_ws_conns: u64,
    pub ca_file: Option<String>,
    pub client_cert_file: Option<String>,
    pub client_key_file: Option<String>,
    pub strip_trailing_xff: bool,
    pub skip_peer_count_check: bool,
}

/// Backend tuning shared by all backends: one operator profile, many
/// endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendOptions {
    pub response_timeout_seconds: u64,
    pub max_response_size_bytes: usize,
    pub out_of_service_seconds: u64,
    pub max_degraded_latency_ms: u64,
    pub max_latency_ms: u64,
    pub max_error_rate_threshold: f64,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            response_timeout_seconds: 10,
            max_response_size_bytes: 32 * 1024 * 1024,
            out_of_service_seconds: 30,
            max_degraded_latency_ms: 5000,
            max_latency_ms: 10_000,
            max_error_rate_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendGroupEntry {
    pub backends: Vec<String>,
    pub consensus_aware: bool,
    pub consensus_async_handler: Option<String>,
    pub consensus_ban_period_seconds: u64,
    pub consensus_max_update_threshold: u32,
    pub consensus_max_block_lag: u64,
    pub consensus_min_peer_count: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub block_sync_rpc_url: Option<String>,
    pub num_block_confirmations: u64,
    pub compression: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub enable_backend_rate_limiter: bool,
    pub use_redis: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SenderRateLimitSection {
    pub enabled: bool,
    pub limit: u64,
    pub interval_seconds: u64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    pub max_size: usize,
    pub error_message: Option<String>,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            max_size: default_batch_max_size(),
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RedisSection {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub backends: HashMap<String, BackendEntry>,
    pub backend_options: BackendOptions,
    pub backend_groups: HashMap<String, BackendGroupEntry>,
    pub rpc_method_mappings: HashMap<String, String>,
    pub ws_method_whitelist: Vec<String>,
    pub ws_backend_group: Option<String>,
    /// secret -> alias; the alias becomes a log field.
    pub authentication: HashMap<String, String>,
    pub whitelist_error_message: Option<String>,
    pub cache: CacheSection,
    pub rate_limit: RateLimitSection,
    pub sender_rate_limit: SenderRateLimitSection,
    pub batch_config: BatchSection,
    pub redis: RedisSection,
    pub metrics: MetricsSection,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw =
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read { source })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let mut value: toml::Value =
            toml::from_str(raw).map_err(|source| ConfigError::Parse { source })?;
        resolve_env_in_value(&mut value)?;
        let config: Self = value
            .try_into()
            .map_err(|source| ConfigError::Parse { source })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        if self.backend_groups.is_empty() {
            return Err(ConfigError::NoGroups);
        }
        if self.rpc_method_mappings.is_empty() {
            return Err(ConfigError::NoMappings);
        }
        for (name, backend) in &self.backends {
            if backend.rpc_url.is_empty() {
                return Err(ConfigError::MissingRpcUrl {
                    backend: name.clone(),
                });
            }
        }
        for (group_name, group) in &self.backend_groups {
            for backend in &group.backends {
                if !self.backends.contains_key(backend) {
                    return Err(ConfigError::UnknownBackend {
                        group: group_name.clone(),
                        backend: backend.clone(),
                    });
                }
            }
        }
        for (method, group) in &self.rpc_method_mappings {
            if !self.backend_groups.contains_key(group) {
                return Err(ConfigError::UnknownGroup {
                    method: method.clone(),
                    group: group.clone(),
                });
            }
        }
        if let Some(ws_group) = &self.ws_backend_group {
            if !self.backend_groups.contains_key(ws_group) {
                return Err(ConfigError::UnknownWsGroup {
                    group: ws_group.clone(),
                });
            }
        } else if self.server.ws_port != 0 {
            return Err(ConfigError::WsPortWithoutGroup);
        }
        if self.authentication.values().any(|alias| alias == "none") {
            return Err(ConfigError::ForbiddenAuthAlias);
        }
        if self.sender_rate_limit.enabled {
            if self.sender_rate_limit.limit == 0 {
                return Err(ConfigError::SenderLimitValue);
            }
            if self.sender_rate_limit.interval_seconds == 0 {
                return Err(ConfigError::SenderLimitInterval);
            }
        }
        if self.rate_limit.use_redis && self.redis.url.is_none() {
            return Err(ConfigError::RedisRequired);
        }
        if self.cache.enabled && self.cache.block_sync_rpc_url.is_none() {
            return Err(ConfigError::CacheNeedsBlockSync);
        }
        Ok(())
    }
}

/// Resolves `$ENV_VAR` references in every string of the parsed config.
/// Resolution is idempotent: a value that carries no reference maps to
/// itself.
pub fn resolve_env(value: &str) -> Result<String, ConfigError> {
    match value.strip_prefix('$') {
        Some(name) => std::env::var(name).map_err(|_| ConfigError::MissingEnv {
            name: name.to_string(),
        }),
        None => Ok(value.to_string()),
    }
}

fn resolve_env_in_value(value: &mut toml::Value) -> Result<(), ConfigError> {
    match value {
        toml::Value::String(text) => {
            *text = resolve_env(text)?;
            Ok(())
        }
        toml::Value::Array(entries) => {
            for entry in entries {
                resolve_env_in_value(entry)?;
            }
            Ok(())
        }
        toml::Value::Table(table) => {
            for (_, entry) in table.iter_mut() {
                resolve_env_in_value(entry)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
