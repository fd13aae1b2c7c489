// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

mod lvc;
mod rpc;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use redis::aio::ConnectionManager;
use thiserror::Error;

pub use lvc::{LastValueCache, LastValueReader};
pub use rpc::{CacheOutcome, RpcCache, RpcCacheConfig};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis cache op failed")]
    Redis {
        #[source]
        source: redis::RedisError,
    },
    #[error("cache entry is not valid compressed data")]
    Corrupt {
        #[source]
        source: snap::Error,
    },
}

enum Store {
    /// Plain map for single-instance deployments. Entries have no expiry;
    /// staleness is governed by the confirmation depth at read time.
    Memory(Mutex<HashMap<String, Vec<u8>>>),
    Redis(ConnectionManager),
}

/// Shared key/value store under the RPC and last-value caches.
pub struct Cache {
    store: Store,
    compress: bool,
}

impl Cache {
    pub fn memory() -> Self {
        Self {
            store: Store::Memory(Mutex::new(HashMap::new())),
            compress: false,
        }
    }

    pub fn redis(conn: ConnectionManager) -> Self {
        Self {
            store: Store::Redis(conn),
            compress: false,
        }
    }

    /// Enables transparent snappy compression of stored values.
    pub fn with_compression(mut self) -> Self {
        self.compress = true;
        self
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let raw = match &self.store {
            Store::Memory(map) => map
                .lock()
                .expect("memory cache mutex poisoned")
                .get(key)
                .cloned(),
            Store::Redis(conn) => {
                let mut conn = conn.clone();
                redis::cmd("GET")
                    .arg(key)
                    .query_async::<Option<Vec<u8>>>(&mut conn)
                    .await
                    .map_err(|source| CacheError::Redis { source })?
            }
        };
        match raw {
            None => Ok(None),
            Some(bytes) if self.compress => {
                let decoded = snap::raw::Decoder::new()
                    .decompress_vec(&bytes)
                    .map_err(|source| CacheError::Corrupt { source })?;
                Ok(Some(decoded))
            }
            Some(bytes) => Ok(Some(bytes)),
        }
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        self.store(key, value, None).await
    }

    pub async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        self.store(key, value, Some(ttl)).await
    }

    async fn store(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let encoded = if self.compress {
            snap::raw::Encoder::new()
                .compress_vec(value)
                .map_err(|source| CacheError::Corrupt { source })?
        } else {
            value.to_vec()
        };
        match &self.store {
            Store::Memory(map) => {
                map.lock()
                    .expect("memory cache mutex poisoned")
                    .insert(key.to_string(), encoded);
                Ok(())
            }
            Store::Redis(conn) => {
                let mut conn = conn.clone();
                let mut cmd = match ttl {
                    Some(ttl) => {
                        let mut cmd = redis::cmd("SET");
                        cmd.arg(key).arg(encoded).arg("PX").arg(ttl.as_millis() as u64);
                        cmd
                    }
                    None => {
                        let mut cmd = redis::cmd("SET");
                        cmd.arg(key).arg(encoded);
                        cmd
                    }
                };
                cmd.query_async::<()>(&mut conn)
                    .await
                    .map_err(|source| CacheError::Redis { source })?;
                Ok(())
            }
        }
    }
}
