// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use rpc_core::error::RpcError;

pub const DEFAULT_RATE_LIMIT_MESSAGE: &str = "over rate limit";
pub const DEFAULT_SENDER_RATE_LIMIT_MESSAGE: &str = "sender is over rate limit";
pub const DEFAULT_WHITELIST_MESSAGE: &str = "rpc method is not whitelisted";
pub const DEFAULT_BATCH_MESSAGE: &str = "too many batch requests";

/// Client-facing error texts, fixed at construction from config. Built once
/// and passed where needed instead of mutating shared error singletons.
#[derive(Debug, Clone)]
pub struct ErrorMessages {
    rate_limit: String,
    sender_rate_limit: String,
    whitelist: String,
    batch_too_large: String,
}

impl Default for ErrorMessages {
    fn default() -> Self {
        Self {
            rate_limit: DEFAULT_RATE_LIMIT_MESSAGE.to_string(),
            sender_rate_limit: DEFAULT_SENDER_RATE_LIMIT_MESSAGE.to_string(),
            whitelist: DEFAULT_WHITELIST_MESSAGE.to_string(),
            batch_too_large: DEFAULT_BATCH_MESSAGE.to_string(),
        }
    }
}

impl ErrorMessages {
    pub fn new(
        rate_limit: Option<String>,
        sender_rate_limit: Option<String>,
        whitelist: Option<String>,
        batch_too_large: Option<String>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            rate_limit: rate_limit.unwrap_or(defaults.rate_limit),
            sender_rate_limit: sender_rate_limit.unwrap_or(defaults.sender_rate_limit),
            whitelist: whitelist.unwrap_or(defaults.whitelist),
            batch_too_large: batch_too_large.unwrap_or(defaults.batch_too_large),
        }
    }

    pub fn over_rate_limit(&self) -> RpcError {
        RpcError::over_rate_limit(self.rate_limit.clone())
    }

    pub fn over_sender_rate_limit(&self) -> RpcError {
        RpcError::over_sender_rate_limit(self.sender_rate_limit.clone())
    }

    pub fn not_whitelisted(&self) -> RpcError {
        RpcError::method_not_whitelisted(self.whitelist.clone())
    }

    pub fn batch_too_large(&self) -> RpcError {
        RpcError::too_many_batch_calls(self.batch_too_large.clone())
    }
}
