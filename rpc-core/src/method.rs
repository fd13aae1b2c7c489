// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_primitives::keccak256;
use serde_json::Value;

use crate::block::BlockRef;
use crate::jsonrpc::RpcCall;

/// How a method's responses may be memoized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Subscriptions, sends, and anything mempool- or clock-dependent.
    Never,
    /// Pure function of (method, params); chain height is irrelevant.
    Static,
    /// Keyed on the numeric block reference at `param_index`; served from
    /// cache only once the referenced height is buried under the configured
    /// confirmation depth.
    BlockKeyed { param_index: usize },
}

impl CachePolicy {
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, Self::Never)
    }

    pub fn block_param_index(&self) -> Option<usize> {
        match self {
            Self::BlockKeyed { param_index } => Some(*param_index),
            _ => None,
        }
    }
}

/// Cache class for a method. Unknown methods are never cached; forwarding
/// them opaquely is always safe, caching them is not.
pub fn cache_policy(method: &str) -> CachePolicy {
    match method {
        "eth_chainId" | "net_version" | "web3_clientVersion" => CachePolicy::Static,
        "eth_getBlockByNumber" => CachePolicy::BlockKeyed { param_index: 0 },
        "eth_getBalance" | "eth_getCode" | "eth_getTransactionCount" | "eth_call" => {
            CachePolicy::BlockKeyed { param_index: 1 }
        }
        "eth_getStorageAt" => CachePolicy::BlockKeyed { param_index: 2 },
        _ => CachePolicy::Never,
    }
}

/// Methods whose calls are capped per recovered sender address.
pub fn is_sender_rate_limited(method: &str) -> bool {
    matches!(
        method,
        "eth_sendRawTransaction" | "eth_sendRawTransactionConditional"
    )
}

/// The block reference a call names, if its method takes one positionally.
pub fn block_ref(call: &RpcCall) -> Option<BlockRef> {
    let index = cache_policy(&call.method).block_param_index()?;
    // A missing block param defaults to latest per the Ethereum JSON-RPC
    // convention.
    match call.param(index) {
        Some(param) => BlockRef::from_param(param),
        None => Some(BlockRef::Latest),
    }
}

/// Canonical cache fingerprint for a call: method plus a keccak of the
/// params JSON. Callers must rewrite block tags to numbers first so the
/// fingerprint stays stable as the chain advances.
pub fn cache_key(call: &RpcCall) -> String {
    let params = call.params.clone().unwrap_or(Value::Null);
    let canonical = serde_json::to_string(&params).unwrap_or_default();
    format!("{}:{}", call.method, keccak256(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::{block_ref, cache_key, cache_policy, is_sender_rate_limited, CachePolicy};
    use crate::block::BlockRef;
    use crate::jsonrpc::{CallId, RpcCall};
    use serde_json::json;

    fn call(method: &str, params: serde_json::Value) -> RpcCall {
        RpcCall::new(CallId::Number(1), method, Some(params))
    }

    #[test]
    fn subscriptions_and_sends_are_never_cached() {
        for method in [
            "eth_subscribe",
            "eth_unsubscribe",
            "eth_sendRawTransaction",
            "eth_gasPrice",
            "eth_blockNumber",
            "txpool_content",
            "made_up_method",
        ] {
            assert_eq!(cache_policy(method), CachePolicy::Never, "{method}");
        }
    }

    #[test]
    fn block_keyed_methods_know_their_param_position() {
        assert_eq!(
            cache_policy("eth_getBlockByNumber").block_param_index(),
            Some(0)
        );
        assert_eq!(cache_policy("eth_getBalance").block_param_index(), Some(1));
        assert_eq!(
            cache_policy("eth_getStorageAt").block_param_index(),
            Some(2)
        );
        assert_eq!(cache_policy("eth_chainId").block_param_index(), None);
    }

    #[test]
    fn sender_rate_limited_set_covers_raw_sends() {
        assert!(is_sender_rate_limited("eth_sendRawTransaction"));
        assert!(is_sender_rate_limited("eth_sendRawTransactionConditional"));
        assert!(!is_sender_rate_limited("eth_call"));
    }

    #[test]
    fn block_ref_reads_the_positional_tag() {
        let c = call("eth_getBalance", json!(["0xabc0000000000000000000", "latest"]));
        assert_eq!(block_ref(&c), Some(BlockRef::Latest));
        let c = call("eth_getBlockByNumber", json!(["0x10", false]));
        assert_eq!(block_ref(&c), Some(BlockRef::Number(0x10)));
    }

    #[test]
    fn missing_block_param_defaults_to_latest() {
        let c = call("eth_getBalance", json!(["0xabc0000000000000000000"]));
        assert_eq!(block_ref(&c), Some(BlockRef::Latest));
    }

    #[test]
    fn cache_key_is_stable_and_params_sensitive() {
        let a = call("eth_getBlockByNumber", json!(["0x10", false]));
        let b = call("eth_getBlockByNumber", json!(["0x10", false]));
        let c = call("eth_getBlockByNumber", json!(["0x11", false]));
        assert_eq!(cache_key(&a), cache_key(&b));
        assert_ne!(cache_key(&a), cache_key(&c));
        assert!(cache_key(&a).starts_with("eth_getBlockByNumber:"));
    }
}
