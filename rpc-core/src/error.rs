// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CODE_PARSE_ERROR: i64 = -32700;
pub const CODE_INVALID_REQUEST: i64 = -32600;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INTERNAL: i64 = -32603;
pub const CODE_NO_BACKENDS: i64 = -32011;
pub const CODE_TOO_MANY_BATCH_CALLS: i64 = -32014;
pub const CODE_OVER_RATE_LIMIT: i64 = -32016;
pub const CODE_OVER_SENDER_RATE_LIMIT: i64 = -32017;
pub const CODE_BODY_TOO_LARGE: i64 = -32021;
pub const CODE_UNAUTHENTICATED: i64 = -32022;
pub const CODE_METHOD_NOT_WHITELISTED: i64 = -32001;

/// JSON-RPC 2.0 error object, returned in the `error` slot of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error() -> Self {
        Self::new(CODE_PARSE_ERROR, "parse error")
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(CODE_INVALID_REQUEST, message)
    }

    pub fn method_not_found() -> Self {
        Self::new(CODE_METHOD_NOT_FOUND, "method not found")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CODE_INTERNAL, message)
    }

    pub fn no_backends() -> Self {
        Self::new(CODE_NO_BACKENDS, "no backends available for method")
    }

    pub fn method_not_whitelisted(message: impl Into<String>) -> Self {
        Self::new(CODE_METHOD_NOT_WHITELISTED, message)
    }

    pub fn over_rate_limit(message: impl Into<String>) -> Self {
        Self::new(CODE_OVER_RATE_LIMIT, message)
    }

    pub fn over_sender_rate_limit(message: impl Into<String>) -> Self {
        Self::new(CODE_OVER_SENDER_RATE_LIMIT, message)
    }

    pub fn too_many_batch_calls(message: impl Into<String>) -> Self {
        Self::new(CODE_TOO_MANY_BATCH_CALLS, message)
    }

    pub fn body_too_large() -> Self {
        Self::new(CODE_BODY_TOO_LARGE, "request body too large")
    }

    pub fn unauthenticated() -> Self {
        Self::new(CODE_UNAUTHENTICATED, "unauthorized")
    }

    pub fn is_client_error(&self) -> bool {
        self.code != CODE_INTERNAL && self.code != CODE_NO_BACKENDS
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

#[cfg(test)]
mod tests {
    use super::RpcError;

    #[test]
    fn error_serializes_without_null_data() {
        let json = serde_json::to_string(&RpcError::parse_error()).expect("serialize");
        assert_eq!(json, r#"{"code":-32700,"message":"parse error"}"#);
    }

    #[test]
    fn error_round_trips_with_data() {
        let mut err = RpcError::internal("backend failed");
        err.data = Some(serde_json::json!({"backend": "alchemy"}));
        let json = serde_json::to_string(&err).expect("serialize");
        let back: RpcError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, err);
    }
}
