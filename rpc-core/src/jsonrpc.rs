// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Request id as allowed by JSON-RPC 2.0: number, string or null.
///
/// Ids are carried untouched through the whole pipeline so that responses
/// can be reassembled in the order the client sent the calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallId {
    Number(i64),
    String(String),
    Null,
}

impl CallId {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCall {
    pub jsonrpc: String,
    #[serde(default = "null_id")]
    pub id: CallId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

fn null_id() -> CallId {
    CallId::Null
}

impl RpcCall {
    pub fn new(id: CallId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(RpcError::invalid_request("jsonrpc version must be 2.0"));
        }
        if self.method.is_empty() {
            return Err(RpcError::invalid_request("no method specified"));
        }
        Ok(())
    }

    /// Positional parameter at `index`, if the call carries an array of params.
    pub fn param(&self, index: usize) -> Option<&Value> {
        match &self.params {
            Some(Value::Array(values)) => values.get(index),
            _ => None,
        }
    }

    pub fn set_param(&mut self, index: usize, value: Value) {
        if let Some(Value::Array(values)) = &mut self.params {
            if let Some(slot) = values.get_mut(index) {
                *slot = value;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default = "null_id")]
    pub id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn result(id: CallId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: CallId, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Inbound payload shape. A batch keeps its array framing on the way out
/// even when it holds a single call.
#[derive(Debug, Clone)]
pub enum Payload {
    Single(Box<Value>),
    Batch(Vec<Value>),
}

impl Payload {
    /// Splits raw bytes into per-call JSON values without judging the calls
    /// themselves. Malformed entries stay as raw values so the caller can
    /// answer them with a per-slot invalid-request error.
    pub fn parse(body: &[u8]) -> Result<Self, RpcError> {
        let value: Value = serde_json::from_slice(body).map_err(|_| RpcError::parse_error())?;
        match value {
            Value::Array(entries) => {
                if entries.is_empty() {
                    return Err(RpcError::invalid_request("empty batch"));
                }
                Ok(Self::Batch(entries))
            }
            other => Ok(Self::Single(Box::new(other))),
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Self::Batch(_))
    }

    pub fn into_entries(self) -> Vec<Value> {
        match self {
            Self::Single(value) => vec![*value],
            Self::Batch(entries) => entries,
        }
    }
}

/// Reorders `responses` to match the id order of `calls`.
///
/// Every call gets exactly one slot; a call whose id never came back is
/// answered with an internal error so the batch-shape invariant
/// `|responses| == |calls|` holds even against a misbehaving upstream.
pub fn order_responses(calls: &[RpcCall], responses: Vec<RpcResponse>) -> Vec<RpcResponse> {
    let mut by_id: Vec<Option<RpcResponse>> = responses.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(calls.len());

    for call in calls {
        let found = by_id
            .iter_mut()
            .find(|slot| matches!(slot, Some(resp) if resp.id == call.id))
            .and_then(Option::take);
        ordered.push(found.unwrap_or_else(|| {
            RpcResponse::error(
                call.id.clone(),
                RpcError::internal("backend omitted response for call"),
            )
        }));
    }
    ordered
}

/// Splits a batch into chunks of at most `max` calls. `max == 0` means no
/// upstream batch limit.
pub fn chunk_calls(calls: &[RpcCall], max: usize) -> Vec<&[RpcCall]> {
    if max == 0 || calls.len() <= max {
        return vec![calls];
    }
    calls.chunks(max).collect()
}
