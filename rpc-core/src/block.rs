// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("quantity must be a 0x-prefixed hex string")]
    MissingPrefix,
    #[error("invalid hex quantity: {0}")]
    InvalidHex(String),
}

/// Parses an Ethereum hex quantity such as `0x1b4`.
pub fn parse_quantity(value: &str) -> Result<u64, QuantityError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or(QuantityError::MissingPrefix)?;
    if digits.is_empty() {
        return Err(QuantityError::InvalidHex(value.to_string()));
    }
    u64::from_str_radix(digits, 16).map_err(|_| QuantityError::InvalidHex(value.to_string()))
}

/// Formats a block number as a minimal hex quantity (`0x0`, `0x1b4`).
pub fn format_quantity(value: u64) -> String {
    format!("0x{value:x}")
}

/// Block reference as it appears in a positional RPC parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRef {
    Latest,
    Safe,
    Finalized,
    Pending,
    Earliest,
    Number(u64),
    /// 32-byte block hash, kept verbatim.
    Hash(String),
}

impl BlockRef {
    /// Reads a block reference out of a JSON parameter. Non-string shapes
    /// (EIP-1898 objects included) are left to the upstream to interpret.
    pub fn from_param(param: &Value) -> Option<Self> {
        let text = param.as_str()?;
        Some(match text {
            "latest" => Self::Latest,
            "safe" => Self::Safe,
            "finalized" => Self::Finalized,
            "pending" => Self::Pending,
            "earliest" => Self::Earliest,
            other if other.len() == 66 && other.starts_with("0x") => Self::Hash(other.to_string()),
            other => Self::Number(parse_quantity(other).ok()?),
        })
    }

    /// True for the tags that consensus-aware routing rewrites to numbers.
    pub fn is_rewritable_tag(&self) -> bool {
        matches!(self, Self::Latest | Self::Safe | Self::Finalized)
    }

    pub fn number(&self) -> Option<u64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }
}
