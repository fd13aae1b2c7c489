// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use crate::backend::group::BackendGroup;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("method not whitelisted")]
    NotWhitelisted,
    #[error("no backend group for method")]
    NoGroup,
}

/// Immutable method-to-group mapping plus the WebSocket method whitelist.
/// Built once at startup; a method is whitelisted for HTTP iff it has a
/// mapping.
pub struct MethodRouter {
    mappings: HashMap<String, Arc<BackendGroup>>,
    ws_whitelist: HashSet<String>,
}

impl MethodRouter {
    pub fn new(
        mappings: HashMap<String, Arc<BackendGroup>>,
        ws_whitelist: HashSet<String>,
    ) -> Self {
        Self {
            mappings,
            ws_whitelist,
        }
    }

    pub fn route(&self, method: &str) -> Result<&Arc<BackendGroup>, RouteError> {
        match self.mappings.get(method) {
            Some(group) => Ok(group),
            None => Err(RouteError::NotWhitelisted),
        }
    }

    pub fn is_ws_allowed(&self, method: &str) -> bool {
        self.ws_whitelist.contains(method)
    }

    /// Mapped method names, for diagnostics.
    pub fn methods(&self) -> BTreeSet<&str> {
        self.mappings.keys().map(String::as_str).collect()
    }
}
