// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! JSON-RPC reverse proxy for pools of upstream execution nodes.
//!
//! Flow: listener -> auth/limits -> cache -> method router -> backend group
//! -> backend. Consensus pollers keep each group routing only to upstreams
//! that agree on the chain head.
pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod consensus;
pub mod limiter;
pub mod metrics;
pub mod router;
pub mod sender;
pub mod server;
