// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

pub mod group;
pub mod ws;

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rpc_core::jsonrpc::{CallId, RpcCall, RpcResponse};
use thiserror::Error;
use tracing::debug;

use crate::consensus::ConsensusObservation;

/// Samples kept in the rolling latency/error windows.
const ROLLING_WINDOW: usize = 64;

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub rpc_url: String,
    pub ws_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub max_rps: u64,
    pub max_ws_conns: u64,
    pub timeout: Duration,
    pub max_response_bytes: usize,
    /// Continuous connection/5xx failures for this long take the backend
    /// out of service; the same duration is the cooldown.
    pub out_of_service_window: Duration,
    pub max_degraded_latency: Duration,
    pub max_latency: Duration,
    pub max_error_rate: f64,
    pub skip_peer_count_check: bool,
    pub strip_trailing_xff: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            rpc_url: String::new(),
            ws_url: None,
            username: None,
            password: None,
            max_rps: 0,
            max_ws_conns: 0,
            timeout: Duration::from_secs(10),
            max_response_bytes: 32 * 1024 * 1024,
            out_of_service_window: Duration::from_secs(30),
            max_degraded_latency: Duration::from_secs(5),
            max_latency: Duration::from_secs(10),
            max_error_rate: 0.5,
            skip_peer_count_check: false,
            strip_trailing_xff: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
    OutOfService,
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("backend request failed")]
    Transport {
        #[source]
        source: reqwest::Error,
    },
    #[error("backend returned http status {status}")]
    Http { status: u16 },
    #[error("backend response exceeded {max_bytes} bytes")]
    ResponseTooLarge { max_bytes: usize },
    #[error("backend returned malformed response: {reason}")]
    Malformed { reason: String },
    #[error("backend is over its rate limit")]
    OverCapacity,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    latency: Duration,
    error: bool,
}

#[derive(Debug)]
struct BackendState {
    samples: VecDeque<Sample>,
    failure_run_started: Option<Instant>,
    out_of_service_until: Option<Instant>,
}

impl BackendState {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(ROLLING_WINDOW),
            failure_run_started: None,
            out_of_service_until: None,
        }
    }

    fn push(&mut self, sample: Sample) {
        if self.samples.len() == ROLLING_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn rolling_latency(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().map(|s| s.latency).sum();
        total / self.samples.len() as u32
    }

    fn error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let errors = self.samples.iter().filter(|s| s.error).count();
        errors as f64 / self.samples.len() as f64
    }

    fn health_at(&self, now: Instant, config: &BackendConfig) -> Health {
        if matches!(self.out_of_service_until, Some(until) if now < until) {
            return Health::OutOfService;
        }
        if self.error_rate() >= config.max_error_rate
            || self.rolling_latency() >= config.max_latency
        {
            return Health::Unhealthy;
        }
        if self.rolling_latency() >= config.max_degraded_latency {
            return Health::Degraded;
        }
        Health::Healthy
    }
}

/// One upstream node endpoint: forwards batches, tracks rolling latency and
/// error rate, and drives its own health state. Shared read-only by every
/// group that includes it; all mutation funnels through the completion paths
/// of `forward` and the consensus poller's observation callback.
pub struct Backend {
    pub config: BackendConfig,
    client: reqwest::Client,
    state: Mutex<BackendState>,
    observation: Mutex<Option<ConsensusObservation>>,
}

impl Backend {
    pub fn new(config: BackendConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            state: Mutex::new(BackendState::new()),
            observation: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn health(&self) -> Health {
        let state = self.state.lock().expect("backend state mutex poisoned");
        state.health_at(Instant::now(), &self.config)
    }

    pub fn rolling_latency(&self) -> Duration {
        let state = self.state.lock().expect("backend state mutex poisoned");
        state.rolling_latency()
    }

    pub fn error_rate(&self) -> f64 {
        let state = self.state.lock().expect("backend state mutex poisoned");
        state.error_rate()
    }

    pub fn set_observation(&self, observation: ConsensusObservation) {
        let mut slot = self
            .observation
            .lock()
            .expect("backend observation mutex poisoned");
        *slot = Some(observation);
    }

    pub fn observation(&self) -> Option<ConsensusObservation> {
        self.observation
            .lock()
            .expect("backend observation mutex poisoned")
            .clone()
    }

    /// Serializes the batch, POSTs it under the backend timeout, bounds the
    /// response size, and validates that every response id answers exactly
    /// one request id. Latency, error rate and health are updated as a side
    /// effect. Never retries; retry is the group's job so the next attempt
    /// can pick a different backend.
    ///
    /// A dropped future (client cancellation) records nothing: the backend
    /// did not fail, the client left.
    pub async fn forward(
        &self,
        calls: &[RpcCall],
        single: bool,
        xff: Option<&str>,
    ) -> Result<Vec<RpcResponse>, ForwardError> {
        let body = if single {
            serde_json::to_vec(&calls[0])
        } else {
            serde_json::to_vec(calls)
        }
        .map_err(|err| ForwardError::Malformed {
            reason: format!("cannot serialize batch: {err}"),
        })?;

        let started = Instant::now();
        let outcome = self.send(body, xff).await;
        let latency = started.elapsed();

        let bytes = match outcome {
            Ok(bytes) => bytes,
            Err(err) => {
                self.record_failure(latency, is_connection_class(&err));
                return Err(err);
            }
        };

        match parse_responses(&bytes, calls, single) {
            Ok(responses) => {
                self.record_success(latency);
                Ok(responses)
            }
            Err(err) => {
                self.record_failure(latency, false);
                Err(err)
            }
        }
    }

    async fn send(&self, body: Vec<u8>, xff: Option<&str>) -> Result<Vec<u8>, ForwardError> {
        let mut request = self
            .client
            .post(&self.config.rpc_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(self.config.timeout)
            .body(body);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_deref());
        }
        if let Some(xff) = xff {
            let value = if self.config.strip_trailing_xff {
                strip_trailing_hop(xff)
            } else {
                xff.to_string()
            };
            if !value.is_empty() {
                request = request.header("X-Forwarded-For", value);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|source| ForwardError::Transport { source })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ForwardError::Http {
                status: status.as_u16(),
            });
        }

        let max_bytes = self.config.max_response_bytes;
        let mut body = Vec::new();
        let mut response = response;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|source| ForwardError::Transport { source })?
        {
            if body.len() + chunk.len() > max_bytes {
                return Err(ForwardError::ResponseTooLarge { max_bytes });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    pub(crate) fn record_success(&self, latency: Duration) {
        let mut state = self.state.lock().expect("backend state mutex poisoned");
        state.push(Sample {
            latency,
            error: false,
        });
        if state.failure_run_started.is_some() || state.out_of_service_until.is_some() {
            debug!(backend = %self.config.name, "backend recovered");
        }
        state.failure_run_started = None;
        state.out_of_service_until = None;
    }

    pub(crate) fn record_failure(&self, latency: Duration, connection_class: bool) {
        let now = Instant::now();
        let mut state = self.state.lock().expect("backend state mutex poisoned");
        state.push(Sample {
            latency,
            error: true,
        });
        if !connection_class {
            return;
        }
        let run_started = *state.failure_run_started.get_or_insert(now);
        if now.duration_since(run_started) >= self.config.out_of_service_window
            && state.out_of_service_until.is_none()
        {
            state.out_of_service_until = Some(now + self.config.out_of_service_window);
            debug!(backend = %self.config.name, "backend taken out of service");
        }
    }
}

fn is_connection_class(err: &ForwardError) -> bool {
    match err {
        ForwardError::Transport { .. } => true,
        ForwardError::Http { status } => *status >= 500,
        _ => false,
    }
}

/// Drops the last hop from a comma-separated X-Forwarded-For chain.
fn strip_trailing_hop(xff: &str) -> String {
    match xff.rsplit_once(',') {
        Some((head, _)) => head.trim_end().to_string(),
        None => String::new(),
    }
}

fn parse_responses(
    bytes: &[u8],
    calls: &[RpcCall],
    single: bool,
) -> Result<Vec<RpcResponse>, ForwardError> {
    let responses: Vec<RpcResponse> = if single {
        let response: RpcResponse =
            serde_json::from_slice(bytes).map_err(|err| ForwardError::Malformed {
                reason: format!("invalid response object: {err}"),
            })?;
        vec![response]
    } else {
        serde_json::from_slice(bytes).map_err(|err| ForwardError::Malformed {
            reason: format!("invalid response batch: {err}"),
        })?
    };

    // Each response id must answer a request id, and no id twice. Null ids
    // are tolerated: upstreams answer unparseable entries that way.
    let request_ids: HashSet<&CallId> = calls.iter().map(|call| &call.id).collect();
    let mut seen: HashSet<&CallId> = HashSet::with_capacity(responses.len());
    for response in &responses {
        if response.id.is_null() {
            continue;
        }
        if !request_ids.contains(&response.id) {
            return Err(ForwardError::Malformed {
                reason: "response id does not match any request id".to_string(),
            });
        }
        if !seen.insert(&response.id) {
            return Err(ForwardError::Malformed {
                reason: "duplicate response id".to_string(),
            });
        }
    }
    Ok(responses)
}

/// Builds the upstream HTTP client for a backend, wiring in custom TLS
/// material when configured.
pub fn build_client(
    ca_pem: Option<&[u8]>,
    identity_pem: Option<&[u8]>,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(pem) = ca_pem {
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
    }
    if let Some(pem) = identity_pem {
        builder = builder.identity(reqwest::Identity::from_pem(pem)?);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::{
        parse_responses, strip_trailing_hop, Backend, BackendConfig, ForwardError, Health,
    };
    use rpc_core::jsonrpc::{CallId, RpcCall};
    use std::time::Duration;

    fn test_backend(config: BackendConfig) -> Backend {
        Backend::new(config, reqwest::Client::new())
    }

    fn config() -> BackendConfig {
        BackendConfig {
            name: "test".to_string(),
            rpc_url: "http://127.0.0.1:0".to_string(),
            max_degraded_latency: Duration::from_millis(100),
            max_latency: Duration::from_millis(500),
            max_error_rate: 0.5,
            out_of_service_window: Duration::from_millis(20),
            ..BackendConfig::default()
        }
    }

    fn calls(ids: &[i64]) -> Vec<RpcCall> {
        ids.iter()
            .map(|id| RpcCall::new(CallId::Number(*id), "eth_chainId", None))
            .collect()
    }

    #[test]
    fn fresh_backend_is_healthy() {
        assert_eq!(test_backend(config()).health(), Health::Healthy);
    }

    #[test]
    fn slow_forwards_degrade_then_unhealthy() {
        let backend = test_backend(config());
        backend.record_success(Duration::from_millis(200));
        assert_eq!(backend.health(), Health::Degraded);
        backend.record_success(Duration::from_millis(900));
        // Rolling average of 200ms and 900ms crosses the 500ms bar.
        assert_eq!(backend.health(), Health::Unhealthy);
    }

    #[test]
    fn error_rate_over_threshold_is_unhealthy() {
        let backend = test_backend(config());
        backend.record_success(Duration::from_millis(1));
        backend.record_failure(Duration::from_millis(1), false);
        assert_eq!(backend.error_rate(), 0.5);
        assert_eq!(backend.health(), Health::Unhealthy);
    }

    #[test]
    fn continuous_connection_failures_trip_out_of_service() {
        let backend = test_backend(config());
        backend.record_failure(Duration::from_millis(1), true);
        assert_ne!(backend.health(), Health::OutOfService);

        std::thread::sleep(Duration::from_millis(25));
        backend.record_failure(Duration::from_millis(1), true);
        assert_eq!(backend.health(), Health::OutOfService);
    }

    #[test]
    fn success_clears_out_of_service_and_failure_run() {
        let backend = test_backend(config());
        backend.record_failure(Duration::from_millis(1), true);
        std::thread::sleep(Duration::from_millis(25));
        backend.record_failure(Duration::from_millis(1), true);
        assert_eq!(backend.health(), Health::OutOfService);

        for _ in 0..4 {
            backend.record_success(Duration::from_millis(1));
        }
        assert_eq!(backend.health(), Health::Healthy);
    }

    #[test]
    fn client_error_statuses_do_not_start_a_failure_run() {
        let backend = test_backend(config());
        backend.record_failure(Duration::from_millis(1), false);
        std::thread::sleep(Duration::from_millis(25));
        backend.record_failure(Duration::from_millis(1), false);
        assert_ne!(backend.health(), Health::OutOfService);
    }

    #[test]
    fn parse_accepts_matching_ids_in_any_order() {
        let calls = calls(&[1, 2]);
        let body = br#"[{"jsonrpc":"2.0","id":2,"result":"0x2"},{"jsonrpc":"2.0","id":1,"result":"0x1"}]"#;
        let responses = parse_responses(body, &calls, false).expect("parse");
        assert_eq!(responses.len(), 2);
    }

    #[test]
    fn parse_rejects_unknown_and_duplicate_ids() {
        let single_call = calls(&[1]);
        let unknown = br#"[{"jsonrpc":"2.0","id":9,"result":"0x"}]"#;
        assert!(matches!(
            parse_responses(unknown, &single_call, false),
            Err(ForwardError::Malformed { .. })
        ));

        let paired_calls = calls(&[1, 2]);
        let duplicated =
            br#"[{"jsonrpc":"2.0","id":1,"result":"a"},{"jsonrpc":"2.0","id":1,"result":"b"}]"#;
        assert!(matches!(
            parse_responses(duplicated, &paired_calls, false),
            Err(ForwardError::Malformed { .. })
        ));
    }

    #[test]
    fn strip_trailing_hop_drops_the_last_entry() {
        assert_eq!(strip_trailing_hop("1.1.1.1, 2.2.2.2"), "1.1.1.1");
        assert_eq!(strip_trailing_hop("1.1.1.1"), "");
    }
}
