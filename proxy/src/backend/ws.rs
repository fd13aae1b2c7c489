// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;

use axum::extract::ws::{Message as ClientMessage, WebSocket};
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use rpc_core::error::RpcError;
use rpc_core::jsonrpc::{CallId, RpcCall, RpcResponse};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::group::BackendGroup;
use super::Backend;
use crate::metrics::ProxyMetrics;
use crate::router::MethodRouter;
use crate::server::error::ErrorMessages;

/// Proxies one client WebSocket through an eligible backend.
///
/// Each client gets exactly one upstream connection, taken against the
/// backend's `max_ws_conns` budget and released when either side hangs up.
/// Inbound calls pass the WS whitelist before forwarding; upstream frames,
/// subscription notifications included, are piped back unchanged.
pub async fn proxy_ws(
    group: Arc<BackendGroup>,
    router: Arc<MethodRouter>,
    messages: Arc<ErrorMessages>,
    metrics: Arc<ProxyMetrics>,
    mut client: WebSocket,
) {
    let Some(backend) = group.ws_backend().await else {
        send_client_error(&mut client, CallId::Null, RpcError::no_backends()).await;
        return;
    };

    ProxyMetrics::inc(&metrics.ws_connections_total);
    match connect_upstream(&backend).await {
        Ok(upstream) => {
            run_session(&router, &messages, client, upstream).await;
        }
        Err(err) => {
            warn!(backend = %backend.name(), error = %err, "upstream ws connect failed");
            send_client_error(
                &mut client,
                CallId::Null,
                RpcError::internal("cannot reach upstream websocket"),
            )
            .await;
        }
    }
    group.limiter().dec_ws_conns(backend.name()).await;
}

async fn connect_upstream(
    backend: &Arc<Backend>,
) -> Result<
    WebSocketStream<MaybeTlsStream<TcpStream>>,
    tokio_tungstenite::tungstenite::Error,
> {
    let ws_url = backend.config.ws_url.clone().unwrap_or_default();
    let mut request = ws_url.into_client_request()?;
    if let Some(username) = &backend.config.username {
        let credentials = format!(
            "{username}:{}",
            backend.config.password.as_deref().unwrap_or_default()
        );
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        request.headers_mut().insert(
            "Authorization",
            format!("Basic {encoded}")
                .parse()
                .expect("basic auth header is ascii"),
        );
    }
    let (stream, _) = connect_async(request).await?;
    Ok(stream)
}

async fn run_session(
    router: &MethodRouter,
    messages: &ErrorMessages,
    mut client: WebSocket,
    mut upstream: WebSocketStream<MaybeTlsStream<TcpStream>>,
) {
    loop {
        tokio::select! {
            inbound = client.recv() => {
                match inbound {
                    Some(Ok(ClientMessage::Text(text))) => {
                        match screen_inbound(router, messages, text.as_str()) {
                            Ok(()) => {
                                if upstream
                                    .send(UpstreamMessage::Text(text.to_string().into()))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err((id, error)) => {
                                send_client_error(&mut client, id, error).await;
                            }
                        }
                    }
                    Some(Ok(ClientMessage::Ping(payload))) => {
                        if client.send(ClientMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(ClientMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            outbound = upstream.next() => {
                match outbound {
                    Some(Ok(UpstreamMessage::Text(text))) => {
                        if client
                            .send(ClientMessage::Text(text.to_string().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(UpstreamMessage::Binary(data))) => {
                        if client.send(ClientMessage::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(UpstreamMessage::Ping(payload))) => {
                        if upstream.send(UpstreamMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(UpstreamMessage::Close(_))) | None => {
                        debug!("upstream closed websocket");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

/// Applies the same admission rules as HTTP to one inbound frame: it must
/// parse as a JSON-RPC call and its method must be WS-whitelisted.
fn screen_inbound(
    router: &MethodRouter,
    messages: &ErrorMessages,
    text: &str,
) -> Result<(), (CallId, RpcError)> {
    let call: RpcCall =
        serde_json::from_str(text).map_err(|_| (CallId::Null, RpcError::parse_error()))?;
    call.validate()
        .map_err(|err| (call.id.clone(), err))?;
    if !router.is_ws_allowed(&call.method) {
        return Err((call.id.clone(), messages.not_whitelisted()));
    }
    Ok(())
}

async fn send_client_error(client: &mut WebSocket, id: CallId, error: RpcError) {
    let response = RpcResponse::error(id, error);
    let Ok(body) = serde_json::to_string(&response) else {
        return;
    };
    let _ = client.send(ClientMessage::Text(body.into())).await;
}

#[cfg(test)]
mod tests {
    use super::screen_inbound;
    use crate::router::MethodRouter;
    use crate::server::error::ErrorMessages;
    use rpc_core::error::{CODE_METHOD_NOT_WHITELISTED, CODE_PARSE_ERROR};
    use rpc_core::jsonrpc::CallId;
    use std::collections::{HashMap, HashSet};

    fn router() -> MethodRouter {
        MethodRouter::new(
            HashMap::new(),
            HashSet::from(["eth_subscribe".to_string()]),
        )
    }

    #[test]
    fn whitelisted_frames_pass() {
        let messages = ErrorMessages::default();
        let frame = r#"{"jsonrpc":"2.0","id":1,"method":"eth_subscribe","params":["newHeads"]}"#;
        assert!(screen_inbound(&router(), &messages, frame).is_ok());
    }

    #[test]
    fn unparseable_frames_answer_with_null_id_parse_error() {
        let messages = ErrorMessages::default();
        let (id, error) = screen_inbound(&router(), &messages, "{oops").unwrap_err();
        assert_eq!(id, CallId::Null);
        assert_eq!(error.code, CODE_PARSE_ERROR);
    }

    #[test]
    fn non_whitelisted_methods_keep_their_id() {
        let messages = ErrorMessages::default();
        let frame = r#"{"jsonrpc":"2.0","id":5,"method":"eth_sendRawTransaction","params":[]}"#;
        let (id, error) = screen_inbound(&router(), &messages, frame).unwrap_err();
        assert_eq!(id, CallId::Number(5));
        assert_eq!(error.code, CODE_METHOD_NOT_WHITELISTED);
    }
}
