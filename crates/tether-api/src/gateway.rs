//! Client socket endpoint: `GET /ws`.
//!
//! Identity is resolved and the session record written before the upgrade
//! completes, so an unauthenticated client or an unavailable directory is
//! answered with a plain HTTP status instead of a socket that dies at once.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{future, SinkExt, StreamExt};
use serde::Deserialize;

use tether_core::{Device, SessionRecord, Uid};
use tether_services::{ConnectRequest, FrameSink, NodeError, TransportError, TransportMessage};

use crate::handlers::{node_error, ApiState};

/// Header carrying the client identity for [`HeaderAuthenticator`].
pub const UID_HEADER: &str = "x-tether-uid";

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub device: Option<String>,
    pub uid: Option<Uid>,
}

/// Resolves the identity of an upgrade request.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap, params: &ConnectParams) -> Option<Uid>;
}

/// Trusts the `x-tether-uid` header, falling back to the `uid` query
/// parameter. Meant for deployments where an upstream proxy authenticates.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderAuthenticator;

impl Authenticator for HeaderAuthenticator {
    fn authenticate(&self, headers: &HeaderMap, params: &ConnectParams) -> Option<Uid> {
        headers
            .get(UID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .or(params.uid)
    }
}

pub async fn handle_ws(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
) -> Response {
    if state.node.is_draining() {
        return node_error(NodeError::Draining).into_response();
    }
    let Some(uid) = state.auth.authenticate(&headers, &params) else {
        return (StatusCode::UNAUTHORIZED, "unknown client identity".to_string()).into_response();
    };
    let device = match params.device.as_deref().map(str::parse::<Device>).transpose() {
        Ok(d) => d.unwrap_or_default(),
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let req = ConnectRequest {
        uid,
        device,
        ip: addr.ip().to_string(),
    };
    let record = match state.node.admit(&req).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(uid, error = %e, "connect rejected");
            return node_error(e).into_response();
        }
    };

    let session_id = record.id.clone();
    let failed_state = state.clone();
    ws.on_failed_upgrade(move |e| {
        tracing::warn!(session_id = %session_id, error = %e, "websocket upgrade failed");
        tokio::spawn(async move {
            if let Err(e) = failed_state.node.lifecycle.release(&session_id).await {
                tracing::warn!(session_id = %session_id, error = %e, "release after failed upgrade");
            }
        });
    })
    .on_upgrade(move |socket| run_socket(state, record, socket))
}

async fn run_socket(state: ApiState, record: SessionRecord, socket: WebSocket) {
    let (sink, stream) = socket.split();

    let sink: FrameSink = Box::pin(
        sink.sink_map_err(|e| TransportError(e.to_string()))
            .with(|msg: TransportMessage| future::ready(Ok::<_, TransportError>(to_ws(msg)))),
    );
    let reader = stream.map(|r| r.map(from_ws).map_err(|e| TransportError(e.to_string())));

    let conn = state.node.attach(record, sink);
    state.node.run(conn, reader).await;
}

fn to_ws(msg: TransportMessage) -> Message {
    match msg {
        TransportMessage::Binary(b) => Message::Binary(b),
        TransportMessage::Text(t) => Message::Text(t.into()),
        TransportMessage::Ping(b) => Message::Ping(b),
        TransportMessage::Pong(b) => Message::Pong(b),
        TransportMessage::Close => Message::Close(None),
    }
}

fn from_ws(msg: Message) -> TransportMessage {
    match msg {
        Message::Binary(b) => TransportMessage::Binary(b),
        Message::Text(t) => TransportMessage::Text(t.as_str().to_owned()),
        Message::Ping(b) => TransportMessage::Ping(b),
        Message::Pong(b) => TransportMessage::Pong(b),
        Message::Close(_) => TransportMessage::Close,
    }
}
