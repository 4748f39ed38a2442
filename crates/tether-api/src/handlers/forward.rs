//! /forward handler: inbound relays from other gateway nodes.

use axum::extract::State;
use axum::Json;

use tether_core::{ForwardAck, ForwardRequest};

use super::ApiState;

pub async fn handle_forward(
    State(state): State<ApiState>,
    Json(req): Json<ForwardRequest>,
) -> Json<ForwardAck> {
    let items = req.items.len();
    let origin = req.origin.clone();
    let ack = state.node.forwarder.handle_forward(req).await;
    tracing::debug!(
        origin = %origin,
        items,
        accepted = ack.accepted,
        dropped = ack.dropped,
        "relay handled"
    );
    Json(ack)
}
