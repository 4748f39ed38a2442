//! /status handler.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::ApiState;

#[derive(Serialize, Deserialize)]
pub struct StatusResponse {
    pub identity: String,
    pub draining: bool,
    pub connections: Vec<ConnectionInfo>,
    pub keepalive_tracked: usize,
    pub max_hops: u32,
}

#[derive(Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub session_id: String,
    pub uid: u64,
    pub device: String,
    pub ip: String,
    pub established_secs: u64,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let node = &state.node;
    let mut connections: Vec<ConnectionInfo> = node
        .connections
        .snapshot()
        .iter()
        .map(|c| ConnectionInfo {
            session_id: c.id().to_string(),
            uid: c.uid(),
            device: c.device().to_string(),
            ip: c.ip().to_string(),
            established_secs: c.established_at().elapsed().as_secs(),
        })
        .collect();
    connections.sort_by(|a, b| a.session_id.cmp(&b.session_id));

    Json(StatusResponse {
        identity: node.identity.clone(),
        draining: node.is_draining(),
        connections,
        keepalive_tracked: node.keepalive.len(),
        max_hops: node.forwarder.max_hops(),
    })
}
