//! HTTP API handlers: push surface, relay surface and node inspection.

pub mod forward;
pub mod push;
pub mod sessions;
pub mod status;

use std::sync::Arc;

use axum::http::StatusCode;
use bytes::Bytes;

use tether_services::{DirectoryError, NodeContext, NodeError, RouterError};

use crate::gateway::Authenticator;

#[derive(Clone)]
pub struct ApiState {
    pub node: Arc<NodeContext>,
    pub auth: Arc<dyn Authenticator>,
}

impl ApiState {
    pub fn new(node: Arc<NodeContext>, auth: Arc<dyn Authenticator>) -> Self {
        Self { node, auth }
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Parse a hex-encoded payload.
fn parse_payload(hex_str: &str) -> Result<Bytes, (StatusCode, String)> {
    hex::decode(hex_str)
        .map(Bytes::from)
        .map_err(|_| (StatusCode::BAD_REQUEST, "payload must be hex".to_string()))
}

pub(crate) fn directory_error(e: DirectoryError) -> (StatusCode, String) {
    let status = match &e {
        DirectoryError::NotFound(_) => StatusCode::NOT_FOUND,
        DirectoryError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        DirectoryError::Corrupt { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

pub(crate) fn router_error(e: RouterError) -> (StatusCode, String) {
    match e {
        RouterError::Directory(e) => directory_error(e),
        RouterError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, e.to_string()),
    }
}

pub(crate) fn node_error(e: NodeError) -> (StatusCode, String) {
    match e {
        NodeError::Draining => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        NodeError::Directory(e) => directory_error(e),
    }
}

// Re-export handler functions for use in router setup.
pub use forward::handle_forward;
pub use push::{handle_batch_push, handle_broadcast, handle_push};
pub use sessions::handle_sessions;
pub use status::handle_status;
