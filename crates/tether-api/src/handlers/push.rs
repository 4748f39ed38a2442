//! /push, /broadcast, /batch_push handlers: the surface other backend
//! services push through.

use std::collections::HashMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use tether_core::{Device, Uid};
use tether_services::{BatchReport, PushReport};

use super::{parse_payload, router_error, ApiState};

// ── /push ─────────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct PushRequest {
    pub uid: Uid,
    #[serde(default)]
    pub device: Option<Device>,
    /// Hex-encoded.
    pub payload: String,
}

#[derive(Serialize, Deserialize)]
pub struct PushResponse {
    pub uid: Uid,
    pub report: PushReport,
}

pub async fn handle_push(
    State(state): State<ApiState>,
    Json(req): Json<PushRequest>,
) -> Result<Json<PushResponse>, (StatusCode, String)> {
    let payload = parse_payload(&req.payload)?;
    let report = state
        .node
        .router
        .push(req.uid, req.device, payload)
        .await
        .map_err(router_error)?;

    Ok(Json(PushResponse {
        uid: req.uid,
        report,
    }))
}

// ── /broadcast ────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub uids: Vec<Uid>,
    pub payload: String,
}

pub async fn handle_broadcast(
    State(state): State<ApiState>,
    Json(req): Json<BroadcastRequest>,
) -> Result<Json<BatchReport>, (StatusCode, String)> {
    let payload = parse_payload(&req.payload)?;
    Ok(Json(state.node.router.broadcast(&req.uids, payload).await))
}

// ── /batch_push ───────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct BatchPushRequest {
    /// uid → hex payload.
    pub payloads: HashMap<Uid, String>,
}

pub async fn handle_batch_push(
    State(state): State<ApiState>,
    Json(req): Json<BatchPushRequest>,
) -> Result<Json<BatchReport>, (StatusCode, String)> {
    let payloads = req
        .payloads
        .iter()
        .map(|(uid, hex_str)| parse_payload(hex_str).map(|p| (*uid, p)))
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(Json(state.node.router.batch_push(payloads).await))
}
