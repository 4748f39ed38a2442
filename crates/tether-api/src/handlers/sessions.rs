//! /sessions handler: directory records for one identity.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use tether_core::{SessionRecord, Uid};

use super::{directory_error, ApiState};

#[derive(Serialize, Deserialize)]
pub struct SessionsResponse {
    pub uid: Uid,
    pub sessions: Vec<SessionRecord>,
}

pub async fn handle_sessions(
    State(state): State<ApiState>,
    Path(uid): Path<Uid>,
) -> Result<Json<SessionsResponse>, (StatusCode, String)> {
    let mut sessions = state
        .node
        .directory
        .get_by_uid(uid)
        .await
        .map_err(directory_error)?;
    sessions.sort_by(|a, b| a.ctime.cmp(&b.ctime).then_with(|| a.id.cmp(&b.id)));

    Ok(Json(SessionsResponse { uid, sessions }))
}
