//! Directory inspection command.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct SessionsResponse {
    uid: u64,
    sessions: Vec<SessionRecord>,
}

#[derive(Deserialize)]
struct SessionRecord {
    id: String,
    device: String,
    status: String,
    last_active_time: u64,
    reside: String,
    ip: String,
}

pub async fn cmd_sessions(addr: &str, uid: u64) -> Result<()> {
    let resp: SessionsResponse = get_json(&format!("{}/sessions/{}", base_url(addr), uid)).await?;

    if resp.sessions.is_empty() {
        println!("No sessions for uid {}.", resp.uid);
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Sessions of uid {} ({})", resp.uid, resp.sessions.len());
    println!("═══════════════════════════════════════");
    for s in &resp.sessions {
        println!("  ┌─ {}", s.id);
        println!("  │  device      : {}", s.device);
        println!("  │  status      : {}", s.status);
        println!("  │  reside      : {}", s.reside);
        println!("  │  ip          : {}", s.ip);
        println!("  └─ last active : {}", s.last_active_time);
    }

    Ok(())
}
