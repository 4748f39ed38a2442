//! Node status command.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct StatusResponse {
    identity: String,
    draining: bool,
    connections: Vec<ConnectionInfo>,
    keepalive_tracked: usize,
    max_hops: u32,
}

#[derive(Deserialize)]
struct ConnectionInfo {
    session_id: String,
    uid: u64,
    device: String,
    ip: String,
    established_secs: u64,
}

pub async fn cmd_status(addr: &str) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(addr))).await?;

    println!("═══════════════════════════════════════");
    println!("  Tether Node Status");
    println!("═══════════════════════════════════════");
    println!("  Identity          : {}", resp.identity);
    println!("  Draining          : {}", if resp.draining { "yes" } else { "no" });
    println!("  Connections       : {}", resp.connections.len());
    println!("  Keepalive tracked : {}", resp.keepalive_tracked);
    println!("  Max relay hops    : {}", resp.max_hops);

    if resp.connections.is_empty() {
        println!("\n  No local connections.");
    } else {
        println!("\n  Connections:");
        for c in &resp.connections {
            println!("  ┌─ {}", c.session_id);
            println!("  │  uid    : {}", c.uid);
            println!("  │  device : {}", c.device);
            println!("  │  ip     : {}", c.ip);
            println!("  └─ uptime : {}s", c.established_secs);
        }
    }

    Ok(())
}
