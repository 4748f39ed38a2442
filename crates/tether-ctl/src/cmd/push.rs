//! Push and broadcast commands.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::http::{base_url, post_json_body};

#[derive(Deserialize)]
struct PushReport {
    local: usize,
    relayed: usize,
    offline: usize,
    missed: usize,
}

#[derive(Deserialize)]
struct PushResponse {
    uid: u64,
    report: PushReport,
}

#[derive(Deserialize)]
struct BatchReport {
    targets: usize,
    totals: PushReport,
    failed: Vec<u64>,
}

#[derive(Serialize)]
struct BroadcastRequest<'a> {
    uids: &'a [u64],
    payload: String,
}

fn print_report(r: &PushReport) {
    println!("  Local   : {}", r.local);
    println!("  Relayed : {}", r.relayed);
    println!("  Offline : {}", r.offline);
    println!("  Missed  : {}", r.missed);
}

pub async fn cmd_push(addr: &str, uid: u64, device: Option<&str>, text: &str) -> Result<()> {
    let body = json!({
        "uid": uid,
        "device": device,
        "payload": hex::encode(text),
    });
    let resp: PushResponse = post_json_body(&format!("{}/push", base_url(addr)), &body).await?;

    println!("✓ Push to uid {}", resp.uid);
    print_report(&resp.report);
    Ok(())
}

pub async fn cmd_broadcast(addr: &str, text: &str, uids: &[u64]) -> Result<()> {
    let body = BroadcastRequest {
        uids,
        payload: hex::encode(text),
    };
    let resp: BatchReport = post_json_body(&format!("{}/broadcast", base_url(addr)), &body).await?;

    println!("✓ Broadcast to {} identities", resp.targets);
    print_report(&resp.totals);
    if !resp.failed.is_empty() {
        let failed: Vec<String> = resp.failed.iter().map(u64::to_string).collect();
        println!("  Failed  : {}", failed.join(", "));
    }
    Ok(())
}
