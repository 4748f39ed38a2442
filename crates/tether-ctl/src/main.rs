//! tether-ctl: command-line interface for a Tether node.

use anyhow::{Context, Result};

mod cmd;

const DEFAULT_ADDR: &str = "127.0.0.1:7400";

fn parse_uid(s: &str) -> Result<u64> {
    s.parse().with_context(|| format!("invalid uid: {}", s))
}

fn print_usage() {
    println!("Usage: tether-ctl [--addr <host:port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                              Show node status and local connections");
    println!("  sessions <uid>                      List directory records of a uid");
    println!("  push <uid> <device|-> <text>        Push text to a uid (- for every device)");
    println!("  broadcast <text> <uid>...           Push the same text to several uids");
    println!();
    println!("Options:");
    println!("  --addr <host:port>   Node API address (default: {})", DEFAULT_ADDR);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --addr option
    let mut addr = DEFAULT_ADDR.to_string();
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--addr" {
            i += 1;
            addr = args.get(i).context("--addr requires a value")?.clone();
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => cmd::status::cmd_status(&addr).await,
        ["sessions", uid] => cmd::sessions::cmd_sessions(&addr, parse_uid(uid)?).await,
        ["push", uid, device, text] => {
            let device = (*device != "-").then_some(*device);
            cmd::push::cmd_push(&addr, parse_uid(uid)?, device, text).await
        }
        ["broadcast", text, uids @ ..] if !uids.is_empty() => {
            let uids = uids.iter().map(|u| parse_uid(u)).collect::<Result<Vec<_>>>()?;
            cmd::push::cmd_broadcast(&addr, text, &uids).await
        }
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
