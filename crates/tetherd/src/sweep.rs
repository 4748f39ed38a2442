//! Keepalive sweep: closes local sockets whose heartbeat is overdue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use tether_services::NodeContext;

pub async fn keepalive_loop(
    node: Arc<NodeContext>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.recv() => break,
        }

        let closed = node.sweep_keepalive(Instant::now()).await;
        if closed > 0 {
            tracing::info!(
                closed,
                tracked = node.keepalive.len(),
                "closed connections with overdue heartbeat"
            );
        }
    }
    tracing::debug!("keepalive sweep stopped");
}
