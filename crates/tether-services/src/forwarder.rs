//! Forwarder: relays pushes for sessions whose socket lives on another node.
//!
//! Every relay carries `hop_count + 1`. An item whose hop count would exceed
//! the ceiling is dropped and logged, never sent on, so relay chains built
//! from stale or oscillating presence data always terminate. Relay failures
//! are logged and not retried.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};

use tether_core::config::ForwardConfig;
use tether_core::{ForwardAck, ForwardItem, ForwardRequest, NodeId, SessionId, SessionRecord, Status};

use crate::directory::{DirectoryError, SessionDirectory};
use crate::table::ConnectionTable;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("relay to {node} failed: {reason}")]
    Failed { node: NodeId, reason: String },
    #[error("relay to {node} rejected with status {status}")]
    Rejected { node: NodeId, status: u16 },
}

/// Node-to-node relay RPC.
#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn push_forward(&self, node: &str, request: ForwardRequest) -> Result<ForwardAck, RelayError>;
}

/// Session ids split by where their socket lives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    /// A live connection exists on this node.
    pub local: Vec<SessionId>,
    /// Resolvable in the directory, not held here.
    pub remote: Vec<SessionRecord>,
}

/// Result of one outbound relay round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardOutcome {
    /// Items the destination acknowledged receiving.
    pub relayed: usize,
    /// Items whose relay call failed or timed out.
    pub failed: usize,
    /// Items not sent: stale self-residence or hop ceiling reached.
    pub skipped: usize,
}

pub struct Forwarder {
    identity: NodeId,
    directory: SessionDirectory,
    connections: ConnectionTable,
    relay: Arc<dyn RelayClient>,
    max_hops: u32,
    relay_timeout: Duration,
    relay_concurrency: usize,
}

impl Forwarder {
    pub fn new(
        identity: NodeId,
        directory: SessionDirectory,
        connections: ConnectionTable,
        relay: Arc<dyn RelayClient>,
        config: &ForwardConfig,
    ) -> Self {
        Self {
            identity,
            directory,
            connections,
            relay,
            max_hops: config.max_hops,
            relay_timeout: config.relay_timeout(),
            relay_concurrency: config.relay_concurrency.max(1),
        }
    }

    pub fn max_hops(&self) -> u32 {
        self.max_hops
    }

    /// Split `ids` into local and remote. Ids that resolve nowhere appear in
    /// neither group.
    pub async fn respectively_get_session_by_ids(
        &self,
        ids: &[SessionId],
    ) -> Result<Partition, DirectoryError> {
        let mut partition = Partition::default();
        let mut unresolved = Vec::new();
        let mut seen = HashSet::new();

        for id in ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            if self.connections.contains(id) {
                partition.local.push(id.clone());
            } else {
                unresolved.push(id.clone());
            }
        }

        let records = self.directory.get_many(&unresolved).await?;
        partition.remote = records.into_iter().flatten().collect();
        Ok(partition)
    }

    /// Relay `payload` to the owners of `targets`, one batched call per node.
    pub async fn forward(&self, targets: &[SessionRecord], payload: Bytes, hop_count: u32) -> ForwardOutcome {
        let mut groups: HashMap<NodeId, Vec<ForwardItem>> = HashMap::new();
        let mut skipped = 0;

        for target in targets {
            if let Some(item) = self.outbound_item(target, payload.clone(), hop_count) {
                groups.entry(target.reside.clone()).or_default().push(item);
            } else {
                skipped += 1;
            }
        }

        let mut outcome = self.relay_groups(groups).await;
        outcome.skipped += skipped;
        outcome
    }

    /// Handle a relay from another node. Each item is resolved like a fresh
    /// push: delivered if local, re-forwarded if active elsewhere, otherwise
    /// dropped.
    pub async fn handle_forward(&self, request: ForwardRequest) -> ForwardAck {
        let mut ack = ForwardAck::default();
        let mut pending = Vec::new();

        for item in request.items {
            if item.hop_count > self.max_hops {
                tracing::warn!(
                    session_id = %item.session_id,
                    hop_count = item.hop_count,
                    max_hops = self.max_hops,
                    origin = %request.origin,
                    "hop limit exceeded, dropping relayed push"
                );
                ack.dropped += 1;
                continue;
            }
            pending.push(item);
        }
        if pending.is_empty() {
            return ack;
        }

        let ids: Vec<SessionId> = pending.iter().map(|i| i.session_id.clone()).collect();
        let partition = match self.respectively_get_session_by_ids(&ids).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(origin = %request.origin, error = %e, "cannot resolve relayed push");
                ack.dropped += pending.len();
                return ack;
            }
        };

        let local: HashSet<&str> = partition.local.iter().map(String::as_str).collect();
        let remote: HashMap<&str, &SessionRecord> = partition
            .remote
            .iter()
            .map(|r| (r.id.as_str(), r))
            .collect();

        let mut groups: HashMap<NodeId, Vec<ForwardItem>> = HashMap::new();
        for item in pending {
            let id = item.session_id.as_str();
            if local.contains(id) {
                if self.connections.deliver(id, item.payload.clone()).await {
                    ack.accepted += 1;
                } else {
                    ack.dropped += 1;
                }
                continue;
            }

            let onward = remote
                .get(id)
                .filter(|r| r.status == Status::Active)
                .and_then(|r| self.outbound_item(r, item.payload.clone(), item.hop_count).map(|i| (r, i)));
            match onward {
                Some((record, next)) => groups.entry(record.reside.clone()).or_default().push(next),
                None => {
                    tracing::debug!(session_id = id, "relayed push target offline, dropping");
                    ack.dropped += 1;
                }
            }
        }

        let outcome = self.relay_groups(groups).await;
        ack.accepted += outcome.relayed;
        ack.dropped += outcome.failed;
        ack
    }

    /// Item to send on toward `target`, or `None` if it must not leave this node.
    fn outbound_item(&self, target: &SessionRecord, payload: Bytes, hop_count: u32) -> Option<ForwardItem> {
        if target.reside == self.identity {
            tracing::debug!(session_id = %target.id, "stale presence points at this node, skipping relay");
            return None;
        }
        let next = hop_count.saturating_add(1);
        if next > self.max_hops {
            tracing::warn!(
                session_id = %target.id,
                hop_count = next,
                max_hops = self.max_hops,
                "hop limit reached, not relaying"
            );
            return None;
        }
        Some(ForwardItem {
            session_id: target.id.clone(),
            payload,
            hop_count: next,
        })
    }

    async fn relay_groups(&self, groups: HashMap<NodeId, Vec<ForwardItem>>) -> ForwardOutcome {
        let results: Vec<(usize, usize)> = stream::iter(groups)
            .map(|(node, items)| async move {
                let count = items.len();
                let request = ForwardRequest {
                    origin: self.identity.clone(),
                    items,
                };
                match tokio::time::timeout(self.relay_timeout, self.relay.push_forward(&node, request)).await {
                    Ok(Ok(ack)) => {
                        tracing::debug!(
                            node = %node,
                            items = count,
                            accepted = ack.accepted,
                            dropped = ack.dropped,
                            "relay acknowledged"
                        );
                        (count, 0)
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(node = %node, items = count, error = %e, "relay failed");
                        (0, count)
                    }
                    Err(_) => {
                        tracing::warn!(node = %node, items = count, "relay timed out");
                        (0, count)
                    }
                }
            })
            .buffer_unordered(self.relay_concurrency)
            .collect()
            .await;

        results
            .into_iter()
            .fold(ForwardOutcome::default(), |mut acc, (ok, failed)| {
                acc.relayed += ok;
                acc.failed += failed;
                acc
            })
    }
}
