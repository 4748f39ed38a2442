//! Push router: resolves an identity to its active sessions and delivers
//! locally or hands off to the forwarder.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};

use tether_core::config::PushConfig;
use tether_core::{Device, NodeId, Status, Uid};

use crate::directory::{DirectoryError, SessionDirectory};
use crate::forwarder::Forwarder;
use crate::table::ConnectionTable;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("session resolution timed out after {0:?}")]
    Timeout(Duration),
}

/// What happened to one push. There is no per-recipient delivery ack from
/// clients; `local` means written to a socket on this node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReport {
    pub local: usize,
    pub relayed: usize,
    /// Matching sessions that are not `Active`.
    pub offline: usize,
    /// Active sessions that could not be reached.
    pub missed: usize,
}

impl PushReport {
    pub fn merge(&mut self, other: PushReport) {
        self.local += other.local;
        self.relayed += other.relayed;
        self.offline += other.offline;
        self.missed += other.missed;
    }
}

/// Aggregate of a broadcast or batch push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub targets: usize,
    pub totals: PushReport,
    /// Identities whose sessions could not be resolved.
    pub failed: Vec<Uid>,
}

pub struct PushRouter {
    identity: NodeId,
    directory: SessionDirectory,
    connections: ConnectionTable,
    forwarder: Arc<Forwarder>,
    fanout_concurrency: usize,
    resolve_timeout: Duration,
}

impl PushRouter {
    pub fn new(
        identity: NodeId,
        directory: SessionDirectory,
        connections: ConnectionTable,
        forwarder: Arc<Forwarder>,
        config: &PushConfig,
    ) -> Self {
        Self {
            identity,
            directory,
            connections,
            forwarder,
            fanout_concurrency: config.fanout_concurrency.max(1),
            resolve_timeout: config.resolve_timeout(),
        }
    }

    /// Deliver `payload` to every active session of `uid`, optionally
    /// restricted to one device class.
    pub async fn push(&self, uid: Uid, device: Option<Device>, payload: Bytes) -> Result<PushReport, RouterError> {
        let records = tokio::time::timeout(self.resolve_timeout, self.directory.get_by_uid(uid))
            .await
            .map_err(|_| RouterError::Timeout(self.resolve_timeout))??;

        let mut report = PushReport::default();
        let mut remote = Vec::new();

        for record in records {
            if device.is_some_and(|d| d != record.device) {
                continue;
            }
            if record.status != Status::Active {
                report.offline += 1;
                continue;
            }
            if record.reside == self.identity {
                if self.connections.deliver(&record.id, payload.clone()).await {
                    report.local += 1;
                } else {
                    tracing::debug!(session_id = %record.id, "active here but no live socket");
                    report.missed += 1;
                }
            } else {
                remote.push(record);
            }
        }

        if !remote.is_empty() {
            let out = self.forwarder.forward(&remote, payload, 0).await;
            report.relayed += out.relayed;
            report.missed += out.failed + out.skipped;
        }

        tracing::debug!(
            uid,
            local = report.local,
            relayed = report.relayed,
            offline = report.offline,
            missed = report.missed,
            "push routed"
        );
        Ok(report)
    }

    /// Same payload to many identities.
    pub async fn broadcast(&self, uids: &[Uid], payload: Bytes) -> BatchReport {
        let jobs = uids.iter().map(|uid| (*uid, payload.clone())).collect();
        self.fan_out(jobs).await
    }

    /// A distinct payload per identity.
    pub async fn batch_push(&self, payloads: HashMap<Uid, Bytes>) -> BatchReport {
        self.fan_out(payloads.into_iter().collect()).await
    }

    async fn fan_out(&self, jobs: Vec<(Uid, Bytes)>) -> BatchReport {
        let targets = jobs.len();
        let results: Vec<(Uid, Result<PushReport, RouterError>)> = stream::iter(jobs)
            .map(|(uid, payload)| async move { (uid, self.push(uid, None, payload).await) })
            .buffer_unordered(self.fanout_concurrency)
            .collect()
            .await;

        let mut report = BatchReport {
            targets,
            ..Default::default()
        };
        for (uid, result) in results {
            match result {
                Ok(r) => report.totals.merge(r),
                Err(e) => {
                    tracing::warn!(uid, error = %e, "push resolution failed");
                    report.failed.push(uid);
                }
            }
        }
        report.failed.sort_unstable();
        tracing::info!(
            targets,
            local = report.totals.local,
            relayed = report.totals.relayed,
            failed = report.failed.len(),
            "fan-out push finished"
        );
        report
    }
}
