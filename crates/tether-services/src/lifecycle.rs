//! Session lifecycle: connect, disconnect, drain-offline and heartbeat
//! transitions on directory records.

use std::cmp::Reverse;

use bytes::Bytes;
use futures::{stream, StreamExt};
use uuid::Uuid;

use tether_core::session::now_millis;
use tether_core::{Device, NodeId, SessionId, SessionRecord, Status, Uid};

use crate::directory::{DirectoryError, SessionDirectory};

/// Identity and origin of a client about to get a connection.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub uid: Uid,
    pub device: Device,
    pub ip: String,
}

/// Outcome of a bulk offline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfflineReport {
    pub updated: usize,
    /// Records that no longer existed.
    pub missing: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SessionLifecycle {
    directory: SessionDirectory,
    identity: NodeId,
    offline_concurrency: usize,
}

impl SessionLifecycle {
    pub fn new(directory: SessionDirectory, identity: NodeId, offline_concurrency: usize) -> Self {
        Self {
            directory,
            identity,
            offline_concurrency: offline_concurrency.max(1),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Reuse a dormant session of the same device, or mint a new one, and
    /// write it as `Active` on this node.
    pub async fn connect(&self, req: &ConnectRequest) -> Result<SessionRecord, DirectoryError> {
        let existing = self.directory.get_by_uid(req.uid).await?;
        let reused = pick_reusable(&existing, req.device);

        let id = match reused {
            Some(prev) => {
                tracing::info!(
                    session_id = %prev.id,
                    uid = req.uid,
                    device = %req.device,
                    previous_status = %prev.status,
                    previous_reside = %prev.reside,
                    "resuming session"
                );
                prev.id.clone()
            }
            None => Uuid::new_v4().to_string(),
        };

        let now = now_millis();
        let record = SessionRecord {
            id,
            uid: req.uid,
            device: req.device,
            status: Status::Active,
            ctime: now,
            last_active_time: now,
            reside: self.identity.clone(),
            ip: req.ip.clone(),
        };
        self.directory.create(&record).await?;

        tracing::info!(
            session_id = %record.id,
            uid = record.uid,
            device = %record.device,
            reused = reused.is_some(),
            "session active"
        );
        Ok(record)
    }

    /// Mark the session `NoActive`. The record is kept for reuse.
    pub async fn disconnect(&self, id: &str) -> Result<(), DirectoryError> {
        self.directory.update_status(id, Status::NoActive).await?;
        tracing::info!(session_id = id, "session disconnected");
        Ok(())
    }

    /// Mark every id `TemporaryOffline` with bounded concurrency. All ids are
    /// attempted; the first store failure is returned afterwards.
    pub async fn offline_sessions(&self, ids: &[SessionId]) -> Result<OfflineReport, DirectoryError> {
        let dir = &self.directory;
        let results: Vec<Result<(), DirectoryError>> = stream::iter(ids.iter())
            .map(|id| async move { dir.update_status(id, Status::TemporaryOffline).await })
            .buffer_unordered(self.offline_concurrency)
            .collect()
            .await;

        let mut report = OfflineReport::default();
        let mut first_err = None;
        for result in results {
            match result {
                Ok(()) => report.updated += 1,
                Err(DirectoryError::NotFound(_)) => report.missing += 1,
                Err(e) => {
                    report.failed += 1;
                    first_err.get_or_insert(e);
                }
            }
        }

        tracing::info!(
            updated = report.updated,
            missing = report.missing,
            failed = report.failed,
            "sessions offlined"
        );
        match first_err {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Record liveness. No status transition.
    pub async fn heartbeat(&self, id: &str) -> Result<(), DirectoryError> {
        self.directory.update_last_active_time(id, now_millis()).await
    }

    /// Client data counts as liveness. Routing it further is not this node's job.
    pub async fn on_data(&self, id: &str, payload: &Bytes) -> Result<(), DirectoryError> {
        tracing::debug!(session_id = id, len = payload.len(), "client data");
        self.heartbeat(id).await
    }

    /// A local socket closed. Disconnect the session only if this node still
    /// owns it as `Active`; returns whether a transition happened.
    pub async fn release(&self, id: &str) -> Result<bool, DirectoryError> {
        let record = match self.directory.get_by_id(id).await {
            Ok(r) => r,
            Err(DirectoryError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if record.status != Status::Active || record.reside != self.identity {
            tracing::debug!(
                session_id = id,
                status = %record.status,
                reside = %record.reside,
                "session no longer owned here, leaving it"
            );
            return Ok(false);
        }
        self.disconnect(id).await?;
        Ok(true)
    }
}

/// Same device, dormant status. `TemporaryOffline` beats `NoActive`, then the
/// most recently active wins.
fn pick_reusable(records: &[SessionRecord], device: Device) -> Option<&SessionRecord> {
    records
        .iter()
        .filter(|r| r.device == device && r.status.is_reusable())
        .min_by_key(|r| (r.status != Status::TemporaryOffline, Reverse(r.last_active_time)))
}
