//! Session directory: the shared map from identity to sessions and from
//! session id to presence record.
//!
//! Layout in the store:
//!   session:{id}        hash  → SessionRecord fields
//!   uid_sessions:{uid}  set   → session ids
//!
//! A membership without a record (or the reverse) is an invariant violation,
//! so create and delete always touch both keys inside one atomic script.

use std::sync::Arc;
use std::time::Duration;

use tether_core::session::{
    ModelError, SessionRecord, FIELD_LAST_ACTIVE_TIME, FIELD_STATUS, FIELD_UID,
};
use tether_core::{SessionId, Status, Uid};

use crate::store::{DirectoryStore, ScriptReply, Script, StoreError, Transaction};

pub fn session_key(id: &str) -> String {
    format!("session:{id}")
}

pub fn uid_key(uid: Uid) -> String {
    format!("uid_sessions:{uid}")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("directory unavailable: {0}")]
    Unavailable(#[from] StoreError),
    #[error("corrupt session record {id}: {source}")]
    Corrupt { id: SessionId, source: ModelError },
}

// ── Scripts ───────────────────────────────────────────────────────────────────

/// Write the record hash and its membership together.
struct CreateSession {
    hash_key: String,
    set_key: String,
    id: SessionId,
    fields: Vec<(String, String)>,
    ttl: Duration,
}

impl Script for CreateSession {
    fn name(&self) -> &'static str {
        "create_session"
    }

    fn run(&self, tx: &mut dyn Transaction) -> ScriptReply {
        tx.hset(&self.hash_key, &self.fields);
        tx.sadd(&self.set_key, &self.id);
        tx.expire(&self.hash_key, self.ttl);
        tx.expire(&self.set_key, self.ttl);
        ScriptReply::Nil
    }
}

/// Read the record to learn its uid, then remove record and membership.
struct DeleteSession {
    id: SessionId,
}

impl Script for DeleteSession {
    fn name(&self) -> &'static str {
        "delete_session"
    }

    fn run(&self, tx: &mut dyn Transaction) -> ScriptReply {
        let hash_key = session_key(&self.id);
        let fields = tx.hget_all(&hash_key);
        if fields.is_empty() {
            return ScriptReply::Nil;
        }
        tx.del(&hash_key);
        if let Some(uid) = fields.get(FIELD_UID).and_then(|u| u.parse::<Uid>().ok()) {
            tx.srem(&uid_key(uid), &self.id);
        }
        ScriptReply::Fields(fields)
    }
}

/// Partial field write that never resurrects a missing record. With a ttl,
/// the expiry of the record and its uid set are re-armed together; set
/// contents are left alone.
struct UpdateFields {
    id: SessionId,
    fields: Vec<(String, String)>,
    ttl: Option<Duration>,
}

impl Script for UpdateFields {
    fn name(&self) -> &'static str {
        "update_fields"
    }

    fn run(&self, tx: &mut dyn Transaction) -> ScriptReply {
        let hash_key = session_key(&self.id);
        if !tx.exists(&hash_key) {
            return ScriptReply::Int(0);
        }
        tx.hset(&hash_key, &self.fields);
        if let Some(ttl) = self.ttl {
            tx.expire(&hash_key, ttl);
            let uid = tx
                .hget_all(&hash_key)
                .get(FIELD_UID)
                .and_then(|u| u.parse::<Uid>().ok());
            if let Some(uid) = uid {
                tx.expire(&uid_key(uid), ttl);
            }
        }
        ScriptReply::Int(1)
    }
}

// ── Directory ─────────────────────────────────────────────────────────────────

/// Typed session operations over a [`DirectoryStore`].
#[derive(Clone)]
pub struct SessionDirectory {
    store: Arc<dyn DirectoryStore>,
    ttl: Duration,
}

impl SessionDirectory {
    pub fn new(store: Arc<dyn DirectoryStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Atomically write the record and add it to its uid's set.
    pub async fn create(&self, record: &SessionRecord) -> Result<(), DirectoryError> {
        let script = CreateSession {
            hash_key: session_key(&record.id),
            set_key: uid_key(record.uid),
            id: record.id.clone(),
            fields: record.to_fields(),
            ttl: self.ttl,
        };
        self.store.eval(&script).await?;
        tracing::debug!(session_id = %record.id, uid = record.uid, "session record written");
        Ok(())
    }

    /// Atomically remove the record and its membership. Returns the removed
    /// record, or `None` if there was nothing to remove.
    pub async fn delete_by_id(&self, id: &str) -> Result<Option<SessionRecord>, DirectoryError> {
        let reply = self.store.eval(&DeleteSession { id: id.to_string() }).await?;
        match reply {
            ScriptReply::Fields(fields) => {
                tracing::debug!(session_id = id, "session record deleted");
                SessionRecord::from_fields(&fields)
                    .map(Some)
                    .map_err(|source| DirectoryError::Corrupt {
                        id: id.to_string(),
                        source,
                    })
            }
            _ => Ok(None),
        }
    }

    pub async fn get_by_id(&self, id: &str) -> Result<SessionRecord, DirectoryError> {
        let fields = self.store.hget_all(&session_key(id)).await?;
        if fields.is_empty() {
            return Err(DirectoryError::NotFound(id.to_string()));
        }
        SessionRecord::from_fields(&fields).map_err(|source| DirectoryError::Corrupt {
            id: id.to_string(),
            source,
        })
    }

    /// All records of `uid`. Memberships whose record is gone are skipped.
    pub async fn get_by_uid(&self, uid: Uid) -> Result<Vec<SessionRecord>, DirectoryError> {
        let ids = self.store.smembers(&uid_key(uid)).await?;
        let records = self.get_many(&ids).await?;
        Ok(records.into_iter().flatten().collect())
    }

    /// Batch fetch by id, positionally aligned with `ids`. Missing, empty or
    /// unparseable records come back as `None`.
    pub async fn get_many(
        &self,
        ids: &[SessionId],
    ) -> Result<Vec<Option<SessionRecord>>, DirectoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| session_key(id)).collect();
        let all = self.store.hget_all_many(&keys).await?;

        Ok(ids
            .iter()
            .zip(all)
            .map(|(id, fields)| {
                if fields.is_empty() {
                    tracing::debug!(session_id = %id, "stale membership, record missing");
                    return None;
                }
                match SessionRecord::from_fields(&fields) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        tracing::warn!(session_id = %id, error = %e, "skipping corrupt session record");
                        None
                    }
                }
            })
            .collect())
    }

    pub async fn update_status(&self, id: &str, status: Status) -> Result<(), DirectoryError> {
        self.update(id, vec![(FIELD_STATUS.into(), status.to_string())], None)
            .await
    }

    /// Stamp liveness and re-arm the expiry of the record and its membership.
    pub async fn update_last_active_time(&self, id: &str, ts: u64) -> Result<(), DirectoryError> {
        self.update(
            id,
            vec![(FIELD_LAST_ACTIVE_TIME.into(), ts.to_string())],
            Some(self.ttl),
        )
        .await
    }

    async fn update(
        &self,
        id: &str,
        fields: Vec<(String, String)>,
        ttl: Option<Duration>,
    ) -> Result<(), DirectoryError> {
        let script = UpdateFields {
            id: id.to_string(),
            fields,
            ttl,
        };
        match self.store.eval(&script).await? {
            ScriptReply::Int(1) => Ok(()),
            _ => Err(DirectoryError::NotFound(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tether_core::Device;

    fn record(id: &str, uid: Uid) -> SessionRecord {
        SessionRecord {
            id: id.into(),
            uid,
            device: Device::Web,
            status: Status::Active,
            ctime: 1,
            last_active_time: 1,
            reside: "node-a:7400".into(),
            ip: "192.0.2.1".into(),
        }
    }

    fn directory() -> (SessionDirectory, MemoryStore) {
        let store = MemoryStore::new();
        let dir = SessionDirectory::new(Arc::new(store.clone()), Duration::from_secs(60));
        (dir, store)
    }

    #[tokio::test]
    async fn create_writes_record_and_membership() {
        let (dir, store) = directory();
        dir.create(&record("s1", 42)).await.unwrap();

        assert_eq!(store.smembers(&uid_key(42)).await.unwrap(), vec!["s1"]);
        assert_eq!(dir.get_by_id("s1").await.unwrap(), record("s1", 42));
    }

    #[tokio::test]
    async fn delete_removes_both_sides() {
        let (dir, store) = directory();
        dir.create(&record("s1", 42)).await.unwrap();
        dir.create(&record("s2", 42)).await.unwrap();

        let removed = dir.delete_by_id("s1").await.unwrap();
        assert_eq!(removed.map(|r| r.id), Some("s1".to_string()));
        assert_eq!(store.smembers(&uid_key(42)).await.unwrap(), vec!["s2"]);
        assert!(matches!(
            dir.get_by_id("s1").await,
            Err(DirectoryError::NotFound(_))
        ));

        assert_eq!(dir.delete_by_id("s1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_by_uid_skips_stale_memberships() {
        let (dir, store) = directory();
        dir.create(&record("s1", 7)).await.unwrap();
        store.sadd(&uid_key(7), "ghost").await.unwrap();

        let records = dir.get_by_uid(7).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "s1");
    }

    #[tokio::test]
    async fn get_by_uid_of_unknown_identity_is_empty() {
        let (dir, _) = directory();
        assert!(dir.get_by_uid(999).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn partial_updates_leave_membership_alone() {
        let (dir, store) = directory();
        dir.create(&record("s1", 42)).await.unwrap();

        dir.update_status("s1", Status::NoActive).await.unwrap();
        dir.update_last_active_time("s1", 99).await.unwrap();

        let got = dir.get_by_id("s1").await.unwrap();
        assert_eq!(got.status, Status::NoActive);
        assert_eq!(got.last_active_time, 99);
        assert_eq!(got.ctime, 1);
        assert_eq!(store.smembers(&uid_key(42)).await.unwrap(), vec!["s1"]);
    }

    #[tokio::test]
    async fn liveness_keeps_membership_past_original_ttl() {
        let store = MemoryStore::new();
        let dir = SessionDirectory::new(Arc::new(store.clone()), Duration::from_millis(300));
        dir.create(&record("s1", 42)).await.unwrap();

        for ts in 2..7 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            dir.update_last_active_time("s1", ts).await.unwrap();
        }

        let records = dir.get_by_uid(42).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].last_active_time, 6);
    }

    #[tokio::test]
    async fn status_update_does_not_extend_expiry() {
        let store = MemoryStore::new();
        let dir = SessionDirectory::new(Arc::new(store.clone()), Duration::from_millis(100));
        dir.create(&record("s1", 42)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        dir.update_status("s1", Status::NoActive).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(dir.get_by_uid(42).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn updates_do_not_resurrect_missing_records() {
        let (dir, store) = directory();
        assert!(matches!(
            dir.update_status("nope", Status::NoActive).await,
            Err(DirectoryError::NotFound(_))
        ));
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn corrupt_record_is_reported_by_id_lookup() {
        let (dir, store) = directory();
        store
            .hset(&session_key("bad"), vec![("id".into(), "bad".into())])
            .await
            .unwrap();
        assert!(matches!(
            dir.get_by_id("bad").await,
            Err(DirectoryError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn store_outage_surfaces_as_unavailable() {
        let (dir, store) = directory();
        store.set_available(false);
        assert!(matches!(
            dir.create(&record("s1", 1)).await,
            Err(DirectoryError::Unavailable(_))
        ));
        assert!(matches!(
            dir.get_by_uid(1).await,
            Err(DirectoryError::Unavailable(_))
        ));
    }
}
