//! Connection table: the node-local map of live sockets by session id.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use crate::connection::Connection;

/// Live connections on this node, shared across all tasks.
#[derive(Clone, Default)]
pub struct ConnectionTable {
    inner: Arc<DashMap<String, Arc<Connection>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn`, returning whatever previously held its id.
    pub fn insert(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.inner.insert(conn.id().to_string(), conn)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.inner.get(id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains_key(id)
    }

    /// Remove `conn` only if it is still the registered instance for its id.
    /// A reconnect on this node may have replaced it already.
    pub fn remove_if_same(&self, conn: &Arc<Connection>) -> bool {
        self.inner
            .remove_if(conn.id(), |_, current| Arc::ptr_eq(current, conn))
            .is_some()
    }

    /// Write a `DATA` frame to the live connection for `id`. False if there is
    /// none or the write failed.
    pub async fn deliver(&self, id: &str, payload: Bytes) -> bool {
        let Some(conn) = self.get(id) else {
            return false;
        };
        match conn.push(payload).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(session_id = id, error = %e, "local delivery failed");
                false
            }
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
