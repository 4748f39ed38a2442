//! Directory store contract: the narrow key/value surface the session
//! directory needs from a shared store.
//!
//! Any backend offering per-key hashes, sets, per-key expiry and an atomic
//! multi-key primitive (Lua scripting, MULTI/EXEC) can implement
//! [`DirectoryStore`]. Atomic programs are expressed as [`Script`]s that run
//! against a synchronous [`Transaction`] view while the store guarantees no
//! other command interleaves.
//!
//! [`MemoryStore`] is the in-process backend. A fleet of gateway nodes in one
//! process (tests, single-host deployments) shares one instance by cloning it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Hash fields of one key.
pub type Fields = HashMap<String, String>;

/// Result of a [`Script`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptReply {
    Nil,
    Int(i64),
    Fields(Fields),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Synchronous view of the keyspace inside an atomic script.
pub trait Transaction {
    fn exists(&mut self, key: &str) -> bool;
    fn hget_all(&mut self, key: &str) -> Fields;
    fn hset(&mut self, key: &str, fields: &[(String, String)]);
    fn del(&mut self, key: &str) -> bool;
    fn sadd(&mut self, key: &str, member: &str);
    fn srem(&mut self, key: &str, member: &str) -> bool;
    fn expire(&mut self, key: &str, ttl: Duration) -> bool;
}

/// A multi-key program executed atomically by the store.
pub trait Script: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn run(&self, tx: &mut dyn Transaction) -> ScriptReply;
}

/// The store surface consumed by the session directory.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn hset(&self, key: &str, fields: Vec<(String, String)>) -> Result<(), StoreError>;

    async fn hget_all(&self, key: &str) -> Result<Fields, StoreError>;

    /// Pipelined batch of `hget_all`. Missing keys yield empty field maps.
    async fn hget_all_many(&self, keys: &[String]) -> Result<Vec<Fields>, StoreError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Run `script` atomically.
    async fn eval(&self, script: &dyn Script) -> Result<ScriptReply, StoreError>;
}

// ── In-memory backend ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Keyspace {
    hashes: HashMap<String, Fields>,
    sets: HashMap<String, HashSet<String>>,
    expiry: HashMap<String, Instant>,
}

impl Keyspace {
    /// Drop `key` if its TTL has passed.
    fn reap(&mut self, key: &str) {
        let expired = self
            .expiry
            .get(key)
            .is_some_and(|deadline| *deadline <= Instant::now());
        if expired {
            self.hashes.remove(key);
            self.sets.remove(key);
            self.expiry.remove(key);
        }
    }
}

impl Transaction for Keyspace {
    fn exists(&mut self, key: &str) -> bool {
        self.reap(key);
        self.hashes.contains_key(key) || self.sets.contains_key(key)
    }

    fn hget_all(&mut self, key: &str) -> Fields {
        self.reap(key);
        self.hashes.get(key).cloned().unwrap_or_default()
    }

    fn hset(&mut self, key: &str, fields: &[(String, String)]) {
        self.reap(key);
        let hash = self.hashes.entry(key.to_string()).or_default();
        for (k, v) in fields {
            hash.insert(k.clone(), v.clone());
        }
    }

    fn del(&mut self, key: &str) -> bool {
        self.reap(key);
        self.expiry.remove(key);
        let hash = self.hashes.remove(key).is_some();
        let set = self.sets.remove(key).is_some();
        hash || set
    }

    fn sadd(&mut self, key: &str, member: &str) {
        self.reap(key);
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }

    fn srem(&mut self, key: &str, member: &str) -> bool {
        self.reap(key);
        let Some(set) = self.sets.get_mut(key) else {
            return false;
        };
        let removed = set.remove(member);
        if set.is_empty() {
            self.sets.remove(key);
            self.expiry.remove(key);
        }
        removed
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        if !self.exists(key) {
            return false;
        }
        self.expiry.insert(key.to_string(), Instant::now() + ttl);
        true
    }
}

/// In-process [`DirectoryStore`]. Cloning shares the keyspace.
#[derive(Clone, Default)]
pub struct MemoryStore {
    keyspace: Arc<Mutex<Keyspace>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `Unavailable` until restored.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Relaxed);
    }

    /// Number of live keys (hashes and sets).
    pub fn key_count(&self) -> usize {
        match self.keyspace.lock() {
            Ok(mut ks) => {
                let keys: HashSet<String> =
                    ks.hashes.keys().chain(ks.sets.keys()).cloned().collect();
                keys.into_iter().filter(|k| ks.exists(k)).count()
            }
            Err(_) => 0,
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Keyspace) -> T) -> Result<T, StoreError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        let mut ks = self.keyspace.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut *ks))
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn hset(&self, key: &str, fields: Vec<(String, String)>) -> Result<(), StoreError> {
        self.with(|ks| ks.hset(key, &fields))
    }

    async fn hget_all(&self, key: &str) -> Result<Fields, StoreError> {
        self.with(|ks| ks.hget_all(key))
    }

    async fn hget_all_many(&self, keys: &[String]) -> Result<Vec<Fields>, StoreError> {
        self.with(|ks| keys.iter().map(|k| ks.hget_all(k)).collect())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.with(|ks| ks.sadd(key, member))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with(|ks| ks.srem(key, member))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with(|ks| {
            ks.reap(key);
            let mut members: Vec<String> = ks
                .sets
                .get(key)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default();
            members.sort();
            members
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.with(|ks| ks.expire(key, ttl))
    }

    async fn eval(&self, script: &dyn Script) -> Result<ScriptReply, StoreError> {
        let reply = self.with(|ks| script.run(ks))?;
        tracing::trace!(script = script.name(), "script executed");
        Ok(reply)
    }
}
