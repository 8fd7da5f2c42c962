//! Directory-structured, ordered key-value store.
//!
//! Keys are absolute slash-separated paths (`/users/alice/sent_queue/00000000000000000042`).
//! Directories are explicit nodes; values live only in leaves. `append` allocates a key
//! from a store-wide increasing index, so children of a directory sort in insertion order.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("key already exists: {0}")]
    AlreadyExists(String),
    #[error("store unavailable: {0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Creates `path` (and any missing ancestors) as a directory.
    /// Fails with `AlreadyExists` if a node is already present at `path`.
    async fn create_dir(&self, path: &str) -> Result<(), KvError>;

    async fn exists(&self, path: &str) -> Result<bool, KvError>;

    /// Writes a new leaf. Fails with `AlreadyExists` if `key` is taken.
    async fn create(&self, key: &str, value: &str) -> Result<(), KvError>;

    async fn get(&self, key: &str) -> Result<String, KvError>;

    /// Appends a leaf under `dir` with a freshly allocated ordered key and returns that key.
    async fn append(&self, dir: &str, value: &str) -> Result<String, KvError>;

    /// Leaf children of `dir` in key order.
    async fn list_values(&self, dir: &str) -> Result<Vec<KvEntry>, KvError>;

    /// Directory children of `dir` in key order, as full paths.
    async fn list_dirs(&self, dir: &str) -> Result<Vec<String>, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    async fn ping(&self) -> Result<(), KvError>;

    fn watchers(&self) -> &Watchers;

    /// Returns the first leaf under `dir`, waiting up to `timeout` for one to be appended.
    async fn wait_for_value(
        &self,
        dir: &str,
        timeout: Duration,
    ) -> Result<Option<KvEntry>, KvError> {
        let notify = self.watchers().watch(dir);
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(first) = self.list_values(dir).await?.into_iter().next() {
            return Ok(Some(first));
        }
        if tokio::time::timeout(timeout, notified).await.is_err() {
            return Ok(None);
        }
        Ok(self.list_values(dir).await?.into_iter().next())
    }
}

/// Per-directory wakeups for blocked readers. In-process only.
#[derive(Default)]
pub struct Watchers {
    dirs: Mutex<HashMap<String, Arc<Notify>>>,
}

impl Watchers {
    pub fn watch(&self, dir: &str) -> Arc<Notify> {
        let mut guard = self.dirs.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(guard.entry(dir.to_string()).or_default())
    }

    /// Wakes readers blocked on `dir` and forgets directories nobody is watching.
    pub fn notify(&self, dir: &str) {
        let mut guard = self.dirs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(notify) = guard.get(dir) {
            notify.notify_waiters();
        }
        guard.retain(|_, notify| Arc::strong_count(notify) > 1);
    }

    pub fn watched_dirs(&self) -> usize {
        self.dirs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

pub fn join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// Parent path of `path`; `/` for top-level nodes.
pub fn parent_of(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Every ancestor of `path` below the root, outermost first, excluding `path` itself.
pub fn ancestors_of(path: &str) -> Vec<&str> {
    let trimmed = path.trim_end_matches('/');
    trimmed
        .match_indices('/')
        .filter(|(idx, _)| *idx > 0)
        .map(|(idx, _)| &trimmed[..idx])
        .collect()
}

/// Zero-padded so lexical key order matches allocation order.
pub fn sequence_key(dir: &str, index: u64) -> String {
    join(dir, &format!("{index:020}"))
}
