//! Per-user message queues on top of a [`KvStore`].
//!
//! Every registered user owns two queues under `/users/{login}/`:
//! `to_send_queue` holds messages not yet delivered to that user, `sent_queue` holds
//! delivered messages (and messages the user sent) and backs reconnect replay.
//!
//! # Commit is not atomic
//!
//! [`QueueStore::commit`] appends to `sent` and then deletes from `to_send`, one entry at
//! a time. A crash between the two steps leaves the message in both queues, and it is
//! delivered again on the next stream.

use std::{sync::Arc, time::Duration};

use shared::{
    domain::{Login, QueueName},
    protocol::ChatMessage,
};
use thiserror::Error;
use tracing::debug;

use crate::kv::{join, KvEntry, KvError, KvStore};

pub const USERS_ROOT: &str = "/users";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub key: String,
    pub payload: String,
}

impl QueueEntry {
    pub fn decode(&self) -> Result<ChatMessage, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

impl From<KvEntry> for QueueEntry {
    fn from(value: KvEntry) -> Self {
        Self {
            key: value.key,
            payload: value.value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    PeekOne,
    PeekAll,
    BlockOne(Duration),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("user {0} not found")]
    UserNotFound(Login),
    #[error("failed to encode queue payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] KvError),
}

pub fn user_dir(login: &Login) -> String {
    join(USERS_ROOT, login.as_str())
}

pub fn queue_dir(login: &Login, name: QueueName) -> String {
    join(&user_dir(login), name.dir_name())
}

/// One queue directory, independent of which store backs it.
#[derive(Clone)]
pub struct OrderedQueue {
    store: Arc<dyn KvStore>,
    dir: String,
}

impl OrderedQueue {
    pub fn new(store: Arc<dyn KvStore>, dir: impl Into<String>) -> Self {
        Self {
            store,
            dir: dir.into(),
        }
    }

    /// Creates the queue directory. A directory that already exists is fine.
    pub async fn ensure(&self) -> Result<(), KvError> {
        match self.store.create_dir(&self.dir).await {
            Ok(()) => Ok(()),
            Err(KvError::AlreadyExists(_)) => {
                debug!(dir = %self.dir, "queue directory already created");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn append(&self, payload: &str) -> Result<String, KvError> {
        self.store.append(&self.dir, payload).await
    }

    pub async fn drain_all(&self) -> Result<Vec<QueueEntry>, KvError> {
        Ok(self
            .store
            .list_values(&self.dir)
            .await?
            .into_iter()
            .map(QueueEntry::from)
            .collect())
    }

    pub async fn drain_blocking(&self, timeout: Duration) -> Result<Option<QueueEntry>, KvError> {
        Ok(self
            .store
            .wait_for_value(&self.dir, timeout)
            .await?
            .map(QueueEntry::from))
    }

    /// Appends each entry's payload to `other`, then deletes it here.
    pub async fn move_to(&self, other: &OrderedQueue, entries: &[QueueEntry]) -> Result<(), KvError> {
        for entry in entries {
            other.append(&entry.payload).await?;
            self.store.delete(&entry.key).await?;
        }
        Ok(())
    }
}

/// A user's `to_send` / `sent` pair, returned once both directories exist.
#[derive(Clone)]
pub struct UserQueues {
    pub login: Login,
    pub to_send: OrderedQueue,
    pub sent: OrderedQueue,
}

impl UserQueues {
    pub fn get(&self, name: QueueName) -> &OrderedQueue {
        match name {
            QueueName::ToSend => &self.to_send,
            QueueName::Sent => &self.sent,
        }
    }
}

#[derive(Clone)]
pub struct QueueStore {
    store: Arc<dyn KvStore>,
}

impl QueueStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn queues(&self, login: &Login) -> UserQueues {
        UserQueues {
            login: login.clone(),
            to_send: OrderedQueue::new(Arc::clone(&self.store), queue_dir(login, QueueName::ToSend)),
            sent: OrderedQueue::new(Arc::clone(&self.store), queue_dir(login, QueueName::Sent)),
        }
    }

    pub async fn ensure_user_queues(&self, login: &Login) -> Result<UserQueues, QueueError> {
        if !self.store.exists(&user_dir(login)).await? {
            return Err(QueueError::UserNotFound(login.clone()));
        }
        let queues = self.queues(login);
        queues.to_send.ensure().await?;
        queues.sent.ensure().await?;
        Ok(queues)
    }

    pub async fn enqueue(
        &self,
        login: &Login,
        name: QueueName,
        message: &ChatMessage,
    ) -> Result<String, QueueError> {
        let payload = serde_json::to_string(message)?;
        let key = self.queues(login).get(name).append(&payload).await?;
        debug!(%login, queue = name.dir_name(), %key, "message enqueued");
        Ok(key)
    }

    /// Reads without removing. Store failures read as "nothing ready"; a failed
    /// `BlockOne` still takes its whole timeout.
    pub async fn drain(&self, login: &Login, name: QueueName, mode: DrainMode) -> Vec<QueueEntry> {
        let queues = self.queues(login);
        let queue = queues.get(name);
        let result = match mode {
            DrainMode::PeekAll => queue.drain_all().await,
            DrainMode::PeekOne => queue
                .drain_all()
                .await
                .map(|entries| entries.into_iter().take(1).collect()),
            DrainMode::BlockOne(timeout) => {
                let deadline = tokio::time::Instant::now() + timeout;
                let waited = queue.drain_blocking(timeout).await;
                if waited.is_err() {
                    // A failing store answers at once; hold the caller for the full wait.
                    tokio::time::sleep_until(deadline).await;
                }
                waited.map(|entry| entry.into_iter().collect())
            }
        };
        result.unwrap_or_else(|error| {
            debug!(%login, queue = name.dir_name(), %error, "drain failed; treating as empty");
            Vec::new()
        })
    }

    /// Moves delivered entries from `to_send` into `sent`.
    pub async fn commit(&self, login: &Login, entries: &[QueueEntry]) -> Result<(), QueueError> {
        let queues = self.queues(login);
        queues.to_send.move_to(&queues.sent, entries).await?;
        Ok(())
    }

    /// The newest `limit` entries of `sent`, oldest first.
    pub async fn history(&self, login: &Login, limit: usize) -> Vec<QueueEntry> {
        let mut entries = self.drain(login, QueueName::Sent, DrainMode::PeekAll).await;
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
        entries
    }
}

#[cfg(test)]
#[path = "tests/queue_tests.rs"]
mod tests;
