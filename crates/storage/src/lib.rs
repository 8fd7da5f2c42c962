use std::sync::Arc;

use anyhow::Result;

pub mod kv;
pub mod memory;
pub mod queue;
pub mod sqlite;
pub mod users;

pub use kv::{KvEntry, KvError, KvStore};
pub use memory::MemoryKvStore;
pub use queue::{DrainMode, OrderedQueue, QueueEntry, QueueError, QueueStore, UserQueues};
pub use sqlite::SqliteKvStore;
pub use users::{UserDirectory, UserError, UserRecord};

pub const MEMORY_STORE_URL: &str = "memory:";

/// Opens the store named by `store_url`: `memory:` or a sqlite URL.
pub async fn open_store(store_url: &str) -> Result<Arc<dyn KvStore>> {
    if store_url.trim() == MEMORY_STORE_URL {
        return Ok(Arc::new(MemoryKvStore::new()));
    }
    Ok(Arc::new(SqliteKvStore::new(store_url).await?))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
