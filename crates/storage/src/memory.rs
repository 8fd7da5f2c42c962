use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

use async_trait::async_trait;

use crate::kv::{ancestors_of, parent_of, sequence_key, KvEntry, KvError, KvStore, Watchers};

#[derive(Debug, Clone)]
enum Node {
    Dir,
    Value(String),
}

/// Process-local store used by tests and the `memory:` store URL.
#[derive(Default)]
pub struct MemoryKvStore {
    nodes: Mutex<BTreeMap<String, Node>>,
    index: AtomicU64,
    watchers: Watchers,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Node>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn children(&self, dir: &str) -> Result<Vec<(String, Node)>, KvError> {
        let nodes = self.lock();
        match nodes.get(dir) {
            Some(Node::Dir) => {}
            _ => return Err(KvError::NotFound(dir.to_string())),
        }
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        Ok(nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| !key[prefix.len()..].contains('/'))
            .map(|(key, node)| (key.clone(), node.clone()))
            .collect())
    }
}

fn ensure_ancestors(nodes: &mut BTreeMap<String, Node>, path: &str) {
    for ancestor in ancestors_of(path) {
        nodes.entry(ancestor.to_string()).or_insert(Node::Dir);
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn create_dir(&self, path: &str) -> Result<(), KvError> {
        let mut nodes = self.lock();
        if nodes.contains_key(path) {
            return Err(KvError::AlreadyExists(path.to_string()));
        }
        ensure_ancestors(&mut nodes, path);
        nodes.insert(path.to_string(), Node::Dir);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, KvError> {
        Ok(self.lock().contains_key(path))
    }

    async fn create(&self, key: &str, value: &str) -> Result<(), KvError> {
        {
            let mut nodes = self.lock();
            if nodes.contains_key(key) {
                return Err(KvError::AlreadyExists(key.to_string()));
            }
            ensure_ancestors(&mut nodes, key);
            nodes.insert(key.to_string(), Node::Value(value.to_string()));
        }
        self.watchers.notify(parent_of(key));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String, KvError> {
        match self.lock().get(key) {
            Some(Node::Value(value)) => Ok(value.clone()),
            _ => Err(KvError::NotFound(key.to_string())),
        }
    }

    async fn append(&self, dir: &str, value: &str) -> Result<String, KvError> {
        let key = {
            let mut nodes = self.lock();
            let index = self.index.fetch_add(1, Ordering::SeqCst) + 1;
            let key = sequence_key(dir, index);
            ensure_ancestors(&mut nodes, &key);
            nodes.insert(key.clone(), Node::Value(value.to_string()));
            key
        };
        self.watchers.notify(dir);
        Ok(key)
    }

    async fn list_values(&self, dir: &str) -> Result<Vec<KvEntry>, KvError> {
        Ok(self
            .children(dir)?
            .into_iter()
            .filter_map(|(key, node)| match node {
                Node::Value(value) => Some(KvEntry { key, value }),
                Node::Dir => None,
            })
            .collect())
    }

    async fn list_dirs(&self, dir: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .children(dir)?
            .into_iter()
            .filter(|(_, node)| matches!(node, Node::Dir))
            .map(|(key, _)| key)
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut nodes = self.lock();
        match nodes.get(key) {
            Some(Node::Value(_)) => {
                nodes.remove(key);
                Ok(())
            }
            _ => Err(KvError::NotFound(key.to_string())),
        }
    }

    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }

    fn watchers(&self) -> &Watchers {
        &self.watchers
    }
}
