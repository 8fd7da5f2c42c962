use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite, Transaction,
};

use crate::kv::{ancestors_of, parent_of, sequence_key, KvEntry, KvError, KvStore, Watchers};

/// SQLite-backed store. Blocking reads are woken in-process, so one server process
/// should own a database file.
pub struct SqliteKvStore {
    pool: Pool<Sqlite>,
    watchers: Watchers,
}

impl From<sqlx::Error> for KvError {
    fn from(value: sqlx::Error) -> Self {
        KvError::Unavailable(Box::new(value))
    }
}

impl SqliteKvStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to an in-memory database is a separate database.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite store at {database_url}"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            watchers: Watchers::default(),
        })
    }
}

async fn ensure_dirs(tx: &mut Transaction<'_, Sqlite>, paths: &[&str]) -> Result<(), KvError> {
    for path in paths {
        sqlx::query(
            "INSERT OR IGNORE INTO kv_nodes (key, parent, is_dir, value) VALUES (?, ?, 1, NULL)",
        )
        .bind(*path)
        .bind(parent_of(path))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn map_insert_error(key: &str, err: sqlx::Error) -> KvError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            KvError::AlreadyExists(key.to_string())
        }
        _ => err.into(),
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn create_dir(&self, path: &str) -> Result<(), KvError> {
        let mut tx = self.pool.begin().await?;
        ensure_dirs(&mut tx, &ancestors_of(path)).await?;
        sqlx::query("INSERT INTO kv_nodes (key, parent, is_dir, value) VALUES (?, ?, 1, NULL)")
            .bind(path)
            .bind(parent_of(path))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_insert_error(path, e))?;
        tx.commit().await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, KvError> {
        let row = sqlx::query("SELECT 1 FROM kv_nodes WHERE key = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn create(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut tx = self.pool.begin().await?;
        ensure_dirs(&mut tx, &ancestors_of(key)).await?;
        sqlx::query("INSERT INTO kv_nodes (key, parent, is_dir, value) VALUES (?, ?, 0, ?)")
            .bind(key)
            .bind(parent_of(key))
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_insert_error(key, e))?;
        tx.commit().await?;
        self.watchers.notify(parent_of(key));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String, KvError> {
        let row = sqlx::query("SELECT value FROM kv_nodes WHERE key = ? AND is_dir = 0")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<String, _>(0)?),
            None => Err(KvError::NotFound(key.to_string())),
        }
    }

    async fn append(&self, dir: &str, value: &str) -> Result<String, KvError> {
        let mut tx = self.pool.begin().await?;
        let index: i64 = sqlx::query_scalar(
            "UPDATE kv_sequence SET value = value + 1 WHERE id = 1 RETURNING value",
        )
        .fetch_one(&mut *tx)
        .await?;
        let key = sequence_key(dir, index as u64);
        let mut dirs = ancestors_of(dir);
        dirs.push(dir);
        ensure_dirs(&mut tx, &dirs).await?;
        sqlx::query("INSERT INTO kv_nodes (key, parent, is_dir, value) VALUES (?, ?, 0, ?)")
            .bind(&key)
            .bind(dir)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_insert_error(&key, e))?;
        tx.commit().await?;
        self.watchers.notify(dir);
        Ok(key)
    }

    async fn list_values(&self, dir: &str) -> Result<Vec<KvEntry>, KvError> {
        self.require_dir(dir).await?;
        let rows = sqlx::query(
            "SELECT key, value FROM kv_nodes WHERE parent = ? AND is_dir = 0 ORDER BY key",
        )
        .bind(dir)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| -> Result<KvEntry, KvError> {
                Ok(KvEntry {
                    key: row.try_get(0)?,
                    value: row.try_get(1)?,
                })
            })
            .collect()
    }

    async fn list_dirs(&self, dir: &str) -> Result<Vec<String>, KvError> {
        self.require_dir(dir).await?;
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT key FROM kv_nodes WHERE parent = ? AND is_dir = 1 ORDER BY key",
        )
        .bind(dir)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let result = sqlx::query("DELETE FROM kv_nodes WHERE key = ? AND is_dir = 0")
            .bind(key)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(KvError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), KvError> {
        let _: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    fn watchers(&self) -> &Watchers {
        &self.watchers
    }
}

impl SqliteKvStore {
    async fn require_dir(&self, dir: &str) -> Result<(), KvError> {
        let row = sqlx::query("SELECT 1 FROM kv_nodes WHERE key = ? AND is_dir = 1")
            .bind(dir)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(_) => Ok(()),
            None => Err(KvError::NotFound(dir.to_string())),
        }
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}
