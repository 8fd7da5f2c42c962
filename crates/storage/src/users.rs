use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::domain::{Login, UserInfo};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    kv::{join, KvError, KvStore},
    queue::{user_dir, USERS_ROOT},
};

#[derive(Debug, Error)]
pub enum UserError {
    #[error("user {0} already registered")]
    AlreadyExists(Login),
    #[error("login {0} failed")]
    Unauthenticated(Login),
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("corrupt user record for {login}: {source}")]
    Corrupt {
        login: Login,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] KvError),
}

/// Persisted at `/users/{login}/user_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_info: UserInfo,
    pub is_active: bool,
    pub hashed_password: String,
    pub register_timestamp: DateTime<Utc>,
}

fn user_info_key(login: &Login) -> String {
    join(&user_dir(login), "user_info")
}

#[derive(Clone)]
pub struct UserDirectory {
    store: Arc<dyn KvStore>,
}

impl UserDirectory {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn register(&self, user_info: UserInfo, password: &str) -> Result<(), UserError> {
        let login = user_info.login.clone();
        match self.store.create_dir(&user_dir(&login)).await {
            Ok(()) => {}
            Err(KvError::AlreadyExists(_)) => return Err(UserError::AlreadyExists(login)),
            Err(err) => return Err(err.into()),
        }

        let record = UserRecord {
            user_info,
            is_active: true,
            hashed_password: hash_password(password.to_string()).await?,
            register_timestamp: Utc::now(),
        };
        let encoded = serde_json::to_string(&record).map_err(|source| UserError::Corrupt {
            login: login.clone(),
            source,
        })?;
        self.store.create(&user_info_key(&login), &encoded).await?;
        info!(%login, "user registered");
        Ok(())
    }

    pub async fn login(&self, login: &Login, password: &str) -> Result<(), UserError> {
        let record = match self.record(login).await {
            Ok(record) => record,
            Err(UserError::Store(KvError::NotFound(_))) => {
                return Err(UserError::Unauthenticated(login.clone()))
            }
            Err(err) => return Err(err),
        };
        if !record.is_active
            || !verify_password(password.to_string(), record.hashed_password).await
        {
            return Err(UserError::Unauthenticated(login.clone()));
        }
        info!(%login, "user logged in");
        Ok(())
    }

    pub async fn exists(&self, login: &Login) -> Result<bool, UserError> {
        Ok(self.store.exists(&user_dir(login)).await?)
    }

    pub async fn list(&self) -> Result<Vec<UserInfo>, UserError> {
        let dirs = match self.store.list_dirs(USERS_ROOT).await {
            Ok(dirs) => dirs,
            Err(KvError::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut users = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let Some(login) = dir
                .rsplit('/')
                .next()
                .and_then(|segment| Login::parse(segment).ok())
            else {
                continue;
            };
            match self.record(&login).await {
                Ok(record) => users.push(record.user_info),
                Err(error) => warn!(%login, %error, "skipping user without readable record"),
            }
        }
        Ok(users)
    }

    async fn record(&self, login: &Login) -> Result<UserRecord, UserError> {
        let raw = self.store.get(&user_info_key(login)).await?;
        serde_json::from_str(&raw).map_err(|source| UserError::Corrupt {
            login: login.clone(),
            source,
        })
    }
}

async fn hash_password(password: String) -> Result<String, UserError> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| UserError::Hash(e.to_string()))
    })
    .await
    .map_err(|e| UserError::Hash(e.to_string()))?
}

async fn verify_password(password: String, hashed: String) -> bool {
    tokio::task::spawn_blocking(move || {
        PasswordHash::new(&hashed)
            .map(|parsed| {
                Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false)
    })
    .await
    .unwrap_or(false)
}

#[cfg(test)]
#[path = "tests/users_tests.rs"]
mod tests;
