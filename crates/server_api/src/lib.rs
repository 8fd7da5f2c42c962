use std::sync::Arc;

use shared::{
    domain::{Login, QueueName, UserInfo},
    error::{ApiError, ErrorCode},
    protocol::ChatMessage,
};
use storage::{KvStore, QueueError, QueueStore, UserDirectory, UserError};
use tracing::{debug, info};

pub mod delivery;

pub use delivery::{open_delivery, DeliveryConfig, DeliveryLoop};

pub const MAX_BODY_CHARS: usize = 4096;

#[derive(Clone)]
pub struct ApiContext {
    pub store: Arc<dyn KvStore>,
    pub users: UserDirectory,
    pub queues: QueueStore,
}

impl ApiContext {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            users: UserDirectory::new(Arc::clone(&store)),
            queues: QueueStore::new(Arc::clone(&store)),
            store,
        }
    }
}

pub async fn register_user(
    ctx: &ApiContext,
    user_info: UserInfo,
    password: &str,
) -> Result<(), ApiError> {
    if password.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "password cannot be empty"));
    }
    ctx.users
        .register(user_info, password)
        .await
        .map_err(user_error)
}

pub async fn login_user(ctx: &ApiContext, login: &Login, password: &str) -> Result<(), ApiError> {
    ctx.users.login(login, password).await.map_err(user_error)
}

pub async fn get_all_users(ctx: &ApiContext) -> Result<Vec<UserInfo>, ApiError> {
    info!("listing registered users");
    ctx.users.list().await.map_err(user_error)
}

/// Queues `message` for the recipient and records it in the sender's history.
/// Nothing is written unless both users exist.
pub async fn send_message(ctx: &ApiContext, message: ChatMessage) -> Result<(), ApiError> {
    if message.body.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "message body cannot be empty"));
    }
    if message.body.chars().count() > MAX_BODY_CHARS {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("message body exceeds {MAX_BODY_CHARS} characters"),
        ));
    }

    ctx.queues
        .ensure_user_queues(&message.to_user)
        .await
        .map_err(|err| match err {
            QueueError::UserNotFound(login) => {
                ApiError::new(ErrorCode::NotFound, format!("user {login} does not exist"))
            }
            other => queue_error(other),
        })?;
    ctx.queues
        .ensure_user_queues(&message.from_user)
        .await
        .map_err(|err| match err {
            QueueError::UserNotFound(login) => ApiError::new(
                ErrorCode::Unauthenticated,
                format!("sender {login} is not registered"),
            ),
            other => queue_error(other),
        })?;

    ctx.queues
        .enqueue(&message.to_user, QueueName::ToSend, &message)
        .await
        .map_err(queue_error)?;
    ctx.queues
        .enqueue(&message.from_user, QueueName::Sent, &message)
        .await
        .map_err(queue_error)?;

    debug!(from = %message.from_user, to = %message.to_user, "message added to queue");
    Ok(())
}

pub async fn health_check(ctx: &ApiContext) -> Result<(), ApiError> {
    ctx.store
        .ping()
        .await
        .map_err(|e| ApiError::new(ErrorCode::Unavailable, e.to_string()))
}

fn user_error(err: UserError) -> ApiError {
    match err {
        UserError::AlreadyExists(login) => ApiError::new(
            ErrorCode::AlreadyExists,
            format!("user {login} already registered"),
        ),
        UserError::Unauthenticated(login) => {
            ApiError::new(ErrorCode::Unauthenticated, format!("login {login} failed"))
        }
        other => internal(other),
    }
}

fn queue_error(err: QueueError) -> ApiError {
    match err {
        QueueError::UserNotFound(login) => {
            ApiError::new(ErrorCode::NotFound, format!("user {login} not found"))
        }
        QueueError::Store(store) => ApiError::new(ErrorCode::Unavailable, store.to_string()),
        other => internal(other),
    }
}

fn internal(err: impl std::fmt::Display) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
