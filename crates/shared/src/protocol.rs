use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Login, UserInfo};

pub const REGISTER_ROUTE: &str = "/users/register";
pub const LOGIN_ROUTE: &str = "/users/login";
pub const USERS_ROUTE: &str = "/users";
pub const MESSAGES_ROUTE: &str = "/messages";
pub const STREAM_ROUTE: &str = "/messages/stream";

/// A direct message. Serialized as-is into the recipient's and the sender's queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub from_user: Login,
    pub to_user: Login,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(from_user: Login, to_user: Login, body: impl Into<String>) -> Self {
        Self {
            from_user,
            to_user,
            body: body.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterUserRequest {
    pub user_info: UserInfo,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginUserRequest {
    pub login: Login,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetAllUsersResponse {
    pub users: Vec<UserInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub message: ChatMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamQuery {
    pub login: Login,
}

/// Frames pushed over the receive stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageReceived { message: ChatMessage },
    /// Sent when the recipient's queue stayed empty for a full idle interval.
    Heartbeat,
}
