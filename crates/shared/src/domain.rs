use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_LOGIN_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoginError {
    #[error("login cannot be blank")]
    Blank,
    #[error("login exceeds {MAX_LOGIN_LEN} bytes")]
    TooLong,
    #[error("login must not contain '/' or whitespace")]
    InvalidCharacter,
}

/// Unique user handle. Doubles as a path segment in the store, so separators
/// and whitespace are rejected up front.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Login(String);

impl Login {
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, LoginError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(LoginError::Blank);
        }
        if trimmed.len() > MAX_LOGIN_LEN {
            return Err(LoginError::TooLong);
        }
        if trimmed.chars().any(|c| c == '/' || c.is_whitespace()) {
            return Err(LoginError::InvalidCharacter);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Login {
    type Error = LoginError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Login> for String {
    fn from(value: Login) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    ToSend,
    Sent,
}

impl QueueName {
    pub fn dir_name(self) -> &'static str {
        match self {
            QueueName::ToSend => "to_send_queue",
            QueueName::Sent => "sent_queue",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub login: Login,
    pub full_name: String,
}
