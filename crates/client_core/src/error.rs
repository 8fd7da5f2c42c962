use shared::{
    domain::LoginError,
    error::{ApiException, ErrorCode},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] ApiException),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid server url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error(transparent)]
    InvalidLogin(#[from] LoginError),
}

impl ClientError {
    /// Server-side error code, when the server answered with one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Api(err) => Some(err.code),
            _ => None,
        }
    }
}
