use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use shared::{
    domain::{Login, UserInfo},
    error::{ApiError, ApiException, ErrorCode},
    protocol::{
        ChatMessage, GetAllUsersResponse, LoginUserRequest, RegisterUserRequest,
        SendMessageRequest, LOGIN_ROUTE, MESSAGES_ROUTE, REGISTER_ROUTE, USERS_ROUTE,
    },
};
use tracing::debug;
use url::Url;

use crate::error::ClientError;

/// Unary calls against the chat server.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn register_user(&self, user_info: UserInfo, password: &str) -> Result<(), ClientError>;
    async fn login_user(&self, login: &Login, password: &str) -> Result<(), ClientError>;
    async fn get_all_users(&self) -> Result<Vec<UserInfo>, ClientError>;
    async fn send_message(&self, message: ChatMessage) -> Result<(), ClientError>;
}

pub struct HttpChatApi {
    http: Client,
    server_url: String,
}

impl HttpChatApi {
    pub fn new(server_url: &str) -> Result<Self, ClientError> {
        let parsed = Url::parse(server_url).map_err(|e| ClientError::InvalidUrl {
            url: server_url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ClientError::InvalidUrl {
                url: server_url.to_string(),
                reason: "server_url must start with http:// or https://".into(),
            });
        }
        Ok(Self {
            http: Client::new(),
            server_url: server_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, route: &str) -> String {
        format!("{}{route}", self.server_url)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn register_user(&self, user_info: UserInfo, password: &str) -> Result<(), ClientError> {
        let res = self
            .http
            .post(self.endpoint(REGISTER_ROUTE))
            .json(&RegisterUserRequest {
                user_info,
                password: password.to_string(),
            })
            .send()
            .await?;
        check_status(res).await?;
        Ok(())
    }

    async fn login_user(&self, login: &Login, password: &str) -> Result<(), ClientError> {
        let res = self
            .http
            .post(self.endpoint(LOGIN_ROUTE))
            .json(&LoginUserRequest {
                login: login.clone(),
                password: password.to_string(),
            })
            .send()
            .await?;
        check_status(res).await?;
        Ok(())
    }

    async fn get_all_users(&self) -> Result<Vec<UserInfo>, ClientError> {
        let res = self.http.get(self.endpoint(USERS_ROUTE)).send().await?;
        let body: GetAllUsersResponse = check_status(res).await?.json().await?;
        Ok(body.users)
    }

    async fn send_message(&self, message: ChatMessage) -> Result<(), ClientError> {
        debug!(to = %message.to_user, "sending message");
        let res = self
            .http
            .post(self.endpoint(MESSAGES_ROUTE))
            .json(&SendMessageRequest { message })
            .send()
            .await?;
        check_status(res).await?;
        Ok(())
    }
}

/// Turns a non-2xx answer into [`ClientError::Api`], preferring the server's JSON body.
async fn check_status(res: Response) -> Result<Response, ClientError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    let error = serde_json::from_str::<ApiError>(&body).unwrap_or_else(|_| {
        let message = if body.is_empty() {
            status.to_string()
        } else {
            body
        };
        ApiError::new(code_for_status(status), message)
    });
    Err(ApiException::from(error).into())
}

fn code_for_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::UNAUTHORIZED => ErrorCode::Unauthenticated,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::CONFLICT => ErrorCode::AlreadyExists,
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => ErrorCode::Validation,
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
            ErrorCode::Unavailable
        }
        _ => ErrorCode::Internal,
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
