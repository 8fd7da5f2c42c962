use std::sync::Arc;

use shared::{
    domain::{Login, UserInfo},
    error::ErrorCode,
    protocol::ChatMessage,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    api::{ChatApi, HttpChatApi},
    error::ClientError,
    receiver::StreamReceiver,
    transport::{StreamConnector, WsConnector},
    ClientEvent,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The recipient does not exist; carries the registered users at the time.
    RecipientNotFound { available: Vec<UserInfo> },
    /// The server no longer accepts this login's stream.
    SessionInvalid,
}

/// One logged-in user: unary calls plus at most one live receiver.
pub struct ChatSession {
    login: Login,
    api: Arc<dyn ChatApi>,
    connector: Arc<dyn StreamConnector>,
    receiver: Option<StreamReceiver>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatSession {
    pub fn new(login: Login, api: Arc<dyn ChatApi>, connector: Arc<dyn StreamConnector>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            login,
            api,
            connector,
            receiver: None,
            events,
        }
    }

    /// HTTP for unary calls, WebSocket for the receive stream.
    pub fn connect(server_url: &str, login: Login) -> Result<Self, ClientError> {
        let api = Arc::new(HttpChatApi::new(server_url)?);
        let connector = Arc::new(WsConnector::new(server_url)?);
        Ok(Self::new(login, api, connector))
    }

    pub fn login(&self) -> &Login {
        &self.login
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn register(&self, full_name: &str, password: &str) -> Result<(), ClientError> {
        let user_info = UserInfo {
            login: self.login.clone(),
            full_name: full_name.to_string(),
        };
        self.api.register_user(user_info, password).await?;
        info!(login = %self.login, "registered");
        Ok(())
    }

    pub async fn authenticate(&self, password: &str) -> Result<(), ClientError> {
        self.api.login_user(&self.login, password).await
    }

    pub async fn users(&self) -> Result<Vec<UserInfo>, ClientError> {
        self.api.get_all_users().await
    }

    /// False once the server has refused this login's stream.
    pub fn is_session_valid(&self) -> bool {
        !self
            .receiver
            .as_ref()
            .is_some_and(StreamReceiver::is_unauthenticated)
    }

    pub fn is_receiver_stopped(&self) -> bool {
        self.receiver.as_ref().map_or(true, StreamReceiver::is_stopped)
    }

    /// Starts a receiver unless one is still live. A stopped receiver is joined first.
    pub async fn open_receiver(&mut self) {
        if let Some(existing) = self.receiver.take() {
            if !existing.is_stopped() {
                self.receiver = Some(existing);
                return;
            }
            existing.join().await;
        }
        debug!(login = %self.login, "stream receiver connecting");
        let stream = self.connector.open(&self.login);
        self.receiver = Some(StreamReceiver::spawn(stream, self.events.clone()));
    }

    pub async fn send_to(&mut self, to: &Login, text: &str) -> Result<SendOutcome, ClientError> {
        if self.is_receiver_stopped() {
            warn!("receiver stream closed, trying to reopen");
            self.open_receiver().await;
        }
        if !self.is_session_valid() {
            warn!(login = %self.login, "user is not registered");
            return Ok(SendOutcome::SessionInvalid);
        }

        let message = ChatMessage::new(self.login.clone(), to.clone(), text);
        match self.api.send_message(message).await {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(err) if err.code() == Some(ErrorCode::NotFound) => {
                info!(user = %to, "user not found");
                let available = self.users().await?;
                let listing = available
                    .iter()
                    .map(|u| format!("{} - {}", u.login, u.full_name))
                    .collect::<Vec<_>>()
                    .join(", ");
                info!("registered users: {listing}");
                Ok(SendOutcome::RecipientNotFound { available })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn close_receiver(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.stop();
            receiver.join().await;
            debug!(login = %self.login, "stream receiver closed");
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
