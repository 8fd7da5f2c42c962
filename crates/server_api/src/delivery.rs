//! Server side of the receive stream.
//!
//! One [`DeliveryLoop`] runs per open stream. It replays the tail of the listener's
//! `sent` queue, then long-polls `to_send`: every drained batch is pushed to the stream
//! in queue order and committed to `sent`; an idle interval with nothing queued produces
//! a single heartbeat frame. The loop ends when the stream's receiving half is dropped.

use std::time::Duration;

use shared::{
    domain::{Login, QueueName},
    error::{ApiError, ErrorCode},
    protocol::ServerEvent,
};
use storage::{DrainMode, QueueEntry, QueueError, QueueStore};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{queue_error, ApiContext};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_REPLAY_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct DeliveryConfig {
    pub heartbeat_interval: Duration,
    pub replay_limit: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            replay_limit: DEFAULT_REPLAY_LIMIT,
        }
    }
}

pub struct DeliveryLoop {
    queues: QueueStore,
    login: Login,
    config: DeliveryConfig,
}

/// Validates the listener and prepares its queues. Fails with `Unauthenticated`
/// for an unregistered login, before anything is streamed.
pub async fn open_delivery(
    ctx: &ApiContext,
    login: &Login,
    config: DeliveryConfig,
) -> Result<DeliveryLoop, ApiError> {
    ctx.queues
        .ensure_user_queues(login)
        .await
        .map_err(|err| match err {
            QueueError::UserNotFound(login) => ApiError::new(
                ErrorCode::Unauthenticated,
                format!("user {login} is not registered"),
            ),
            other => queue_error(other),
        })?;
    Ok(DeliveryLoop {
        queues: ctx.queues.clone(),
        login: login.clone(),
        config,
    })
}

impl DeliveryLoop {
    pub fn login(&self) -> &Login {
        &self.login
    }

    pub async fn run(self, events: mpsc::Sender<ServerEvent>) {
        if self.replay(&events).await {
            self.poll(&events).await;
        }
        info!(login = %self.login, "stream to user ended");
    }

    async fn replay(&self, events: &mpsc::Sender<ServerEvent>) -> bool {
        let history = self
            .queues
            .history(&self.login, self.config.replay_limit)
            .await;
        for entry in &history {
            match entry.decode() {
                Ok(message) => {
                    if events
                        .send(ServerEvent::MessageReceived { message })
                        .await
                        .is_err()
                    {
                        return false;
                    }
                }
                Err(error) => warn!(key = %entry.key, %error, "skipping undecodable history entry"),
            }
        }
        debug!(login = %self.login, count = history.len(), "history replayed");
        true
    }

    async fn poll(&self, events: &mpsc::Sender<ServerEvent>) {
        while !events.is_closed() {
            let mut batch = self
                .queues
                .drain(&self.login, QueueName::ToSend, DrainMode::PeekAll)
                .await;

            if batch.is_empty() {
                let wait = DrainMode::BlockOne(self.config.heartbeat_interval);
                batch = tokio::select! {
                    _ = events.closed() => break,
                    waited = self.queues.drain(&self.login, QueueName::ToSend, wait) => waited,
                };
                if batch.is_empty() {
                    debug!(login = %self.login, "idle timeout reached, sending heartbeat");
                    if events.send(ServerEvent::Heartbeat).await.is_err() {
                        break;
                    }
                    continue;
                }
            }

            if !self.deliver_and_commit(events, batch).await {
                break;
            }
        }
    }

    /// Returns `false` once the stream is gone. Only entries handed to the stream
    /// (or skipped as undecodable) are committed.
    async fn deliver_and_commit(
        &self,
        events: &mpsc::Sender<ServerEvent>,
        batch: Vec<QueueEntry>,
    ) -> bool {
        let mut handled = Vec::with_capacity(batch.len());
        let mut open = true;
        for entry in batch {
            match entry.decode() {
                Ok(message) => {
                    debug!(
                        from = %message.from_user,
                        to = %message.to_user,
                        "delivering message"
                    );
                    if events
                        .send(ServerEvent::MessageReceived { message })
                        .await
                        .is_err()
                    {
                        open = false;
                        break;
                    }
                }
                Err(error) => {
                    warn!(key = %entry.key, %error, "undecodable queue entry, moving to sent without delivery");
                }
            }
            handled.push(entry);
        }

        if let Err(error) = self.queues.commit(&self.login, &handled).await {
            warn!(login = %self.login, %error, "commit of delivered batch failed");
        }
        open
    }
}

#[cfg(test)]
#[path = "tests/delivery_tests.rs"]
mod tests;
