//! Background receiver for one open stream.
//!
//! The foreground only sees a [`ReceiverState`] through a watch channel and can ask
//! the task to stop through a cancellation token. Once the state leaves `Listening`
//! it never changes again.

use shared::protocol::{ChatMessage, ServerEvent};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    transport::{MessageStream, TransportError},
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Listening,
    Stopped,
    /// The server refused the stream because the login is not registered.
    Unauthenticated,
}

pub struct StreamReceiver {
    cancel: CancellationToken,
    state: watch::Receiver<ReceiverState>,
    task: JoinHandle<()>,
}

impl StreamReceiver {
    pub fn spawn(stream: Box<dyn MessageStream>, events: broadcast::Sender<ClientEvent>) -> Self {
        let cancel = CancellationToken::new();
        let (state_tx, state) = watch::channel(ReceiverState::Listening);
        let task = tokio::spawn(run(stream, cancel.clone(), state_tx, events));
        Self {
            cancel,
            state,
            task,
        }
    }

    pub fn state(&self) -> ReceiverState {
        *self.state.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == ReceiverState::Stopped
    }

    pub fn is_unauthenticated(&self) -> bool {
        self.state() == ReceiverState::Unauthenticated
    }

    /// Waits until the receiver has left `Listening` and returns where it ended up.
    pub async fn finished(&self) -> ReceiverState {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s != ReceiverState::Listening)
            .await
            .map(|s| *s);
        reached.unwrap_or_else(|_| *state.borrow())
    }

    /// Requests a stop; a pending pull is abandoned.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) {
        if let Err(err) = self.task.await {
            warn!(%err, "receiver task failed");
        }
    }
}

/// `[HH:MM] sender: body`, using the message's own timestamp.
pub fn render_message(message: &ChatMessage) -> String {
    format!(
        "[{}] {}: {}",
        message.timestamp.format("%H:%M"),
        message.from_user,
        message.body
    )
}

async fn run(
    mut stream: Box<dyn MessageStream>,
    cancel: CancellationToken,
    state_tx: watch::Sender<ReceiverState>,
    events: broadcast::Sender<ClientEvent>,
) {
    debug!("stream receiver started");
    let final_state = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("stream cancelled because user closed");
                break ReceiverState::Stopped;
            }
            next = stream.next_event() => next,
        };

        match next {
            Ok(ServerEvent::MessageReceived { message }) => {
                let line = render_message(&message);
                info!("{line}");
                let _ = events.send(ClientEvent::MessageReceived { message, line });
            }
            Ok(ServerEvent::Heartbeat) => {
                debug!("heartbeat");
                let _ = events.send(ClientEvent::Heartbeat);
            }
            Err(TransportError::Unauthenticated) => {
                debug!("user not registered");
                break ReceiverState::Unauthenticated;
            }
            Err(err @ TransportError::Cancelled(_)) => {
                info!(%err, "stream cancelled by server");
                break ReceiverState::Stopped;
            }
            Err(err @ TransportError::Unavailable(_)) => {
                warn!(%err, "server unavailable");
                break ReceiverState::Stopped;
            }
            Err(err @ TransportError::Other(_)) => {
                error!(%err, "stream failed");
                break ReceiverState::Stopped;
            }
        }
    };

    drop(stream);
    state_tx.send_replace(final_state);
    let _ = events.send(ClientEvent::ReceiverStopped(final_state));
}

#[cfg(test)]
#[path = "tests/receiver_tests.rs"]
mod tests;
