use shared::protocol::ChatMessage;

pub mod api;
pub mod error;
pub mod receiver;
pub mod session;
pub mod transport;

pub use api::{ChatApi, HttpChatApi};
pub use error::ClientError;
pub use receiver::{render_message, ReceiverState, StreamReceiver};
pub use session::{ChatSession, SendOutcome};
pub use transport::{MessageStream, StreamConnector, TransportError, WsConnector};

#[derive(Debug, Clone)]
pub enum ClientEvent {
    MessageReceived {
        message: ChatMessage,
        /// Console rendering of `message`.
        line: String,
    },
    Heartbeat,
    ReceiverStopped(ReceiverState),
}
