//! Receive-stream transport.
//!
//! A [`StreamConnector`] hands out [`MessageStream`]s without touching the network;
//! the WebSocket handshake happens on the first pull, so a refused or unauthorized
//! stream surfaces as an error from [`MessageStream::next_event`] like any other.

use async_trait::async_trait;
use futures::StreamExt;
use shared::{domain::Login, protocol::ServerEvent, protocol::STREAM_ROUTE};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, error::ProtocolError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;
use url::Url;

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("stream rejected: user is not registered")]
    Unauthenticated,
    #[error("stream cancelled: {0}")]
    Cancelled(String),
    #[error("server unavailable: {0}")]
    Unavailable(String),
    #[error("stream failed: {0}")]
    Other(String),
}

#[async_trait]
pub trait MessageStream: Send {
    /// Next frame from the server. A clean end of stream is reported as
    /// [`TransportError::Cancelled`].
    async fn next_event(&mut self) -> Result<ServerEvent, TransportError>;
}

pub trait StreamConnector: Send + Sync {
    fn open(&self, login: &Login) -> Box<dyn MessageStream>;
}

pub struct WsConnector {
    stream_url: Url,
}

impl WsConnector {
    pub fn new(server_url: &str) -> Result<Self, ClientError> {
        Ok(Self {
            stream_url: stream_url(server_url)?,
        })
    }
}

impl StreamConnector for WsConnector {
    fn open(&self, login: &Login) -> Box<dyn MessageStream> {
        let mut url = self.stream_url.clone();
        url.query_pairs_mut().append_pair("login", login.as_str());
        Box::new(WsMessageStream {
            url: url.to_string(),
            socket: None,
        })
    }
}

/// Maps `http(s)://host[:port]` onto the `ws(s)://` stream endpoint.
pub fn stream_url(server_url: &str) -> Result<Url, ClientError> {
    let invalid = |reason: String| ClientError::InvalidUrl {
        url: server_url.to_string(),
        reason,
    };
    let mut url = Url::parse(server_url).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => {
            return Err(invalid(
                "server_url must start with http:// or https://".into(),
            ))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid(format!("cannot switch scheme to {scheme}")))?;
    let path = format!("{}{STREAM_ROUTE}", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    Ok(url)
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsMessageStream {
    url: String,
    socket: Option<WsStream>,
}

#[async_trait]
impl MessageStream for WsMessageStream {
    async fn next_event(&mut self) -> Result<ServerEvent, TransportError> {
        if self.socket.is_none() {
            let (socket, _) = connect_async(self.url.as_str())
                .await
                .map_err(classify)?;
            debug!(url = %self.url, "receive stream connected");
            self.socket = Some(socket);
        }
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| TransportError::Other("stream not connected".into()))?;

        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| TransportError::Other(format!("invalid server event: {e}")));
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.into_owned())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by server".into());
                    return Err(TransportError::Cancelled(reason));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(classify(err)),
                None => return Err(TransportError::Cancelled("stream ended".into())),
            }
        }
    }
}

fn classify(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => match response.status().as_u16() {
            401 => TransportError::Unauthenticated,
            502..=504 => TransportError::Unavailable(format!("http {}", response.status())),
            _ => TransportError::Other(format!("handshake rejected: http {}", response.status())),
        },
        tungstenite::Error::Io(io) => TransportError::Unavailable(io.to_string()),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Cancelled("connection closed".into())
        }
        tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            TransportError::Unavailable("connection reset".into())
        }
        other => TransportError::Other(other.to_string()),
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
