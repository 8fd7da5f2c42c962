use super::*;

use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket},
        Query, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use shared::protocol::ChatMessage;
use tokio::net::TcpListener;

#[derive(Deserialize)]
struct StreamParams {
    login: String,
}

async fn stream_handler(ws: WebSocketUpgrade, Query(params): Query<StreamParams>) -> Response {
    match params.login.as_str() {
        "bob" => ws.on_upgrade(serve_bob),
        "garbled" => ws.on_upgrade(serve_garbage),
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn serve_bob(mut socket: WebSocket) {
    let message = ChatMessage::new(login("alice"), login("bob"), "hi");
    for event in [ServerEvent::MessageReceived { message }, ServerEvent::Heartbeat] {
        let text = serde_json::to_string(&event).expect("json");
        if socket.send(WsMessage::Text(text)).await.is_err() {
            return;
        }
    }
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code: 1000,
            reason: "stream ended".into(),
        })))
        .await;
}

async fn serve_garbage(mut socket: WebSocket) {
    let _ = socket.send(WsMessage::Text("not json".into())).await;
    while let Some(Ok(_)) = socket.recv().await {}
}

async fn spawn_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route(STREAM_ROUTE, get(stream_handler));
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

fn login(raw: &str) -> Login {
    Login::parse(raw).expect("login")
}

fn connector(addr: SocketAddr) -> WsConnector {
    WsConnector::new(&format!("http://{addr}")).expect("connector")
}

#[test]
fn stream_url_switches_scheme_and_appends_route() {
    assert_eq!(
        stream_url("http://127.0.0.1:8080").expect("url").as_str(),
        "ws://127.0.0.1:8080/messages/stream"
    );
    assert_eq!(
        stream_url("https://chat.example.com/api/?x=1")
            .expect("url")
            .as_str(),
        "wss://chat.example.com/api/messages/stream"
    );
    assert!(matches!(
        stream_url("ftp://chat.example.com"),
        Err(ClientError::InvalidUrl { .. })
    ));
}

#[tokio::test]
async fn frames_arrive_in_order_then_close_is_cancelled() {
    let addr = spawn_server().await;
    let mut stream = connector(addr).open(&login("bob"));

    match stream.next_event().await.expect("message") {
        ServerEvent::MessageReceived { message } => {
            assert_eq!(message.body, "hi");
            assert_eq!(message.from_user, login("alice"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(stream.next_event().await, Ok(ServerEvent::Heartbeat));
    assert_eq!(
        stream.next_event().await,
        Err(TransportError::Cancelled("stream ended".into()))
    );
}

#[tokio::test]
async fn rejected_handshake_is_unauthenticated() {
    let addr = spawn_server().await;
    let mut stream = connector(addr).open(&login("ghost"));
    assert_eq!(stream.next_event().await, Err(TransportError::Unauthenticated));
}

#[tokio::test]
async fn refused_connection_is_unavailable_on_first_pull() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let mut stream = connector(addr).open(&login("bob"));
    assert!(matches!(
        stream.next_event().await,
        Err(TransportError::Unavailable(_))
    ));
}

#[tokio::test]
async fn undecodable_frame_is_an_other_error() {
    let addr = spawn_server().await;
    let mut stream = connector(addr).open(&login("garbled"));
    assert!(matches!(
        stream.next_event().await,
        Err(TransportError::Other(_))
    ));
}
