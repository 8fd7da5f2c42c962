use super::*;

use std::time::Duration;

use axum::{body, body::Body, http::Request};
use server_api::DeliveryConfig;
use shared::{
    domain::{Login, UserInfo},
    protocol::ChatMessage,
};
use storage::MemoryKvStore;
use tokio_tungstenite::{connect_async, tungstenite};
use tower::ServiceExt;

const TEST_HEARTBEAT: Duration = Duration::from_millis(200);

fn login(raw: &str) -> Login {
    Login::parse(raw).expect("login")
}

fn test_state(max_active_streams: usize) -> Arc<AppState> {
    let api = ApiContext::new(Arc::new(MemoryKvStore::new()));
    let delivery = DeliveryConfig {
        heartbeat_interval: TEST_HEARTBEAT,
        replay_limit: 10,
    };
    Arc::new(AppState::new(api, delivery, max_active_streams))
}

/// Creates the user directory directly; skips password hashing.
async fn add_user(state: &AppState, user: &str) {
    state
        .api
        .store
        .create_dir(&format!("/users/{user}"))
        .await
        .expect("user dir");
}

fn json_request(uri: &str, value: serde_json::Value) -> Request<Body> {
    let payload = value.to_string();
    Request::post(uri)
        .header("content-type", "application/json")
        .header("content-length", payload.len())
        .body(Body::from(payload))
        .expect("request")
}

async fn serve(state: Arc<AppState>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = build_router(state, &Settings::default());
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

async fn next_event<S>(ws: &mut S) -> ServerEvent
where
    S: futures::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("frame");
        if let tungstenite::Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("event json");
        }
    }
}

#[tokio::test]
async fn healthz_reports_ok_when_store_is_ready() {
    let app = build_router(test_state(1), &Settings::default());
    let request = Request::get("/healthz").body(Body::empty()).expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn register_login_and_list_routes_work() {
    let app = build_router(test_state(1), &Settings::default());
    let register = serde_json::json!({
        "user_info": { "login": "alice", "full_name": "Alice Liddell" },
        "password": "secret",
    });

    let created = app
        .clone()
        .oneshot(json_request(REGISTER_ROUTE, register.clone()))
        .await
        .expect("response");
    assert_eq!(created.status(), StatusCode::CREATED);

    let duplicate = app
        .clone()
        .oneshot(json_request(REGISTER_ROUTE, register))
        .await
        .expect("response");
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);
    let body = body::to_bytes(duplicate.into_body(), usize::MAX)
        .await
        .expect("body");
    let err: ApiError = serde_json::from_slice(&body).expect("json");
    assert_eq!(err.code, ErrorCode::AlreadyExists);

    let ok = app
        .clone()
        .oneshot(json_request(
            LOGIN_ROUTE,
            serde_json::json!({ "login": "alice", "password": "secret" }),
        ))
        .await
        .expect("response");
    assert_eq!(ok.status(), StatusCode::NO_CONTENT);

    let denied = app
        .clone()
        .oneshot(json_request(
            LOGIN_ROUTE,
            serde_json::json!({ "login": "alice", "password": "wrong" }),
        ))
        .await
        .expect("response");
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let list = app
        .oneshot(Request::get(USERS_ROUTE).body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(list.status(), StatusCode::OK);
    let body = body::to_bytes(list.into_body(), usize::MAX)
        .await
        .expect("body");
    let users: GetAllUsersResponse = serde_json::from_slice(&body).expect("json");
    assert_eq!(
        users.users,
        vec![UserInfo {
            login: login("alice"),
            full_name: "Alice Liddell".into(),
        }]
    );
}

#[tokio::test]
async fn send_message_maps_errors_to_status_codes() {
    let state = test_state(1);
    add_user(&state, "alice").await;
    add_user(&state, "bob").await;
    let app = build_router(Arc::clone(&state), &Settings::default());

    let send = |to: &str, body: &str| {
        json_request(
            MESSAGES_ROUTE,
            serde_json::json!({
                "message": ChatMessage::new(login("alice"), login(to), body),
            }),
        )
    };

    let sent = app.clone().oneshot(send("bob", "hi")).await.expect("response");
    assert_eq!(sent.status(), StatusCode::NO_CONTENT);

    let missing = app.clone().oneshot(send("ghost", "hi")).await.expect("response");
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let blank = app.oneshot(send("bob", "  ")).await.expect("response");
    assert_eq!(blank.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oversized_request_body_is_rejected() {
    let settings = Settings {
        max_request_bytes: 64,
        ..Settings::default()
    };
    let app = build_router(test_state(1), &settings);
    let request = json_request(
        LOGIN_ROUTE,
        serde_json::json!({ "login": "alice", "password": "x".repeat(256) }),
    );
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn stream_for_unregistered_login_is_refused_before_upgrade() {
    let addr = serve(test_state(1)).await;
    let err = connect_async(format!("ws://{addr}{STREAM_ROUTE}?login=ghost"))
        .await
        .err()
        .expect("handshake should fail");
    match err {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED.as_u16())
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn stream_delivers_queued_messages_then_heartbeats() {
    let state = test_state(1);
    add_user(&state, "alice").await;
    add_user(&state, "bob").await;
    send_message(&state.api, ChatMessage::new(login("alice"), login("bob"), "hello"))
        .await
        .expect("send");

    let addr = serve(Arc::clone(&state)).await;
    let (mut ws, _) = connect_async(format!("ws://{addr}{STREAM_ROUTE}?login=bob"))
        .await
        .expect("connect");

    match next_event(&mut ws).await {
        ServerEvent::MessageReceived { message } => {
            assert_eq!(message.body, "hello");
            assert_eq!(message.from_user, login("alice"));
        }
        other => panic!("expected a message, got {other:?}"),
    }
    assert_eq!(next_event(&mut ws).await, ServerEvent::Heartbeat);

    send_message(&state.api, ChatMessage::new(login("alice"), login("bob"), "again"))
        .await
        .expect("send");
    loop {
        match next_event(&mut ws).await {
            ServerEvent::Heartbeat => continue,
            ServerEvent::MessageReceived { message } => {
                assert_eq!(message.body, "again");
                break;
            }
        }
    }
    ws.close(None).await.expect("close");
}

#[tokio::test]
async fn streams_beyond_the_limit_wait_for_a_free_slot() {
    let state = test_state(1);
    add_user(&state, "alice").await;
    add_user(&state, "bob").await;
    let addr = serve(Arc::clone(&state)).await;

    let (mut first, _) = connect_async(format!("ws://{addr}{STREAM_ROUTE}?login=alice"))
        .await
        .expect("connect");
    assert_eq!(next_event(&mut first).await, ServerEvent::Heartbeat);

    let (mut second, _) = connect_async(format!("ws://{addr}{STREAM_ROUTE}?login=bob"))
        .await
        .expect("connect");
    let idle = tokio::time::timeout(TEST_HEARTBEAT * 3, second.next()).await;
    assert!(idle.is_err(), "second stream should not be served yet");

    first.close(None).await.expect("close");
    assert_eq!(next_event(&mut second).await, ServerEvent::Heartbeat);
}
