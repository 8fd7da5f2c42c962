use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use server_api::{
    get_all_users, health_check, login_user, open_delivery, register_user, send_message,
    ApiContext, DeliveryLoop,
};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{
        GetAllUsersResponse, LoginUserRequest, RegisterUserRequest, SendMessageRequest,
        ServerEvent, StreamQuery, LOGIN_ROUTE, MESSAGES_ROUTE, REGISTER_ROUTE, STREAM_ROUTE,
        USERS_ROUTE,
    },
};
use tokio::sync::mpsc;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;

use app_state::AppState;
use config::{load_settings, Settings};

/// Frames queued between the delivery loop and the socket writer. With one slot, at
/// most two committed entries (one queued, one being written) are ahead of the socket.
const STREAM_BUFFER: usize = 1;

type HttpResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = load_settings();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = storage::open_store(&settings.store_url)
        .await
        .map_err(|error| {
            error!(
                store_url = %settings.store_url,
                %error,
                "failed to open message store; verify the path and permissions"
            );
            error
        })?;
    let state = AppState::new(
        ApiContext::new(store),
        settings.delivery(),
        settings.max_active_streams,
    );
    let app = build_router(Arc::new(state), &settings);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, store_url = %settings.store_url, "chat server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("chat server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn build_router(state: Arc<AppState>, settings: &Settings) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(REGISTER_ROUTE, post(http_register_user))
        .route(LOGIN_ROUTE, post(http_login_user))
        .route(USERS_ROUTE, get(http_get_all_users))
        .route(MESSAGES_ROUTE, post(http_send_message))
        .route(STREAM_ROUTE, get(ws_handler))
        .layer(RequestBodyLimitLayer::new(settings.max_request_bytes))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::AlreadyExists => StatusCode::CONFLICT,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = status_for(err.code);
    if status.is_server_error() {
        error!(code = ?err.code, message = %err.message, "request failed");
    } else {
        debug!(code = ?err.code, message = %err.message, "request rejected");
    }
    (status, Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> HttpResult<&'static str> {
    health_check(&state.api).await.map_err(reject)?;
    Ok("ok")
}

async fn http_register_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterUserRequest>,
) -> HttpResult<StatusCode> {
    register_user(&state.api, req.user_info, &req.password)
        .await
        .map_err(reject)?;
    Ok(StatusCode::CREATED)
}

async fn http_login_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginUserRequest>,
) -> HttpResult<StatusCode> {
    login_user(&state.api, &req.login, &req.password)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_get_all_users(
    State(state): State<Arc<AppState>>,
) -> HttpResult<Json<GetAllUsersResponse>> {
    let users = get_all_users(&state.api).await.map_err(reject)?;
    Ok(Json(GetAllUsersResponse { users }))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendMessageRequest>,
) -> HttpResult<StatusCode> {
    send_message(&state.api, req.message)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Unregistered listeners are refused with 401 before the upgrade completes.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> HttpResult<impl IntoResponse> {
    let delivery = open_delivery(&state.api, &q.login, state.delivery)
        .await
        .map_err(reject)?;
    Ok(ws.on_upgrade(move |socket| stream_connection(state, socket, delivery)))
}

async fn stream_connection(state: Arc<AppState>, socket: WebSocket, delivery: DeliveryLoop) {
    let login = delivery.login().clone();
    let Ok(_slot) = Arc::clone(&state.stream_slots).acquire_owned().await else {
        warn!(%login, "stream slots closed, dropping connection");
        return;
    };
    info!(%login, "receive stream opened");

    let (mut sender, mut receiver) = socket.split();
    let (events_tx, mut events_rx) = mpsc::channel::<ServerEvent>(STREAM_BUFFER);
    let delivery_task = tokio::spawn(delivery.run(events_tx));

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(v) => v,
                    Err(error) => {
                        warn!(%error, "failed to encode stream frame");
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    drop(events_rx);
    if let Err(error) = delivery_task.await {
        warn!(%login, %error, "delivery task failed");
    }
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "stream ended".into(),
        })))
        .await;
    info!(%login, "receive stream closed");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
