use std::sync::Arc;

use askama::Template;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quipwit::config::{self, ApiKeyStore};
use quipwit::game::{self, ConnRole, Registry, RoomCommand, RoomEvent, RoomHandle};
use quipwit::network;
use quipwit::prompts::{FallbackPromptSource, PromptSource, RemoteGenerator};
use quipwit::types::*;

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    api_keys: Arc<ApiKeyStore>,
    port: u16,
}

impl AppState {
    /// Prompt source for a new room, snapshotting the current API key.
    /// Rooms never re-read config mid-game.
    fn prompt_source(&self) -> Arc<dyn PromptSource> {
        let remote = self.api_keys.get().map(RemoteGenerator::new);
        Arc::new(FallbackPromptSource::new(remote))
    }
}

// ─── Templates ────────────────────────────────────────────────────

#[derive(Template)]
#[template(path = "host.html")]
struct HostTemplate;

#[derive(Template)]
#[template(path = "play.html")]
struct PlayTemplate {
    code: Option<String>,
}

// ─── Page routes ──────────────────────────────────────────────────

async fn index_page() -> impl IntoResponse {
    Redirect::to("/host")
}

async fn host_page() -> impl IntoResponse {
    Html(HostTemplate.to_string())
}

#[derive(Deserialize)]
struct PlayQuery {
    code: Option<String>,
}

async fn play_page(Query(params): Query<PlayQuery>) -> impl IntoResponse {
    let code = params.code.map(|c| c.trim().to_ascii_uppercase());
    Html(PlayTemplate { code }.to_string())
}

// ─── Ops API ──────────────────────────────────────────────────────

async fn api_network(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "addresses": network::join_addresses(),
        "port": state.port,
    }))
}

async fn api_config_status(State(state): State<AppState>) -> impl IntoResponse {
    let has_key = state.api_keys.has();
    Json(json!({
        "hasApiKey": has_key,
        "aiAvailable": has_key,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiKeyBody {
    api_key: String,
    #[serde(default)]
    persist: bool,
}

async fn api_config_apikey(
    State(state): State<AppState>,
    Json(body): Json<ApiKeyBody>,
) -> impl IntoResponse {
    let key = body.api_key.trim().to_string();
    if !key.starts_with("sk-ant-") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "API key must start with sk-ant-"})),
        );
    }
    match state.api_keys.set(key, body.persist) {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))),
        Err(e) => {
            tracing::error!("Failed to persist API key: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Failed to persist API key"})),
            )
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiKeyTestBody {
    #[serde(default)]
    api_key: Option<String>,
}

async fn api_config_test(
    State(state): State<AppState>,
    Json(body): Json<ApiKeyTestBody>,
) -> impl IntoResponse {
    let key = body
        .api_key
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .or_else(|| state.api_keys.get());

    let Some(key) = key else {
        return Json(json!({"valid": false, "error": "No API key configured"}));
    };

    match RemoteGenerator::new(key).validate().await {
        Ok(()) => Json(json!({"valid": true})),
        Err(e) => Json(json!({"valid": false, "error": e.to_string()})),
    }
}

// ─── WebSocket plumbing ───────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));

    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!("WebSocket connected: {}", conn_id);

    // Which room this socket currently listens to.
    let current_room: Arc<Mutex<Option<RoomHandle>>> = Arc::new(Mutex::new(None));

    // Forward room events to this socket.
    let sender_clone = sender.clone();
    let conn_id_clone = conn_id.clone();
    let current_room_clone = current_room.clone();

    let event_task = tokio::spawn(async move {
        loop {
            let handle = {
                let guard = current_room_clone.lock().await;
                guard.clone()
            };

            let Some(handle) = handle else {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                continue;
            };

            let mut event_rx = handle.event_tx.subscribe();

            loop {
                match event_rx.recv().await {
                    Ok(event) => {
                        let msg = match &event {
                            RoomEvent::SendTo { conn_id, msg } | RoomEvent::Kick { conn_id, msg } => {
                                if *conn_id != conn_id_clone {
                                    continue;
                                }
                                msg
                            }
                            RoomEvent::Broadcast { msg } => msg,
                        };

                        if let Ok(json) = serde_json::to_string(msg) {
                            let mut s = sender_clone.lock().await;
                            if s.send(Message::Text(json.into())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        // Room ended; wait for a potential new room.
                        break;
                    }
                }
            }
        }
    });

    // Process incoming messages.
    while let Some(Ok(msg)) = receiver.next().await {
        let Message::Text(text) = msg else { continue };

        let client_msg: ClientMsg = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid message from {}: {}", conn_id, e);
                continue;
            }
        };

        match client_msg {
            ClientMsg::CreateRoom => {
                let handle =
                    game::create_room(&state.registry, state.prompt_source(), conn_id.clone());
                send_msg(
                    &sender,
                    &ServerMsg::RoomCreated {
                        room_code: handle.code.clone(),
                        host_id: handle.host_id.clone(),
                        join_url: network::advertised_join_url(state.port),
                    },
                )
                .await;
                *current_room.lock().await = Some(handle);
            }

            other => {
                let Some(code) = other.room_code() else { continue };
                let Some(handle) = state.registry.get_room(code) else {
                    send_msg(
                        &sender,
                        &ServerMsg::error(ErrorCode::RoomNotFound, "Room not found"),
                    )
                    .await;
                    continue;
                };

                // Joining (or rejoining) binds the socket to the room's
                // event stream.
                let binds = matches!(
                    other,
                    ClientMsg::JoinRoom { .. }
                        | ClientMsg::Rejoin { .. }
                        | ClientMsg::RejoinHost { .. }
                );

                if let Some(cmd) = to_command(other, &conn_id) {
                    let _ = handle.cmd_tx.send(cmd).await;
                }
                if binds {
                    *current_room.lock().await = Some(handle);
                }
            }
        }
    }

    // Socket disconnected.
    tracing::info!("WebSocket disconnected: {}", conn_id);
    event_task.abort();

    if let Some((handle, role)) = state.registry.find_by_connection(&conn_id) {
        let cmd = match role {
            ConnRole::Host => RoomCommand::HostDisconnected {
                conn_id: conn_id.clone(),
            },
            ConnRole::Player => RoomCommand::PlayerDisconnected {
                conn_id: conn_id.clone(),
            },
        };
        let _ = handle.cmd_tx.send(cmd).await;
    }
}

/// Translate an inbound message into a room command for this connection.
fn to_command(msg: ClientMsg, conn_id: &str) -> Option<RoomCommand> {
    let conn_id = conn_id.to_string();
    Some(match msg {
        ClientMsg::CreateRoom => return None,
        ClientMsg::JoinRoom { player_name, .. } => RoomCommand::Join {
            conn_id,
            player_name,
        },
        ClientMsg::Rejoin { player_id, .. } => RoomCommand::Rejoin { conn_id, player_id },
        ClientMsg::RejoinHost { host_id, .. } => RoomCommand::RejoinHost { conn_id, host_id },
        ClientMsg::StartGame { theme, .. } => RoomCommand::StartGame { conn_id, theme },
        ClientMsg::SubmitAnswer {
            prompt_id,
            answer,
            is_last_lash,
            ..
        } => RoomCommand::SubmitAnswer {
            conn_id,
            prompt_id,
            answer,
            is_last_lash,
        },
        ClientMsg::SubmitVote {
            prompt_id, vote, ..
        } => RoomCommand::SubmitVote {
            conn_id,
            prompt_id,
            vote,
        },
        ClientMsg::SubmitLastLashVotes { voted_for, .. } => {
            RoomCommand::SubmitFinaleVote { conn_id, voted_for }
        }
        ClientMsg::SkipPlayer { player_id, .. } => RoomCommand::SkipPlayer { conn_id, player_id },
        ClientMsg::KickPlayer { player_id, .. } => RoomCommand::KickPlayer { conn_id, player_id },
        ClientMsg::PauseGame { .. } => RoomCommand::PauseGame { conn_id },
        ClientMsg::ResumeGame { .. } => RoomCommand::ResumeGame { conn_id },
        ClientMsg::ExtendTime { seconds, .. } => RoomCommand::ExtendTime { conn_id, seconds },
        ClientMsg::EndGame { .. } => RoomCommand::EndGame { conn_id },
        ClientMsg::ContinueLastWit { .. } => RoomCommand::ContinueLastWit { conn_id },
    })
}

async fn send_msg(sender: &Arc<Mutex<SplitSink<WebSocket, Message>>>, msg: &ServerMsg) {
    if let Ok(json) = serde_json::to_string(msg) {
        let mut s = sender.lock().await;
        let _ = s.send(Message::Text(json.into())).await;
    }
}

// ─── Main ─────────────────────────────────────────────────────────

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() {
    // Load .env if present, before any env var reads.
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quipwit=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config::init();

    let port = config::port();
    let registry = Registry::new();
    game::spawn_reaper(registry.clone());

    let state = AppState {
        registry,
        api_keys: Arc::new(ApiKeyStore::load()),
        port,
    };

    let app = Router::new()
        .route("/", get(index_page))
        .route("/host", get(host_page))
        .route("/play", get(play_page))
        .route("/ws", get(ws_handler))
        .route("/api/network", get(api_network))
        .route("/api/config/status", get(api_config_status))
        .route("/api/config/apikey", post(api_config_apikey))
        .route("/api/config/test", post(api_config_test))
        .nest_service("/static", ServeDir::new("static"))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .expect("Failed to bind");

    tracing::info!("QuipWit server running on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}
