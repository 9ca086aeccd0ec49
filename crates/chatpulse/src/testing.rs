//! In-process stand-in for the analytics backend, for tests and demos.
//!
//! Serves the REST endpoints and the realtime socket on an ephemeral port.
//! Replies can be scripted per inbound message or pushed at any time.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::connection::ConnectionState;

#[derive(Debug, Clone)]
enum ServerPush {
    Frame(String),
    Disconnect,
}

struct SessionRecord {
    info: Value,
    messages: Vec<Value>,
    stats: Value,
}

struct MockState {
    health_status: Mutex<String>,
    health_http_status: AtomicU16,
    fail_session_creation: AtomicBool,
    reject_websocket: AtomicBool,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    received: Mutex<Vec<String>>,
    scripted_replies: Mutex<VecDeque<String>>,
    pushes: broadcast::Sender<ServerPush>,
    connections_opened: AtomicUsize,
    active_connections: AtomicUsize,
}

pub struct MockBackend {
    addr: SocketAddr,
    state: Arc<MockState>,
    server: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let (pushes, _) = broadcast::channel(64);
        let state = Arc::new(MockState {
            health_status: Mutex::new("healthy".to_string()),
            health_http_status: AtomicU16::new(200),
            fail_session_creation: AtomicBool::new(false),
            reject_websocket: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
            scripted_replies: Mutex::new(VecDeque::new()),
            pushes,
            connections_opened: AtomicUsize::new(0),
            active_connections: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/sessions", post(create_session_handler))
            .route(
                "/sessions/{id}",
                get(get_session_handler).delete(delete_session_handler),
            )
            .route("/sessions/{id}/messages", get(history_handler))
            .route("/sessions/{id}/stats", get(stats_handler))
            .route("/ws/chat", any(ws_handler))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            server,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws/chat", self.addr)
    }

    pub fn api_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Value reported in the health body's `status` field.
    pub fn set_health(&self, status: &str) {
        *self.state.health_status.lock().unwrap() = status.to_string();
    }

    pub fn set_health_http_status(&self, status: u16) {
        self.state.health_http_status.store(status, Ordering::SeqCst);
    }

    pub fn fail_session_creation(&self, fail: bool) {
        self.state
            .fail_session_creation
            .store(fail, Ordering::SeqCst);
    }

    /// Refuse socket upgrades, so every connection attempt fails.
    pub fn reject_websocket(&self, reject: bool) {
        self.state.reject_websocket.store(reject, Ordering::SeqCst);
    }

    /// Frame sent back in response to the next inbound message.
    pub fn queue_reply(&self, frame: impl Into<String>) {
        self.state
            .scripted_replies
            .lock()
            .unwrap()
            .push_back(frame.into());
    }

    /// Send a frame to every open socket right away.
    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.state.pushes.send(ServerPush::Frame(frame.into()));
    }

    /// Close every open socket from the server side.
    pub fn disconnect_all(&self) {
        let _ = self.state.pushes.send(ServerPush::Disconnect);
    }

    pub fn add_history_record(&self, session_id: &str, record: Value) {
        if let Some(session) = self.state.sessions.lock().unwrap().get_mut(session_id) {
            session.messages.push(record);
        }
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.state.sessions.lock().unwrap().keys().cloned().collect()
    }

    pub fn received_frames(&self) -> Vec<String> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> usize {
        self.state.active_connections.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` frames have arrived.
    pub async fn wait_for_received(&self, count: usize, timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frames = self.received_frames();
            if frames.len() >= count {
                return frames;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {count} frames, got {}",
                frames.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until `count` sockets have been accepted and are ready for pushes.
    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.connections_opened() < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {count} connections, got {}",
                self.connections_opened()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Receive transitions until `target` shows up; returns everything seen.
pub async fn wait_for_state(
    rx: &mut mpsc::UnboundedReceiver<ConnectionState>,
    target: ConnectionState,
    timeout: Duration,
) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(state)) => {
                seen.push(state);
                if state == target {
                    return seen;
                }
            }
            Ok(None) => panic!("status stream closed before {target}; saw {seen:?}"),
            Err(_) => panic!("timed out waiting for {target}; saw {seen:?}"),
        }
    }
}

/// Everything that arrives within `window`.
pub async fn collect_states_for(
    rx: &mut mpsc::UnboundedReceiver<ConnectionState>,
    window: Duration,
) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(state)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        seen.push(state);
    }
    seen
}

/// A `message_response` frame shaped like the real backend's.
pub fn message_response_frame(echo: &str, stats: Value) -> String {
    let words = echo.split_whitespace().count();
    json!({
        "type": "message_response",
        "echo": echo,
        "analytics": {
            "word_count": words,
            "char_count": echo.chars().count(),
            "sentence_count": 1,
            "is_question": echo.trim_end().ends_with('?'),
            "sentiment": "neutral",
            "processed_at": Utc::now().to_rfc3339(),
        },
        "session_stats": stats,
        "timestamp": Utc::now().to_rfc3339(),
    })
    .to_string()
}

fn wire_timestamp() -> String {
    Utc::now()
        .naive_utc()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"detail": "Session not found"})),
    )
        .into_response()
}

async fn health_handler(State(state): State<Arc<MockState>>) -> Response {
    let status = state.health_status.lock().unwrap().clone();
    let code = StatusCode::from_u16(state.health_http_status.load(Ordering::SeqCst))
        .unwrap_or(StatusCode::OK);
    (
        code,
        Json(json!({
            "status": status,
            "active_connections": state.active_connections.load(Ordering::SeqCst),
            "timestamp": wire_timestamp(),
        })),
    )
        .into_response()
}

async fn create_session_handler(State(state): State<Arc<MockState>>) -> Response {
    if state.fail_session_creation.load(Ordering::SeqCst) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"message": "database unavailable"})),
        )
            .into_response();
    }

    let id = uuid::Uuid::new_v4().to_string();
    let info = json!({
        "id": id,
        "created_at": wire_timestamp(),
        "total_messages": 0,
        "total_words": 0,
        "questions_count": 0,
    });
    let stats = json!({
        "session_id": id,
        "total_messages": 0,
        "total_words": 0,
        "questions_asked": 0,
        "avg_message_length": 0.0,
        "sentiment_breakdown": {"positive": 0, "negative": 0, "neutral": 0},
    });
    state.sessions.lock().unwrap().insert(
        id,
        SessionRecord {
            info: info.clone(),
            messages: Vec::new(),
            stats,
        },
    );
    (StatusCode::OK, Json(info)).into_response()
}

async fn get_session_handler(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
) -> Response {
    match state.sessions.lock().unwrap().get(&id) {
        Some(session) => Json(session.info.clone()).into_response(),
        None => not_found(),
    }
}

async fn delete_session_handler(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
) -> Response {
    match state.sessions.lock().unwrap().remove(&id) {
        Some(_) => Json(json!({"message": "Session deleted"})).into_response(),
        None => not_found(),
    }
}

async fn history_handler(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
) -> Response {
    match state.sessions.lock().unwrap().get(&id) {
        Some(session) => Json(json!({"messages": session.messages})).into_response(),
        None => not_found(),
    }
}

async fn stats_handler(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> Response {
    match state.sessions.lock().unwrap().get(&id) {
        Some(session) => Json(session.stats.clone()).into_response(),
        None => not_found(),
    }
}

async fn ws_handler(State(state): State<Arc<MockState>>, ws: WebSocketUpgrade) -> Response {
    if state.reject_websocket.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

async fn handle_socket(mut socket: WebSocket, state: Arc<MockState>) {
    let mut pushes = state.pushes.subscribe();
    state.active_connections.fetch_add(1, Ordering::SeqCst);
    state.connections_opened.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                state.received.lock().unwrap().push(text);
                let reply = state.scripted_replies.lock().unwrap().pop_front();
                if let Some(reply) = reply {
                    if socket.send(Message::text(reply)).await.is_err() {
                        break;
                    }
                }
            }
            push = pushes.recv() => match push {
                Ok(ServerPush::Frame(frame)) => {
                    if socket.send(Message::text(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(ServerPush::Disconnect) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    state.active_connections.fetch_sub(1, Ordering::SeqCst);
}
