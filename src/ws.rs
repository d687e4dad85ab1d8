//! WebSocket Fabric (§4.K).
//!
//! Generalizes the teacher's `factory/ws.rs`: the same ping/pong keepalive
//! loop (`run_socket_loop`) and `broadcast_message` serialize-and-send
//! helper, applied to one broadcast channel *per project* instead of one
//! global channel, with a client-declared `{subscribe:{projectId}}`
//! handshake selecting which channel a connection forwards, a hard
//! per-frame size cap, and a short coalescing window for bursty
//! `execution-log` frames.

use crate::app::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{stream::SplitSink, stream::SplitStream, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::warn;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Client-to-server handshake (§6.2): `{"subscribe":{"projectId":"acme/app"}}`.
#[derive(Debug, Deserialize)]
struct SubscribeMessage {
    subscribe: SubscribePayload,
}

#[derive(Debug, Deserialize)]
struct SubscribePayload {
    #[serde(rename = "projectId")]
    project_id: String,
}

/// §4.K envelope: `{ type, ts, projectId, payload }`.
#[derive(Debug, Clone, Serialize)]
struct Envelope {
    #[serde(rename = "type")]
    frame_type: &'static str,
    ts: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "projectId")]
    project_id: String,
    payload: serde_json::Value,
}

/// Per-project log-coalescing state (§4.K: "bursty logs are coalesced with a
/// 50 ms window, preserving order within a project").
#[derive(Default)]
pub struct LogCoalescer {
    pending: StdMutex<HashMap<String, Vec<Envelope>>>,
    scheduled: StdMutex<HashSet<String>>,
}

impl LogCoalescer {
    pub fn new() -> Self {
        Self::default()
    }
}

fn frame_too_large(app: &AppState, json: &str) -> bool {
    json.len() > app.config.ws_max_frame_bytes
}

fn send_raw(app: &AppState, project_id: &str, json: String) {
    let tx = app.ws_sender(project_id);
    let _ = tx.send(json);
}

/// Drops an oversize frame, emitting a single `error` frame describing the
/// drop in its place (§4.K, §8: "a 65,537-byte payload is dropped; a single
/// error frame is emitted").
fn send_or_drop(app: &AppState, project_id: &str, envelope: Envelope) {
    match serde_json::to_string(&envelope) {
        Ok(json) if frame_too_large(app, &json) => {
            warn!(project_id, bytes = json.len(), "dropping oversize websocket frame");
            let drop_notice = Envelope {
                frame_type: "error",
                ts: chrono::Utc::now(),
                project_id: project_id.to_string(),
                payload: serde_json::json!({
                    "code": "frame_too_large",
                    "message": format!("a {} frame exceeding {} bytes was dropped", envelope.frame_type, app.config.ws_max_frame_bytes),
                }),
            };
            if let Ok(notice_json) = serde_json::to_string(&drop_notice) {
                send_raw(app, project_id, notice_json);
            }
        }
        Ok(json) => send_raw(app, project_id, json),
        Err(err) => warn!(project_id, %err, "failed to serialize websocket frame"),
    }
}

/// Broadcasts an `execution-update` frame (§6.2: `{state, progress,
/// currentTask?}`).
pub fn broadcast_execution_update(app: &AppState, project_id: &str, projection: &devteam_common::StatusProjection) {
    let envelope = Envelope {
        frame_type: "execution-update",
        ts: chrono::Utc::now(),
        project_id: project_id.to_string(),
        payload: serde_json::json!({
            "state": projection.status,
            "progress": projection.progress,
            "currentTask": projection.current_task,
        }),
    };
    send_or_drop(app, project_id, envelope);
}

/// Broadcasts an `error` frame (§6.2: `{code, message}`).
pub fn broadcast_error(app: &AppState, project_id: &str, code: &str, message: &str) {
    let envelope = Envelope {
        frame_type: "error",
        ts: chrono::Utc::now(),
        project_id: project_id.to_string(),
        payload: serde_json::json!({"code": code, "message": message}),
    };
    send_or_drop(app, project_id, envelope);
}

/// Broadcasts a `completion` frame (§6.2: `{result}`).
pub fn broadcast_completion(app: &AppState, project_id: &str, result: &str) {
    let envelope = Envelope {
        frame_type: "completion",
        ts: chrono::Utc::now(),
        project_id: project_id.to_string(),
        payload: serde_json::json!({"result": result}),
    };
    send_or_drop(app, project_id, envelope);
}

/// Queues an `execution-log` frame (§6.2: `{level, message, nodeName?}`) for
/// coalesced delivery: the first line in a quiet period schedules a flush
/// `WS_COALESCE_MS` later; everything queued before that flush goes out
/// together, in the order it was queued.
pub fn queue_log(app: Arc<AppState>, coalescer: Arc<LogCoalescer>, project_id: &str, level: &str, message: &str, node_name: Option<&str>) {
    let mut payload = serde_json::json!({"level": level, "message": message});
    if let Some(node_name) = node_name {
        payload["nodeName"] = serde_json::json!(node_name);
    }
    let envelope = Envelope {
        frame_type: "execution-log",
        ts: chrono::Utc::now(),
        project_id: project_id.to_string(),
        payload,
    };

    let should_schedule = {
        let mut pending = coalescer.pending.lock().expect("log coalescer pending map poisoned");
        pending.entry(project_id.to_string()).or_default().push(envelope);
        let mut scheduled = coalescer.scheduled.lock().expect("log coalescer scheduled set poisoned");
        scheduled.insert(project_id.to_string())
    };

    if should_schedule {
        let project_id = project_id.to_string();
        let coalesce_ms = app.config.ws_coalesce_ms;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(coalesce_ms)).await;
            let batch = {
                let mut pending = coalescer.pending.lock().expect("log coalescer pending map poisoned");
                let batch = pending.remove(&project_id).unwrap_or_default();
                coalescer.scheduled.lock().expect("log coalescer scheduled set poisoned").remove(&project_id);
                batch
            };
            for envelope in batch {
                send_or_drop(&app, &project_id, envelope);
            }
        });
    }
}

/// `GET /ws/devteam` upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(app): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

async fn handle_socket(socket: WebSocket, app: Arc<AppState>) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, app).await;
}

/// Waits for the client's `{subscribe:{projectId}}` handshake, then forwards
/// that project's broadcast channel with ping/pong keepalive (mirrors the
/// teacher's `run_socket_loop`).
async fn run_socket_loop(mut sender: SplitSink<WebSocket, Message>, mut receiver: SplitStream<WebSocket>, app: Arc<AppState>) {
    let project_id = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<SubscribeMessage>(&text) {
                Ok(sub) => break sub.subscribe.project_id,
                Err(_) => continue,
            },
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return,
        }
    };

    let mut rx = app.ws_sender(&project_id).subscribe();
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
