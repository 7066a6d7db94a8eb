use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, error, warn};

use crate::api::AppState;
use crate::backup::BackupEvent;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(jobs_handler))
        .route("/jobs/:id", get(job_handler))
        .route("/overlay", get(overlay_handler))
}

async fn jobs_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let events = state.backups.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, events, None, |_: &BackupEvent| true))
}

async fn job_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    // Subscribe before taking the snapshot so no change slips in between.
    let events = state.backups.subscribe();
    let initial = match state.backups.get_job(&id) {
        Ok(job) => json!({ "type": "jobChanged", "data": job }),
        Err(e) => json!({ "type": "error", "message": e.to_string() }),
    };
    ws.on_upgrade(move |socket| {
        handle_socket(socket, events, Some(initial), move |event: &BackupEvent| {
            event.job_id() == id
        })
    })
}

async fn overlay_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let events = state.overlay.subscribe();
    let initial = json!({ "type": "stateRefreshed", "data": state.overlay.state() });
    ws.on_upgrade(move |socket| handle_socket(socket, events, Some(initial), |_| true))
}

/// Forwards broadcast events matching `wanted` to the socket as JSON text
/// frames until either side goes away.
async fn handle_socket<E, F>(
    socket: WebSocket,
    events: broadcast::Receiver<E>,
    initial: Option<serde_json::Value>,
    wanted: F,
) where
    E: Serialize + Clone + Send + 'static,
    F: Fn(&E) -> bool + Send + 'static,
{
    let (mut sender, mut receiver) = socket.split();

    if let Some(msg) = initial {
        if let Err(e) = sender.send(Message::Text(msg.to_string())).await {
            error!("Failed to send initial snapshot: {}", e);
            return;
        }
    }

    let mut send_task = tokio::spawn(async move {
        let mut events = BroadcastStream::new(events);
        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("WebSocket subscriber lagged, skipped {} events", skipped);
                    continue;
                }
            };
            if !wanted(&event) {
                continue;
            }

            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    debug!("Ignoring WebSocket message: {}", text);
                }
                Message::Close(_) => {
                    debug!("WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
        }
        _ = (&mut recv_task) => {
            send_task.abort();
        }
    }

    debug!("WebSocket connection closed");
}
