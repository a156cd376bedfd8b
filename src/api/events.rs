//! WebSocket fan-out of the event bus.
//!
//! Every socket gets one `initial_data` snapshot on connect, then live
//! messages from its topic. A consumer that falls behind the bounded bus
//! buffer is disconnected rather than allowed to stall publishers.

use crate::api::stations::AppState;
use crate::error::Result;
use crate::models::{Detection, Station};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// How many recent detections ride along in the snapshot.
const INITIAL_DETECTIONS: i64 = 50;

pub fn event_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/events/ws", get(global_events))
        .route("/stations/:id/events/ws", get(station_events))
}

async fn global_events(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    let rx = state.bus.subscribe();
    ws.on_upgrade(move |socket| serve_socket(state, socket, rx, None))
}

async fn station_events(
    State(state): State<Arc<AppState>>,
    Path(station_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    let rx = state.bus.subscribe_station(station_id);
    ws.on_upgrade(move |socket| serve_socket(state, socket, rx, Some(station_id)))
}

async fn serve_socket(
    state: Arc<AppState>,
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<crate::services::event_bus::WireMessage>,
    station_id: Option<Uuid>,
) {
    match initial_snapshot(&state, station_id).await {
        Ok(snapshot) => {
            if socket.send(Message::Text(snapshot)).await.is_err() {
                return;
            }
        }
        Err(e) => {
            warn!("Failed to build initial snapshot: {e}");
            return;
        }
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(message) => {
                        let Ok(text) = serde_json::to_string(&message) else {
                            continue;
                        };
                        if socket.send(Message::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Dropping slow event subscriber");
                        let _ = socket.send(Message::Close(None)).await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = socket.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    // Pings are answered by axum; other client frames are
                    // ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// `initial_data` message: station list plus recent detections.
async fn initial_snapshot(state: &Arc<AppState>, station_id: Option<Uuid>) -> Result<String> {
    let stations: Vec<Station> = match station_id {
        Some(id) => {
            sqlx::query_as("SELECT * FROM stations WHERE id = $1")
                .bind(id)
                .fetch_all(&state.pool)
                .await?
        }
        None => {
            sqlx::query_as("SELECT * FROM stations ORDER BY name")
                .fetch_all(&state.pool)
                .await?
        }
    };

    let detections: Vec<Detection> = match station_id {
        Some(id) => {
            sqlx::query_as(
                "SELECT * FROM detections WHERE station_id = $1
                 ORDER BY started_at DESC LIMIT $2",
            )
            .bind(id)
            .bind(INITIAL_DETECTIONS)
            .fetch_all(&state.pool)
            .await?
        }
        None => {
            sqlx::query_as("SELECT * FROM detections ORDER BY started_at DESC LIMIT $1")
                .bind(INITIAL_DETECTIONS)
                .fetch_all(&state.pool)
                .await?
        }
    };

    let message = json!({
        "type": "initial_data",
        "timestamp": Utc::now(),
        "data": {
            "stations": stations,
            "detections": detections,
        }
    });
    Ok(message.to_string())
}
