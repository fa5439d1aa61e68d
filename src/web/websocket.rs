use axum::{
    extract::{ws::{Message, WebSocket, WebSocketUpgrade}, State},
    response::Response,
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};

use crate::backup::BackupManager;

pub fn routes() -> Router<BackupManager> {
    Router::new()
        .route("/", get(websocket_handler))
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(manager): State<BackupManager>,
) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, manager))
}

async fn handle_socket(socket: WebSocket, manager: BackupManager) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before the snapshot so nothing falls between them
    let mut event_rx = manager.subscribe_events();

    let msg = json!({
        "type": "status",
        "data": manager.get_status()
    });
    if let Err(e) = sender.send(Message::Text(msg.to_string())).await {
        error!("Failed to send initial status: {}", e);
        return;
    }

    let manager_for_events = manager.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let msg = match event_rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode event: {}", e);
                        continue;
                    }
                },
                Err(RecvError::Lagged(missed)) => {
                    // Slow client: resync with a fresh snapshot
                    warn!("WebSocket client lagged, {} events dropped", missed);
                    json!({
                        "type": "status",
                        "data": manager_for_events.get_status()
                    })
                    .to_string()
                }
                Err(RecvError::Closed) => break,
            };

            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    debug!("Received WebSocket message: {}", text);
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
