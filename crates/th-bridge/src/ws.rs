//! Websocket transport for the connection hub.
//!
//! Each socket gets one hub connection. A reader task parses client frames
//! into [`ClientEvent`]s; a writer task serializes [`ServerEvent`]s and sends
//! a Ping every `ping_interval` so half-open TCP connections are noticed.
//! Any frame from the client, Pongs included, counts as liveness.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::hub::{ConnectionHandle, ConnectionHub};
use crate::http_api::AppState;
use crate::origin_validation::validate_websocket_origin;
use crate::protocol::{ClientEvent, ErrorKind, ServerEvent};

/// GET /ws
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Err(status) = validate_websocket_origin(&headers, &state.allowed_origins) {
        warn!(
            origin = headers.get("origin").and_then(|v| v.to_str().ok()).unwrap_or(""),
            "websocket upgrade rejected: origin not allowed"
        );
        return status.into_response();
    }

    let hub = state.hub.clone();
    let ping_interval = state.ping_interval;
    ws.on_upgrade(move |socket| serve_socket(socket, hub, ping_interval))
        .into_response()
}

/// Drive one upgraded socket until either side goes away.
pub async fn serve_socket(socket: WebSocket, hub: Arc<ConnectionHub>, ping_interval: Duration) {
    let ConnectionHandle {
        id,
        inbound,
        outbound,
        liveness,
    } = hub.connect();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Replies the transport produces itself (unparseable frames).
    let (local_tx, local_rx) = flume::bounded::<ServerEvent>(8);

    let writer = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + ping_interval;
        let mut heartbeat = tokio::time::interval_at(start, ping_interval);
        loop {
            let event = tokio::select! {
                event = outbound.recv_async() => match event {
                    Ok(event) => event,
                    Err(_) => break,
                },
                Ok(event) = local_rx.recv_async() => event,
                _ = heartbeat.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        debug!("heartbeat ping failed, connection lost");
                        return;
                    }
                    continue;
                }
            };
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode server event");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        // The connection actor is done; say goodbye.
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let reader_liveness = liveness.clone();
    let reader = tokio::spawn(async move {
        while let Some(frame) = ws_receiver.next().await {
            let Ok(frame) = frame else { break };
            reader_liveness.touch();
            match frame {
                Message::Text(text) => match serde_json::from_str::<ClientEvent>(text.as_str()) {
                    Ok(event) => {
                        if inbound.send_async(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "unparseable client frame");
                        let _ = local_tx
                            .send_async(ServerEvent::error(
                                ErrorKind::BadRequest,
                                format!("invalid message: {e}"),
                            ))
                            .await;
                    }
                },
                Message::Binary(_) => {
                    let _ = local_tx
                        .send_async(ServerEvent::error(
                            ErrorKind::BadRequest,
                            "binary frames are not supported",
                        ))
                        .await;
                }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    });

    let reader_abort = reader.abort_handle();
    let writer_abort = writer.abort_handle();
    tokio::select! {
        _ = reader => {},
        _ = writer => {},
    }
    reader_abort.abort();
    writer_abort.abort();
    info!(conn_id = %id, "websocket closed");
}
