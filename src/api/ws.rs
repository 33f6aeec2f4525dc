// =============================================================================
// WebSocket Handler — notification stream
// =============================================================================
//
// Clients connect to `/ws` and receive every dispatched notification as a
// JSON frame.  The handler answers Ping with Pong and drops the connection
// when the client goes away or the broadcast lags past its buffer.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::app_state::AppState;

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("notification WebSocket accepted — upgrading");
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Forward broadcast notifications to one client until either side hangs up.
async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let mut rx = state.notify_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(notification) => {
                        let Ok(json) = serde_json::to_string(&notification) else {
                            warn!("failed to serialise notification — skipping frame");
                            continue;
                        };
                        if let Err(e) = sender.send(Message::Text(json)).await {
                            debug!(error = %e, "WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification stream lagged — client missed frames");
                    }
                    Err(RecvError::Closed) => {
                        info!("notification broadcast closed — disconnecting client");
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("notification WebSocket closed by client");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Text/binary/pong from clients carry no meaning here.
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                }
            }
        }
    }
}
