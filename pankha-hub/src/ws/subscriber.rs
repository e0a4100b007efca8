//! UI subscriber session: a full snapshot on connect, then ordered deltas
//! and lifecycle frames until the client leaves or falls too far behind.

use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info};

use pankha_protocol::frames::UiFrame;

use crate::state::AppState;

pub async fn subscriber_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_subscriber(socket, state))
}

async fn handle_subscriber(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();

    // Subscribe before the snapshot so no delta falls in the gap; a queued
    // delta that predates the snapshot only repeats values it already holds
    let (subscriber_id, mut frames) = state.registry.subscribe().await;
    let snapshot = state.registry.snapshot().await;
    let full_state = UiFrame::FullState { data: snapshot };
    let Ok(text) = serde_json::to_string(&full_state) else {
        state.registry.unsubscribe(subscriber_id).await;
        return;
    };
    if sink.send(Message::Text(text)).await.is_err() {
        state.registry.unsubscribe(subscriber_id).await;
        return;
    }
    info!("UI subscriber {} connected", subscriber_id);

    loop {
        tokio::select! {
            frame = frames.recv() => {
                match frame {
                    Some(frame) => {
                        let Ok(text) = serde_json::to_string(&frame) else { continue };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Dropped by the registry for falling behind;
                        // recoverable close tells the client to reconnect
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::AGAIN,
                                reason: "subscriber too slow, reconnect".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => debug!("Ignoring inbound subscriber message"),
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.registry.unsubscribe(subscriber_id).await;
    info!("UI subscriber {} disconnected", subscriber_id);
}
