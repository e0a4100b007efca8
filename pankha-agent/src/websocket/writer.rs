//! Single-writer actor for the socket. Producers queue frames; one task
//! owns the sink and emits them in order, so frames are never interleaved.

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error};

use pankha_protocol::frames::AgentFrame;

/// The socket's write half.
pub(crate) type WsSink = SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Frames queued beyond this are dropped by telemetry producers (command
/// responses use the blocking send path instead).
const WRITER_QUEUE_DEPTH: usize = 64;

pub(crate) fn spawn_writer(mut sink: WsSink) -> (mpsc::Sender<AgentFrame>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<AgentFrame>(WRITER_QUEUE_DEPTH);

    let handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize outbound frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                error!("WebSocket write failed: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
        debug!("Writer task finished");
    });

    (tx, handle)
}
