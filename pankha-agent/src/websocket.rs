//! Realtime channel to the hub: connection lifecycle, single-writer frame
//! queue, command dispatch, and self-update.

pub mod client;
pub mod commands;
pub mod messaging;
pub mod self_update;
pub mod writer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::RwLock;

use pankha_protocol::frames::AgentFrame;

/// Shared view of the session, handed to the control engine so it can
/// switch between Online and Failsafe behavior and emit telemetry.
pub struct SessionHandle {
    connected: AtomicBool,
    outbound: RwLock<Option<mpsc::Sender<AgentFrame>>>,
}

impl SessionHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(false),
            outbound: RwLock::new(None),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) async fn attach(&self, sender: mpsc::Sender<AgentFrame>) {
        *self.outbound.write().await = Some(sender);
        self.connected.store(true, Ordering::Release);
    }

    pub(crate) async fn detach(&self) {
        self.connected.store(false, Ordering::Release);
        *self.outbound.write().await = None;
    }

    /// Queue a frame for the writer task. Dropped silently when offline or
    /// when the writer's queue is full (telemetry is periodic; the next
    /// frame supersedes a lost one).
    pub async fn send(&self, frame: AgentFrame) {
        let outbound = self.outbound.read().await;
        if let Some(sender) = outbound.as_ref() {
            let _ = sender.try_send(frame);
        }
    }

    /// Queue a frame, waiting for capacity. Used for command responses,
    /// which must not be dropped.
    pub async fn send_reliable(&self, frame: AgentFrame) {
        let sender = self.outbound.read().await.clone();
        if let Some(sender) = sender {
            let _ = sender.send(frame).await;
        }
    }
}
