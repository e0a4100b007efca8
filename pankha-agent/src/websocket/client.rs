//! WebSocket client: connection lifecycle, reconnection backoff, liveness
//! watchdog, and inbound frame dispatch.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use pankha_protocol::frames::{AgentFrame, HubFrame};

use crate::config::persistence::ConfigStore;
use crate::control::state::EngineCommand;
use crate::hardware::HardwareMonitor;
use crate::websocket::writer::spawn_writer;
use crate::websocket::SessionHandle;

/// No inbound frame for this long means the connection is half-open;
/// tear it down and let the backoff loop reconnect.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);

/// More malformed frames than this within the window closes the session.
const MALFORMED_LIMIT: u32 = 5;
const MALFORMED_WINDOW: Duration = Duration::from_secs(10);

pub struct WebSocketClient {
    pub(crate) config: Arc<ConfigStore>,
    pub(crate) hardware: Arc<dyn HardwareMonitor>,
    pub(crate) session: Arc<SessionHandle>,
    pub(crate) engine: mpsc::Sender<EngineCommand>,
    /// Fans the engine gave up on after repeated write failures.
    pub(crate) disabled_fans: Arc<StdRwLock<HashSet<String>>>,
}

impl WebSocketClient {
    pub fn new(
        config: Arc<ConfigStore>,
        hardware: Arc<dyn HardwareMonitor>,
        session: Arc<SessionHandle>,
        engine: mpsc::Sender<EngineCommand>,
        disabled_fans: Arc<StdRwLock<HashSet<String>>>,
    ) -> Self {
        Self {
            config,
            hardware,
            session,
            engine,
            disabled_fans,
        }
    }

    /// Reconnect loop. The delay grows x1.0 / x1.4 / x2.0 / x3.0 (cap) on
    /// the configured base; the cap stays low because every second of
    /// backoff is a second the fleet spends at failsafe speed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut retry_count: u32 = 0;
        let mut attempts: i64 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.connect_and_communicate(&mut shutdown).await {
                Ok(_) => {
                    info!("WebSocket connection closed normally");
                    retry_count = 0;
                }
                Err(e) => error!("WebSocket error: {}", e),
            }
            self.session.detach().await;

            if *shutdown.borrow() {
                break;
            }

            let config = self.config.snapshot().await;
            attempts += 1;
            if config.backend.max_reconnect_attempts >= 0
                && attempts > config.backend.max_reconnect_attempts as i64
            {
                error!(
                    "Giving up after {} reconnect attempts",
                    config.backend.max_reconnect_attempts
                );
                break;
            }

            let wait_time = backoff_delay(config.backend.reconnect_interval, retry_count);
            retry_count = (retry_count + 1).min(3);

            info!("Reconnecting in {:.1}s... (attempt {})", wait_time, retry_count);
            tokio::select! {
                _ = time::sleep(Duration::from_secs_f64(wait_time)) => {}
                _ = shutdown.changed() => {}
            }
        }

        Ok(())
    }

    async fn connect_and_communicate(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let config = self.config.snapshot().await;
        info!("Connecting to WebSocket: {}", config.backend.server_url);

        let timeout_duration = Duration::from_secs_f64(config.backend.connection_timeout);
        let connect_future = connect_async(&config.backend.server_url);
        let (ws_stream, _) = tokio::time::timeout(timeout_duration, connect_future)
            .await
            .context("Connection timeout")??;
        info!("✅ WebSocket connected");

        // Hot-plugged hardware must show up in the registration snapshot
        self.hardware.invalidate_cache().await;

        let (write, mut read) = ws_stream.split();
        let (sender, writer_task) = spawn_writer(write);

        self.send_registration(&sender).await?;
        self.session.attach(sender).await;
        self.cleanup_after_update().await;

        let mut last_inbound = Instant::now();
        let mut malformed: Vec<Instant> = Vec::new();

        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested, closing WebSocket");
                break;
            }

            if last_inbound.elapsed() > LIVENESS_TIMEOUT {
                warn!(
                    "Connection liveness check failed: no frame for {}s, reconnecting",
                    last_inbound.elapsed().as_secs()
                );
                break;
            }

            // Bounded read so the shutdown flag and watchdog stay responsive
            let next = time::timeout(Duration::from_secs(1), read.next()).await;
            match next {
                Ok(Some(Ok(Message::Text(text)))) => {
                    last_inbound = Instant::now();
                    match self.handle_frame(&text).await {
                        Ok(keep_going) => {
                            if !keep_going {
                                info!("Hub requested orderly close");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Discarding malformed frame: {}", e);
                            let now = Instant::now();
                            malformed.retain(|t| now.duration_since(*t) < MALFORMED_WINDOW);
                            malformed.push(now);
                            if malformed.len() as u32 >= MALFORMED_LIMIT {
                                error!("Too many malformed frames, closing session");
                                break;
                            }
                        }
                    }
                }
                Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => {
                    last_inbound = Instant::now();
                    debug!("Received keepalive ping/pong");
                }
                Ok(Some(Ok(Message::Close(_)))) => {
                    info!("Server closed connection");
                    break;
                }
                Ok(Some(Ok(_))) => {
                    last_inbound = Instant::now();
                }
                Ok(Some(Err(e))) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                Ok(None) => {
                    info!("WebSocket stream ended");
                    break;
                }
                Err(_) => continue, // read timeout - loop back to checks
            }
        }

        self.session.detach().await;
        writer_task.abort();
        match writer_task.await {
            Ok(_) => debug!("Writer task completed"),
            Err(e) if e.is_cancelled() => debug!("Writer task cancelled"),
            Err(e) => error!("Writer task error: {}", e),
        }
        Ok(())
    }

    /// Returns `Ok(false)` when the hub asked for an orderly close.
    async fn handle_frame(&self, text: &str) -> Result<bool> {
        let frame: HubFrame = serde_json::from_str(text)?;
        match frame {
            HubFrame::Command { data } => {
                self.handle_command(data).await;
            }
            HubFrame::Ping { .. } => {
                self.session
                    .send_reliable(AgentFrame::Pong {
                        timestamp: pankha_protocol::now_millis(),
                    })
                    .await;
            }
            HubFrame::Registered { configuration, .. } => {
                info!("Agent successfully registered with backend");
                if let Some(configuration) = configuration {
                    self.apply_server_configuration(&configuration).await;
                }
            }
            HubFrame::Close => return Ok(false),
        }
        Ok(true)
    }

    /// Remove the `.old` binary and update marker once the hub has seen us
    /// back after a self-update.
    async fn cleanup_after_update(&self) {
        let Ok(current_exe) = std::env::current_exe() else {
            return;
        };
        let Some(exe_dir) = current_exe.parent() else {
            return;
        };
        let update_marker = exe_dir.join(".update_pending");
        let old_binary = current_exe.with_extension("old");

        if update_marker.exists() {
            info!("Update verified successful, cleaning up...");
            if let Err(e) = std::fs::remove_file(&update_marker) {
                warn!("Failed to remove update marker: {}", e);
            }
            if old_binary.exists() {
                if let Err(e) = std::fs::remove_file(&old_binary) {
                    warn!("Failed to remove old binary: {}", e);
                } else {
                    info!("Old binary removed, update complete");
                }
            }
        }
    }
}

/// Reconnect delay table. The cap keeps the failsafe window short: every
/// second of backoff is a second the fans spend pinned at failsafe speed.
fn backoff_delay(base: f64, retry_count: u32) -> f64 {
    match retry_count {
        0 => base,
        1 => base * 1.4,
        2 => base * 2.0,
        _ => base * 3.0, // cap
    }
}

#[cfg(test)]
mod tests {
    use super::backoff_delay;

    #[test]
    fn backoff_grows_then_caps() {
        assert_eq!(backoff_delay(5.0, 0), 5.0);
        assert_eq!(backoff_delay(5.0, 1), 7.0);
        assert_eq!(backoff_delay(5.0, 2), 10.0);
        assert_eq!(backoff_delay(5.0, 3), 15.0);
        // The 5th attempt waits exactly as long as the 4th
        assert_eq!(backoff_delay(5.0, 4), backoff_delay(5.0, 3));
    }
}
