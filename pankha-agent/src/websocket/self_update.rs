//! Agent self-update: download from the hub, verify the commanded hash,
//! atomic swap, restart. The running binary is never replaced on partial
//! failure.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use pankha_protocol::frames::CommandResponse;

#[cfg(target_os = "linux")]
use crate::daemon::systemd::is_systemd_service_active;

impl super::client::WebSocketClient {
    /// Lightweight clone for the background update task.
    fn clone_for_update(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            hardware: Arc::clone(&self.hardware),
            session: Arc::clone(&self.session),
            engine: self.engine.clone(),
            disabled_fans: Arc::clone(&self.disabled_fans),
        }
    }

    pub(crate) fn spawn_self_update(
        &self,
        command_id: String,
        channel: Option<String>,
        version: Option<String>,
        expected_hash: String,
    ) {
        let client = self.clone_for_update();
        tokio::spawn(async move {
            match client.download_and_verify(channel, version.clone(), &expected_hash).await {
                Ok(staged) => {
                    client
                        .respond(CommandResponse::ok(
                            &command_id,
                            serde_json::json!({
                                "message": "Update verified, applying",
                                "version": version,
                            }),
                        ))
                        .await;
                    // Give the response a moment on the wire before re-exec
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    if let Err(e) = client.apply_update(&staged, version.as_deref()).await {
                        error!("Self-update failed during swap: {}", e);
                    }
                }
                Err(e) => {
                    error!("Self-update rejected: {}", e);
                    client
                        .respond(CommandResponse::err(&command_id, e.to_string()))
                        .await;
                }
            }
        });
    }

    /// Download the staged binary from the hub (LAN pull, never the public
    /// release source) and check its digest against the commanded hash.
    async fn download_and_verify(
        &self,
        channel: Option<String>,
        version: Option<String>,
        expected_hash: &str,
    ) -> Result<PathBuf> {
        let current_version = env!("CARGO_PKG_VERSION");
        match &version {
            Some(target) => {
                let target_clean = target.trim_start_matches('v');
                if target_clean == current_version {
                    info!(
                        "Target version matches current (v{}), proceeding with reinstall",
                        current_version
                    );
                } else {
                    info!("🚀 Updating from v{} to {}", current_version, target);
                }
            }
            None => info!("🚀 Starting self-update (no version specified)"),
        }

        let config = self.config.snapshot().await;
        let base_url = config
            .backend
            .server_url
            .replace("wss://", "https://")
            .replace("ws://", "http://")
            .replace("/websocket", "");
        let channel = channel.unwrap_or_else(|| "stable".to_string());
        let download_url = format!(
            "{}/api/deploy/binary?channel={}&arch={}",
            base_url,
            channel,
            std::env::consts::ARCH
        );

        let current_exe = std::env::current_exe()?;
        let new_exe = current_exe.with_extension("new");

        info!("Downloading {} binary from {}", channel, download_url);
        let response = reqwest::get(&download_url)
            .await
            .context("Download request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("Download failed with status: {}", response.status());
        }
        let bytes = response.bytes().await.context("Download body failed")?;

        let digest = hex::encode(Sha256::digest(&bytes));
        if !digest.eq_ignore_ascii_case(expected_hash) {
            anyhow::bail!("hash mismatch");
        }
        debug!("Binary hash verified: {}", digest);

        tokio::fs::write(&new_exe, &bytes)
            .await
            .context("Failed to stage new binary")?;

        #[cfg(target_os = "linux")]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&new_exe, std::fs::Permissions::from_mode(0o755))?;
        }

        // Sanity check: the staged binary must at least execute
        let version_check = std::process::Command::new(&new_exe).arg("--version").output();
        match version_check {
            Ok(output) if output.status.success() => {
                debug!(
                    "Binary execution check passed: {}",
                    String::from_utf8_lossy(&output.stdout).trim()
                );
            }
            Ok(output) => {
                let _ = std::fs::remove_file(&new_exe);
                anyhow::bail!(
                    "Downloaded binary failed to execute: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
            }
            Err(e) => {
                let _ = std::fs::remove_file(&new_exe);
                anyhow::bail!("Downloaded binary failed execution test: {}", e);
            }
        }

        Ok(new_exe)
    }

    /// Swap binaries with a `.old` backup and restart. Rolls back if the
    /// new binary cannot be moved into place.
    async fn apply_update(&self, new_exe: &PathBuf, target_version: Option<&str>) -> Result<()> {
        let current_exe = std::env::current_exe()?;
        let exe_dir = current_exe
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine executable directory"))?
            .to_path_buf();
        let old_exe = current_exe.with_extension("old");
        let update_marker = exe_dir.join(".update_pending");

        if old_exe.exists() {
            let _ = std::fs::remove_file(&old_exe);
        }

        info!("Applying update: Swapping binaries...");
        std::fs::rename(&current_exe, &old_exe).context("Failed to backup current binary")?;

        if let Err(e) = std::fs::rename(new_exe, &current_exe) {
            error!("❌ Failed to swap binaries: {}. Attempting rollback...", e);
            let _ = std::fs::rename(&old_exe, &current_exe);
            return Err(e.into());
        }

        // Marker lets the next successful registration clean up .old
        if let Err(e) = std::fs::write(
            &update_marker,
            format!(
                "from={}\nto={}",
                env!("CARGO_PKG_VERSION"),
                target_version.unwrap_or("unknown")
            ),
        ) {
            warn!("Failed to write update marker: {} (continuing anyway)", e);
        }

        info!("✅ Update applied successfully. Restarting service...");

        #[cfg(target_os = "linux")]
        {
            if is_systemd_service_active() {
                info!("Triggering systemd restart for pankha-agent...");
                let _ = std::process::Command::new("systemctl")
                    .args(["restart", "pankha-agent"])
                    .spawn();
            } else {
                // Re-exec keeps the same PID, avoiding a pid-file race
                use std::os::unix::process::CommandExt;

                info!(
                    "Manual restart: Re-executing binary to apply update (PID {})",
                    std::process::id()
                );

                let mut cmd = std::process::Command::new(&current_exe);
                cmd.arg("--daemon-child");
                let config = self.config.snapshot().await;
                cmd.arg("--log-level").arg(&config.agent.log_level);

                let err = cmd.exec();
                error!("❌ Manual re-exec failed: {}. Falling back to spawn/exit...", err);
                let _ = std::process::Command::new(&current_exe)
                    .arg("--daemon-child")
                    .spawn();
                std::process::exit(0);
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            std::process::exit(0);
        }

        #[allow(unreachable_code)]
        Ok(())
    }
}
