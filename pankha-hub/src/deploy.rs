//! Deployment service: stages agent binaries from the public release source
//! into a local content-addressed cache, serves them on the LAN, and issues
//! short-lived install tokens.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// Install tokens expire after 24 hours.
pub const TOKEN_TTL_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize)]
pub struct StagedBinary {
    pub channel: String,
    pub version: String,
    pub hash: String,
    pub platform: String,
    pub arch: String,
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DeployToken {
    pub token: String,
    pub config: Value,
    pub issued_at: i64,
    pub expires_at: i64,
}

pub struct DeployService {
    cache_dir: PathBuf,
    release_base_url: String,
    /// One current staged binary per channel; staging replaces.
    staged: RwLock<HashMap<String, StagedBinary>>,
    tokens: RwLock<HashMap<String, DeployToken>>,
}

impl DeployService {
    pub fn new(cache_dir: PathBuf, release_base_url: String) -> Self {
        Self {
            cache_dir,
            release_base_url,
            staged: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Pull a release artifact from the public source and stage it locally.
    pub async fn stage(
        &self,
        channel: &str,
        version: &str,
        platform: &str,
        arch: &str,
    ) -> Result<StagedBinary> {
        let url = format!(
            "{}/{}/pankha-agent-{}-{}",
            self.release_base_url, version, platform, arch
        );
        info!("Staging {} {} from {}", channel, version, url);

        let response = reqwest::get(&url).await.context("Release download failed")?;
        if !response.status().is_success() {
            anyhow::bail!("Release source returned {}", response.status());
        }
        let bytes = response.bytes().await.context("Release body failed")?;
        self.stage_bytes(channel, version, platform, arch, &bytes).await
    }

    /// Store binary content under its hash and record the channel's current
    /// staged version.
    pub async fn stage_bytes(
        &self,
        channel: &str,
        version: &str,
        platform: &str,
        arch: &str,
        bytes: &[u8],
    ) -> Result<StagedBinary> {
        let hash = hex::encode(Sha256::digest(bytes));
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let path = self.cache_dir.join(&hash);
        tokio::fs::write(&path, bytes)
            .await
            .context("Failed to write staged binary")?;

        let staged = StagedBinary {
            channel: channel.to_string(),
            version: version.to_string(),
            hash,
            platform: platform.to_string(),
            arch: arch.to_string(),
            path,
        };

        let previous = self
            .staged
            .write()
            .await
            .insert(channel.to_string(), staged.clone());
        if let Some(previous) = previous {
            info!(
                "Replaced staged {} binary {} -> {}",
                channel, previous.version, staged.version
            );
        } else {
            info!("Staged {} binary {} ({})", channel, staged.version, staged.hash);
        }
        Ok(staged)
    }

    pub async fn staged_for(&self, channel: &str) -> Option<StagedBinary> {
        self.staged.read().await.get(channel).cloned()
    }

    pub async fn read_binary(&self, channel: &str) -> Result<(StagedBinary, Vec<u8>)> {
        let staged = self
            .staged_for(channel)
            .await
            .ok_or_else(|| anyhow::anyhow!("No binary staged for channel {}", channel))?;
        let bytes = tokio::fs::read(&staged.path)
            .await
            .context("Staged binary missing from cache")?;
        Ok((staged, bytes))
    }

    /// Issue a bootstrap token. The embedded config points the installer at
    /// the hub's LAN address, or the public one for external installs.
    pub async fn issue_token(&self, hub_ws_url: &str) -> DeployToken {
        let issued_at = pankha_protocol::now_millis();
        let token = DeployToken {
            token: Uuid::new_v4().to_string(),
            config: json!({
                "backend": {
                    "server_url": hub_ws_url,
                    "reconnect_interval": 5.0,
                    "max_reconnect_attempts": -1,
                    "connection_timeout": 10.0,
                },
            }),
            issued_at,
            expires_at: issued_at + TOKEN_TTL_MS,
        };
        self.tokens
            .write()
            .await
            .insert(token.token.clone(), token.clone());
        token
    }

    /// A valid token is all the authentication binary-serving needs.
    pub async fn validate_token(&self, token: &str) -> Option<DeployToken> {
        let mut tokens = self.tokens.write().await;
        tokens.retain(|_, t| t.expires_at > pankha_protocol::now_millis());
        tokens.get(token).cloned()
    }

    /// The install script served by `/api/deploy/linux`.
    pub fn install_script(&self, token: &DeployToken, hub_http_url: &str) -> String {
        format!(
            r#"#!/bin/sh
set -e
echo "Installing Pankha agent..."
INSTALL_DIR=/opt/pankha-agent
mkdir -p "$INSTALL_DIR"
ARCH=$(uname -m)
curl -fsSL "{hub}/api/deploy/binary?channel=stable&arch=$ARCH" -o "$INSTALL_DIR/pankha-agent"
chmod 755 "$INSTALL_DIR/pankha-agent"
cat > "$INSTALL_DIR/config.json" <<'CONFIG'
{config}
CONFIG
"$INSTALL_DIR/pankha-agent" --install-service
systemctl start pankha-agent
echo "Pankha agent installed."
"#,
            hub = hub_http_url,
            config = serde_json::to_string_pretty(&token.config).unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn staging_is_content_addressed_and_replaces() {
        let dir = TempDir::new().unwrap();
        let service = DeployService::new(dir.path().to_path_buf(), "http://releases".into());

        let first = service
            .stage_bytes("stable", "2.0.0", "linux", "x86_64", b"binary-v1")
            .await
            .unwrap();
        assert_eq!(first.hash, hex::encode(Sha256::digest(b"binary-v1")));
        assert!(first.path.exists());

        let second = service
            .stage_bytes("stable", "2.1.0", "linux", "x86_64", b"binary-v2")
            .await
            .unwrap();
        let current = service.staged_for("stable").await.unwrap();
        assert_eq!(current.version, "2.1.0");
        assert_eq!(current.hash, second.hash);
    }

    #[tokio::test]
    async fn channels_stage_independently() {
        let dir = TempDir::new().unwrap();
        let service = DeployService::new(dir.path().to_path_buf(), "http://releases".into());
        service
            .stage_bytes("stable", "2.0.0", "linux", "x86_64", b"stable-bin")
            .await
            .unwrap();
        service
            .stage_bytes("unstable", "2.1.0-rc1", "linux", "x86_64", b"unstable-bin")
            .await
            .unwrap();

        assert_eq!(service.staged_for("stable").await.unwrap().version, "2.0.0");
        assert_eq!(
            service.staged_for("unstable").await.unwrap().version,
            "2.1.0-rc1"
        );
    }

    #[tokio::test]
    async fn read_binary_round_trips_bytes() {
        let dir = TempDir::new().unwrap();
        let service = DeployService::new(dir.path().to_path_buf(), "http://releases".into());
        service
            .stage_bytes("stable", "2.0.0", "linux", "x86_64", b"payload")
            .await
            .unwrap();
        let (staged, bytes) = service.read_binary("stable").await.unwrap();
        assert_eq!(bytes, b"payload");
        assert_eq!(staged.hash, hex::encode(Sha256::digest(b"payload")));
    }

    #[tokio::test]
    async fn tokens_validate_until_expiry() {
        let dir = TempDir::new().unwrap();
        let service = DeployService::new(dir.path().to_path_buf(), "http://releases".into());

        let token = service.issue_token("ws://hub:3143/websocket").await;
        assert!(service.validate_token(&token.token).await.is_some());
        assert!(service.validate_token("nonsense").await.is_none());
        assert_eq!(token.expires_at - token.issued_at, TOKEN_TTL_MS);

        // Force-expire and confirm the sweep drops it
        service
            .tokens
            .write()
            .await
            .get_mut(&token.token)
            .unwrap()
            .expires_at = 0;
        assert!(service.validate_token(&token.token).await.is_none());
    }

    #[tokio::test]
    async fn install_script_embeds_token_config() {
        let dir = TempDir::new().unwrap();
        let service = DeployService::new(dir.path().to_path_buf(), "http://releases".into());
        let token = service.issue_token("ws://192.168.1.10:3143/websocket").await;
        let script = service.install_script(&token, "http://192.168.1.10:3143");
        assert!(script.contains("ws://192.168.1.10:3143/websocket"));
        assert!(script.contains("/api/deploy/binary?channel=stable"));
    }
}
