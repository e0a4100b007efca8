//! Config file load and save. The store hands out consistent snapshots to
//! the control loop and persists every mutation with a write-then-rename so
//! the file never holds a partial document.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::types::AgentConfig;

/// Default config location: `config.json` next to the executable.
pub fn default_config_path() -> Result<PathBuf> {
    let exe_dir = std::env::current_exe()?
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Cannot determine executable directory"))?
        .to_path_buf();
    Ok(exe_dir.join("config.json"))
}

/// Migrate a config document in place: drop removed keys, rename the old
/// critical-temperature field, backfill new fields. Returns whether the
/// file changed.
pub(crate) fn migrate_config(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }

    let content = std::fs::read_to_string(path)?;
    let mut json: serde_json::Value = serde_json::from_str(&content)?;
    let mut migrated = false;

    if let Some(hardware) = json.get_mut("hardware").and_then(|h| h.as_object_mut()) {
        if hardware.remove("enable_sensor_monitoring").is_some() {
            info!("Migrated: removed 'enable_sensor_monitoring'");
            migrated = true;
        }
        if let Some(temp) = hardware.remove("temperature_critical") {
            if !hardware.contains_key("emergency_temp") {
                hardware.insert("emergency_temp".to_string(), temp);
            }
            info!("Migrated: 'temperature_critical' renamed to 'emergency_temp'");
            migrated = true;
        }
        if !hardware.contains_key("failsafe_speed") {
            hardware.insert("failsafe_speed".to_string(), serde_json::json!(70));
            info!("Migrated: added 'failsafe_speed' with default 70");
            migrated = true;
        }
    }

    if migrated {
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&json)?)?;
        std::fs::rename(&tmp, path)?;
        info!("Config migrated to latest version: {:?}", path);
    }

    Ok(migrated)
}

pub async fn load_config(path: &Path) -> Result<AgentConfig> {
    if let Err(e) = migrate_config(path) {
        warn!("Config migration check failed: {}", e);
    }

    if path.exists() {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AgentConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {:?}", path))?;

        if config.backend.server_url.contains("[YOUR_HUB_IP]") || config.backend.server_url.is_empty() {
            warn!("⚠️ Hub URL is not configured in {:?}. Agent will fail to connect.", path);
            warn!("Please run the setup wizard ('--setup') or edit the config file manually.");
        }

        info!("Loaded configuration from: {:?}", path);
        Ok(config)
    } else {
        info!("Config file not found, synthesizing defaults: {:?}", path);
        let config = AgentConfig::default();
        save_config(&config, path).await?;
        Ok(config)
    }
}

/// Serialize and persist atomically: write to a sibling temp file, then
/// rename over the target.
pub async fn save_config(config: &AgentConfig, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &content)
        .await
        .with_context(|| format!("Failed to write config: {:?}", tmp))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace config: {:?}", path))?;
    info!("Configuration saved to: {:?}", path);
    Ok(())
}

/// Live configuration shared across agent tasks.
pub struct ConfigStore {
    path: PathBuf,
    config: RwLock<AgentConfig>,
}

impl ConfigStore {
    pub fn new(config: AgentConfig, path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            path,
            config: RwLock::new(config),
        })
    }

    pub async fn snapshot(&self) -> AgentConfig {
        self.config.read().await.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply a mutation and persist it. The lock is held only for the
    /// in-memory update; the disk write happens on a clone.
    pub async fn mutate<F>(&self, apply: F) -> Result<AgentConfig>
    where
        F: FnOnce(&mut AgentConfig),
    {
        let updated = {
            let mut config = self.config.write().await;
            apply(&mut config);
            config.clone()
        };
        save_config(&updated, &self.path).await?;
        Ok(updated)
    }

    /// Re-read the file, e.g. after a SIGHUP-triggered external edit.
    pub async fn reload(&self) -> Result<AgentConfig> {
        let fresh = load_config(&self.path).await?;
        *self.config.write().await = fresh.clone();
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AgentConfig::default();
        config.agent.name = "bench-node".into();
        config.hardware.hysteresis_temp = 2.5;

        save_config(&config, &path).await.unwrap();
        let loaded = load_config(&path).await.unwrap();
        assert_eq!(loaded.agent.name, "bench-node");
        assert_eq!(loaded.hardware.hysteresis_temp, 2.5);
        // Temp file is gone after the rename
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_synthesizes_defaults_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let config = load_config(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(config.hardware.fan_step_percent, 5);
    }

    #[tokio::test]
    async fn migration_renames_and_backfills() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let old = serde_json::json!({
            "agent": {"id": "x", "name": "x", "update_interval": 3.0, "log_level": "INFO"},
            "backend": {"server_url": "ws://hub:3143/websocket", "reconnect_interval": 5.0,
                        "max_reconnect_attempts": -1, "connection_timeout": 10.0},
            "hardware": {
                "enable_fan_control": true,
                "enable_sensor_monitoring": true,
                "temperature_critical": 88.0,
                "fan_safety_minimum": 30,
                "hysteresis_temp": 3.0,
                "fan_step_percent": 5,
                "filter_duplicate_sensors": false,
                "duplicate_sensor_tolerance": 1.0
            },
            "logging": {"enable_file_logging": true, "log_file": "/tmp/a.log",
                        "max_log_size_mb": 10, "log_retention_days": 7}
        });
        std::fs::write(&path, serde_json::to_string_pretty(&old).unwrap()).unwrap();

        let config = load_config(&path).await.unwrap();
        assert_eq!(config.hardware.emergency_temp, 88.0);
        assert_eq!(config.hardware.failsafe_speed, 70);

        // Migration is idempotent
        assert!(!migrate_config(&path).unwrap());
    }

    #[tokio::test]
    async fn store_mutation_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(AgentConfig::default(), path.clone());

        store
            .mutate(|c| c.hardware.emergency_temp = 90.0)
            .await
            .unwrap();

        let reloaded = load_config(&path).await.unwrap();
        assert_eq!(reloaded.hardware.emergency_temp, 90.0);
        assert_eq!(store.snapshot().await.hardware.emergency_temp, 90.0);
    }
}
