//! Outbound registration and hub-pushed configuration.

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{error, info};

use pankha_protocol::frames::{AgentFrame, Capabilities, RegisterData};

use crate::app::logging;
use crate::config::validate;
use crate::hardware::dedup::apply_duplicate_filter;

impl super::client::WebSocketClient {
    /// Discovery runs fresh on every (re)connect so hot-plugged hardware is
    /// part of the registration snapshot.
    pub(crate) async fn send_registration(
        &self,
        sender: &mpsc::Sender<AgentFrame>,
    ) -> Result<()> {
        let mut sensors = self.hardware.discover_sensors().await?;
        let fans = self.hardware.discover_fans().await?;

        let config = self.config.snapshot().await;
        if config.hardware.filter_duplicate_sensors {
            apply_duplicate_filter(&mut sensors, config.hardware.duplicate_sensor_tolerance);
        }

        let frame = AgentFrame::Register {
            data: RegisterData {
                agent_id: config.agent.id.clone(),
                name: config.agent.name.clone(),
                agent_version: env!("CARGO_PKG_VERSION").to_string(),
                platform: std::env::consts::OS.to_string(),
                update_interval: config.agent.update_interval,
                fan_step_percent: config.hardware.fan_step_percent,
                hysteresis_temp: config.hardware.hysteresis_temp,
                emergency_temp: config.hardware.emergency_temp,
                failsafe_speed: config.hardware.failsafe_speed,
                log_level: config.agent.log_level.clone(),
                capabilities: Capabilities {
                    sensors,
                    fans,
                    fan_control: config.hardware.enable_fan_control,
                },
            },
        };

        sender.send(frame).await?;
        info!("✅ Agent registered: {}", config.agent.id);
        Ok(())
    }

    /// The hub's `registered` reply may carry its authoritative copy of this
    /// agent's settings; apply each field with the same validation a command
    /// would get.
    pub(crate) async fn apply_server_configuration(&self, configuration: &serde_json::Value) {
        info!("Applying configuration from server");

        if let Some(interval) = configuration.get("update_interval").and_then(|v| v.as_f64()) {
            if validate::update_interval(interval).is_ok() {
                let result = self
                    .config
                    .mutate(|c| c.agent.update_interval = interval)
                    .await;
                match result {
                    Ok(_) => info!("Applied update_interval: {}s", interval),
                    Err(e) => error!("Failed to apply update_interval: {}", e),
                }
            }
        }

        if let Some(step) = configuration.get("fan_step_percent").and_then(|v| v.as_u64()) {
            let step = step as u8;
            if validate::fan_step(step).is_ok() {
                if let Err(e) = self.config.mutate(|c| c.hardware.fan_step_percent = step).await {
                    error!("Failed to apply fan_step_percent: {}", e);
                } else {
                    info!("Applied fan_step_percent: {}%", step);
                }
            }
        }

        if let Some(hysteresis) = configuration.get("hysteresis_temp").and_then(|v| v.as_f64()) {
            if validate::hysteresis(hysteresis).is_ok() {
                if let Err(e) = self
                    .config
                    .mutate(|c| c.hardware.hysteresis_temp = hysteresis)
                    .await
                {
                    error!("Failed to apply hysteresis_temp: {}", e);
                } else {
                    info!("Applied hysteresis_temp: {}°C", hysteresis);
                }
            }
        }

        if let Some(temp) = configuration.get("emergency_temp").and_then(|v| v.as_f64()) {
            if validate::emergency_temp(temp).is_ok() {
                if let Err(e) = self.config.mutate(|c| c.hardware.emergency_temp = temp).await {
                    error!("Failed to apply emergency_temp: {}", e);
                } else {
                    info!("Applied emergency_temp: {}°C", temp);
                }
            }
        }

        if let Some(speed) = configuration.get("failsafe_speed").and_then(|v| v.as_u64()) {
            if speed <= 100 {
                let speed = speed as u8;
                if let Err(e) = self.config.mutate(|c| c.hardware.failsafe_speed = speed).await {
                    error!("Failed to apply failsafe_speed: {}", e);
                } else {
                    info!("Applied failsafe_speed: {}%", speed);
                }
            }
        }

        if let Some(level) = configuration.get("log_level").and_then(|v| v.as_str()) {
            if validate::log_level(level).is_ok() {
                logging::set_level(level);
                let level = level.to_uppercase();
                if let Err(e) = self
                    .config
                    .mutate(|c| c.agent.log_level = level.clone())
                    .await
                {
                    error!("Failed to apply log_level: {}", e);
                } else {
                    info!("Applied log_level: {}", level);
                }
            }
        }
    }
}
