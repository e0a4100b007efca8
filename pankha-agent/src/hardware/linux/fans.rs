//! hwmon fan discovery and PWM writes.

use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, error};

use super::monitor::{FanChannel, LinuxHardwareMonitor};
use crate::hardware::HardwareError;

impl LinuxHardwareMonitor {
    /// Walk every hwmon chip and refresh the fan channel cache. Existing
    /// entries keep their write-side state (last PWM value, rate-limit
    /// clock) so rediscovery never forgets what was last written.
    pub(crate) async fn walk_fans(&self) -> Result<(), HardwareError> {
        if !self.hwmon_base.exists() {
            return Ok(());
        }

        let mut fan_map = self.fan_channels.write().await;
        let mut entries = tokio::fs::read_dir(&self.hwmon_base).await?;

        while let Some(entry) = entries.next_entry().await? {
            let hwmon_dir = entry.path();
            if !hwmon_dir.is_dir() {
                continue;
            }

            let chip_name = match self.read_file(&hwmon_dir.join("name")).await {
                Ok(name) => name,
                Err(_) => continue,
            };

            let pattern = hwmon_dir.join("fan*_input");
            let pattern_str = pattern.to_string_lossy();

            for fan_file in glob::glob(&pattern_str).unwrap().filter_map(Result::ok) {
                let filename = fan_file.file_name().unwrap().to_string_lossy();
                let fan_num = filename
                    .strip_prefix("fan")
                    .and_then(|s| s.strip_suffix("_input"))
                    .unwrap();

                let pwm_path = hwmon_dir.join(format!("pwm{}", fan_num));
                let pwm_enable_path = hwmon_dir.join(format!("pwm{}_enable", fan_num));

                if !pwm_path.exists() {
                    continue;
                }

                let fan_id = format!(
                    "{}_fan_{}",
                    chip_name.to_lowercase().replace(' ', "_"),
                    fan_num
                );

                match fan_map.get_mut(&fan_id) {
                    Some(existing) => {
                        // Paths can move between boots; cached PWM state stays
                        existing.pwm_path = pwm_path.clone();
                        existing.rpm_path = fan_file.clone();
                        existing.pwm_enable_path =
                            pwm_enable_path.exists().then_some(pwm_enable_path);
                        existing.chip_name = chip_name.clone();
                    }
                    None => {
                        fan_map.insert(
                            fan_id.clone(),
                            FanChannel {
                                pwm_path: pwm_path.clone(),
                                rpm_path: fan_file.clone(),
                                pwm_enable_path: pwm_enable_path
                                    .exists()
                                    .then_some(pwm_enable_path),
                                chip_name: chip_name.clone(),
                                display_name: format!("{} Fan {}", chip_name, fan_num),
                                last_pwm_value: RwLock::new(None),
                                last_write_time: RwLock::new(Instant::now()),
                            },
                        );
                    }
                }
            }
        }

        Ok(())
    }

    pub(crate) async fn write_fan_duty(&self, fan_id: &str, duty: u8) -> Result<(), HardwareError> {
        if duty > 100 {
            return Err(HardwareError::OutOfRange(duty));
        }
        let pwm_value = (duty as f32 / 100.0 * 255.0).round() as u8;

        let fan_map = self.fan_channels.read().await;
        let channel = fan_map
            .get(fan_id)
            .ok_or_else(|| HardwareError::NotFound(fan_id.to_string()))?;

        // Idempotent: skip when the value matches the last successful write
        {
            let last_value = channel.last_pwm_value.read().await;
            if *last_value == Some(pwm_value) {
                debug!("Fan {} already at PWM {}, skipping write", fan_id, pwm_value);
                return Ok(());
            }
        }

        // At most one write per 100 ms per fan
        {
            let mut last_time = channel.last_write_time.write().await;
            let elapsed = last_time.elapsed();
            if elapsed < Duration::from_millis(100) {
                debug!("Fan {} rate limited, last write {:?} ago", fan_id, elapsed);
                return Ok(());
            }
            *last_time = Instant::now();
        }

        // Manual PWM mode must be on before the value write sticks
        if let Some(enable_path) = &channel.pwm_enable_path {
            let current_enable = self.read_file(enable_path).await.ok();
            if current_enable.as_deref() != Some("1") {
                debug!("Enabling manual PWM mode for fan {}", fan_id);
                self.write_file(enable_path, "1").await?;
            }
        }

        match self.write_file(&channel.pwm_path, &pwm_value.to_string()).await {
            Ok(_) => {
                *channel.last_pwm_value.write().await = Some(pwm_value);
                debug!("Set fan {} to {}% (PWM: {})", fan_id, duty, pwm_value);
                Ok(())
            }
            Err(e) => {
                error!("Failed to write PWM for fan {}: {}", fan_id, e);
                // Clear the cached value so the next attempt retries
                *channel.last_pwm_value.write().await = None;
                Err(e)
            }
        }
    }

    /// Hand the fan back to automatic firmware control (pwm_enable = 2).
    pub(crate) async fn release_to_auto(&self, fan_id: &str) -> Result<(), HardwareError> {
        let fan_map = self.fan_channels.read().await;
        let channel = fan_map
            .get(fan_id)
            .ok_or_else(|| HardwareError::NotFound(fan_id.to_string()))?;

        let enable_path = channel
            .pwm_enable_path
            .as_ref()
            .ok_or_else(|| HardwareError::Unsupported(fan_id.to_string()))?;

        self.write_file(enable_path, "2").await?;
        *channel.last_pwm_value.write().await = None;
        debug!("Released fan {} ({}) to automatic control", fan_id, channel.chip_name);
        Ok(())
    }
}
