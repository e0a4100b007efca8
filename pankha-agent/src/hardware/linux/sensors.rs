//! hwmon sensor discovery and naming.

use std::path::{Path, PathBuf};

use pankha_protocol::chips::classify_sensor_type;
use pankha_protocol::types::Sensor;

use super::monitor::{LinuxHardwareMonitor, SensorChannel};
use crate::hardware::HardwareError;

impl LinuxHardwareMonitor {
    /// Walk every hwmon chip and rebuild the sensor channel cache.
    pub(crate) async fn walk_sensors(&self) -> Result<(), HardwareError> {
        let mut discovered = Vec::new();

        if self.hwmon_base.exists() {
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

                let pattern = hwmon_dir.join("temp*_input");
                let pattern_str = pattern.to_string_lossy();

                for temp_file in glob::glob(&pattern_str).unwrap().filter_map(Result::ok) {
                    if let Ok(channel) = self.parse_sensor(&hwmon_dir, &temp_file, &chip_name).await {
                        discovered.push(channel);
                    }
                }
            }
        }

        let mut cache = self.sensor_channels.write().await;
        cache.clear();
        for channel in discovered {
            cache.insert(channel.snapshot.id.clone(), channel);
        }
        Ok(())
    }

    async fn parse_sensor(
        &self,
        hwmon_dir: &Path,
        temp_file: &Path,
        chip_name: &str,
    ) -> Result<SensorChannel, HardwareError> {
        let filename = temp_file.file_name().unwrap().to_string_lossy();
        let temp_num = filename
            .strip_prefix("temp")
            .and_then(|s| s.strip_suffix("_input"))
            .unwrap();

        // Temperature arrives as millidegrees
        let temp_raw: i64 = self
            .read_file(temp_file)
            .await?
            .parse()
            .map_err(|_| HardwareError::ReadUnavailable(temp_file.display().to_string()))?;
        let temp_celsius = temp_raw as f64 / 1000.0;

        let label_path = hwmon_dir.join(format!("temp{}_label", temp_num));
        let sensor_label = self
            .read_file(&label_path)
            .await
            .unwrap_or_else(|_| format!("Sensor {}", temp_num));

        let max_temp = self
            .read_file(&hwmon_dir.join(format!("temp{}_max", temp_num)))
            .await
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(|v| v as f64 / 1000.0);
        let crit_temp = self
            .read_file(&hwmon_dir.join(format!("temp{}_crit", temp_num)))
            .await
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(|v| v as f64 / 1000.0);

        // Label-derived ids stay stable across restarts for the same layout
        let sanitized_label = sensor_label
            .to_lowercase()
            .replace(' ', "_")
            .replace('-', "_")
            .replace('/', "_")
            .replace(['(', ')'], "");
        let sensor_id = format!(
            "{}_{}",
            chip_name.to_lowercase().replace(' ', "_"),
            sanitized_label
        );

        let sensor_type = classify_sensor_type(chip_name).to_string();
        let hardware_name = self
            .resolve_hardware_name(hwmon_dir, chip_name, &sensor_type)
            .await;

        let snapshot = Sensor {
            id: sensor_id,
            name: format!("{} {}", friendly_chip_name(chip_name), sensor_label),
            temperature: (temp_celsius * 10.0).round() / 10.0,
            sensor_type,
            max_temp,
            crit_temp,
            chip: Some(chip_name.to_string()),
            hardware_name: Some(hardware_name),
            source: Some(temp_file.to_string_lossy().to_string()),
            visible: true,
            stale: false,
        };

        Ok(SensorChannel {
            temp_input_path: temp_file.to_path_buf(),
            snapshot,
        })
    }

    async fn resolve_hardware_name(
        &self,
        hwmon_dir: &Path,
        chip_name: &str,
        sensor_type: &str,
    ) -> String {
        if sensor_type == "cpu" && !self.cpu_brand.is_empty() {
            return self.cpu_brand.clone();
        }
        if sensor_type == "motherboard" && !self.motherboard_name.is_empty() {
            return self.motherboard_name.clone();
        }
        if sensor_type == "nvme" || chip_name.contains("nvme") || chip_name.contains("sd") {
            if let Some(model) = self.resolve_storage_model(hwmon_dir, chip_name).await {
                return model;
            }
        }
        chip_name.to_string()
    }

    /// Look up the storage device model behind an nvme/sata hwmon chip.
    pub(crate) async fn resolve_storage_model(
        &self,
        hwmon_dir: &Path,
        chip_name: &str,
    ) -> Option<String> {
        {
            let cache = self.storage_cache.read().await;
            if let Some(model) = cache.get(chip_name) {
                return Some(model.clone());
            }
        }

        let mut found_model = None;

        // Some drivers expose device/model directly under the hwmon dir
        let direct_model = hwmon_dir.join("device/model");
        if direct_model.exists() {
            found_model = self.read_file(&direct_model).await.ok();
        }

        // Common NVMe/SATA path: hwmonX/device/block/<dev>/device/model
        if found_model.is_none() {
            let device_block = hwmon_dir.join("device/block");
            if let Ok(mut entries) = tokio::fs::read_dir(&device_block).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let model_path = entry.path().join("device/model");
                    if model_path.exists() {
                        if let Ok(model) = self.read_file(&model_path).await {
                            found_model = Some(model);
                            break;
                        }
                    }
                }
            }
        }

        // Last resort: guess the block device name from the chip name
        if found_model.is_none() {
            let device_name = if chip_name.starts_with("nvme") && !chip_name.contains('n') {
                format!("{}n1", chip_name)
            } else {
                chip_name.to_string()
            };
            let model_path =
                PathBuf::from(format!("/sys/class/block/{}/device/model", device_name));
            if model_path.exists() {
                found_model = self.read_file(&model_path).await.ok();
            }
        }

        let model = found_model?.trim().to_string();
        self.storage_cache
            .write()
            .await
            .insert(chip_name.to_string(), model.clone());
        Some(model)
    }
}

/// Type-first display name: "CPU AMD", "Storage Samsung", etc.
fn friendly_chip_name(chip_name: &str) -> String {
    let brand = extract_brand(chip_name);
    let chip_lower = chip_name.to_lowercase();

    let kind = if chip_lower.contains("k10temp") || chip_lower.contains("coretemp") || chip_lower.contains("cpu") {
        "CPU"
    } else if chip_lower.contains("nvme") {
        "Storage"
    } else if chip_lower.contains("it8") || chip_lower.contains("nct") {
        "Motherboard"
    } else if chip_lower.contains("acpi") {
        return "ACPI".to_string();
    } else {
        return chip_name.to_string();
    };

    if brand.is_empty() {
        kind.to_string()
    } else {
        format!("{} {}", kind, brand)
    }
}

fn extract_brand(chip_name: &str) -> String {
    let name = chip_name.to_lowercase();

    if name.contains("amd") || name.contains("k10temp") {
        return "AMD".to_string();
    }
    if name.contains("intel") || name.contains("coretemp") {
        return "Intel".to_string();
    }
    if name.contains("samsung") {
        return "Samsung".to_string();
    }
    if name.contains("wd") {
        return "WD".to_string();
    }
    if name.contains("kingston") {
        return "Kingston".to_string();
    }
    if name.contains("it8") || name.contains("ite") {
        return "ITE".to_string();
    }
    if name.contains("nct") || name.contains("nuvoton") {
        return "Nuvoton".to_string();
    }

    String::new()
}
