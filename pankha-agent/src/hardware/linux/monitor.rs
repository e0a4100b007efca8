//! Linux hardware monitor: kernel hwmon walker, channel caches, trait impl.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use pankha_protocol::types::{Fan, Sensor, SystemHealth};

use crate::config::types::HardwareSettings;
use crate::hardware::{HardwareError, HardwareMonitor, Sample};

/// Cached sensor channel: metadata plus the path re-read every sample.
#[derive(Clone)]
pub(crate) struct SensorChannel {
    pub(crate) temp_input_path: PathBuf,
    pub(crate) snapshot: Sensor,
}

/// Cached fan channel with write-side state.
pub(crate) struct FanChannel {
    pub(crate) pwm_path: PathBuf,
    pub(crate) rpm_path: PathBuf,
    pub(crate) pwm_enable_path: Option<PathBuf>,
    pub(crate) chip_name: String,
    pub(crate) display_name: String,
    pub(crate) last_pwm_value: RwLock<Option<u8>>,
    pub(crate) last_write_time: RwLock<Instant>,
}

pub struct LinuxHardwareMonitor {
    pub(crate) hwmon_base: PathBuf,
    #[allow(dead_code)]
    pub(crate) config: HardwareSettings,
    pub(crate) sensor_channels: RwLock<HashMap<String, SensorChannel>>,
    pub(crate) fan_channels: RwLock<HashMap<String, FanChannel>>,
    pub(crate) cached_hwmon_count: RwLock<usize>,
    /// Channels already logged as unreadable, to avoid a log line per tick.
    pub(crate) reported_stale: RwLock<HashSet<String>>,
    pub(crate) system_info: RwLock<sysinfo::System>,
    pub(crate) system_info_cache: RwLock<Option<(SystemHealth, Instant)>>,
    pub(crate) cpu_brand: String,
    pub(crate) motherboard_name: String,
    pub(crate) storage_cache: RwLock<HashMap<String, String>>,
    pub(crate) started: Instant,
}

impl LinuxHardwareMonitor {
    pub fn new(config: HardwareSettings) -> Self {
        let mut sys = sysinfo::System::new_all();
        sys.refresh_cpu();

        let mut cpu_brand = sys.global_cpu_info().brand().to_string();

        // sysinfo comes back empty on some ARM boards; fall back to /proc/cpuinfo
        if cpu_brand.is_empty() {
            if let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") {
                for line in cpuinfo.lines() {
                    if line.starts_with("model name") || line.starts_with("Model") {
                        if let Some(name) = line.split(':').nth(1) {
                            cpu_brand = name.trim().to_string();
                            break;
                        }
                    }
                }
            }
        }

        Self {
            hwmon_base: PathBuf::from("/sys/class/hwmon"),
            config,
            sensor_channels: RwLock::new(HashMap::new()),
            fan_channels: RwLock::new(HashMap::new()),
            cached_hwmon_count: RwLock::new(0),
            reported_stale: RwLock::new(HashSet::new()),
            system_info: RwLock::new(sys),
            system_info_cache: RwLock::new(None),
            cpu_brand,
            motherboard_name: read_motherboard_name(),
            storage_cache: RwLock::new(HashMap::new()),
            started: Instant::now(),
        }
    }

    pub(crate) async fn read_file(&self, path: &Path) -> Result<String, HardwareError> {
        tokio::fs::read_to_string(path)
            .await
            .map(|s| s.trim().to_string())
            .map_err(|e| HardwareError::from_io(path, e))
    }

    pub(crate) async fn write_file(&self, path: &Path, value: &str) -> Result<(), HardwareError> {
        tokio::fs::write(path, value)
            .await
            .map_err(|e| HardwareError::from_io(path, e))
    }

    /// Count hwmon directories for hot-plug detection.
    async fn count_hwmon_dirs(&self) -> usize {
        match tokio::fs::read_dir(&self.hwmon_base).await {
            Ok(mut entries) => {
                let mut count = 0;
                while let Ok(Some(entry)) = entries.next_entry().await {
                    if entry.path().is_dir() {
                        count += 1;
                    }
                }
                count
            }
            Err(_) => 0,
        }
    }

    /// Re-walk hwmon when the chip population changed or the cache is empty.
    pub(crate) async fn ensure_discovered(&self) -> Result<(), HardwareError> {
        let current = self.count_hwmon_dirs().await;
        let cached = *self.cached_hwmon_count.read().await;
        let empty = self.sensor_channels.read().await.is_empty();

        if current != cached || empty {
            debug!(
                "Hardware discovery triggered: hwmon_count {} -> {} (cache_empty: {})",
                cached, current, empty
            );
            self.walk_sensors().await?;
            self.walk_fans().await?;
            *self.cached_hwmon_count.write().await = current;
        }
        Ok(())
    }

    /// Read current values from cached sensor paths. A channel that fails to
    /// read keeps its last value and is marked stale; the failure is logged
    /// once until the channel recovers.
    async fn read_sensor_values(&self) -> Vec<Sensor> {
        let mut channels = self.sensor_channels.write().await;
        let mut sensors = Vec::with_capacity(channels.len());

        for channel in channels.values_mut() {
            match self.read_file(&channel.temp_input_path).await {
                Ok(raw) => match raw.parse::<i64>() {
                    Ok(millidegrees) => {
                        let temp = millidegrees as f64 / 1000.0;
                        channel.snapshot.temperature = (temp * 10.0).round() / 10.0;
                        channel.snapshot.stale = false;
                        self.reported_stale.write().await.remove(&channel.snapshot.id);
                    }
                    Err(_) => self.mark_stale(channel).await,
                },
                Err(_) => self.mark_stale(channel).await,
            }
            sensors.push(channel.snapshot.clone());
        }

        sensors.sort_by(|a, b| a.id.cmp(&b.id));
        sensors
    }

    async fn mark_stale(&self, channel: &mut SensorChannel) {
        channel.snapshot.stale = true;
        let mut reported = self.reported_stale.write().await;
        if reported.insert(channel.snapshot.id.clone()) {
            warn!(
                "Sensor channel unavailable: {} ({:?})",
                channel.snapshot.id, channel.temp_input_path
            );
        }
    }

    /// Read current RPM and PWM for every cached fan channel.
    async fn read_fan_values(&self) -> Vec<Fan> {
        let channels = self.fan_channels.read().await;
        let mut fans = Vec::with_capacity(channels.len());

        for (fan_id, channel) in channels.iter() {
            let rpm = self
                .read_file(&channel.rpm_path)
                .await
                .ok()
                .and_then(|s| s.parse::<u32>().ok());
            let pwm_value = self
                .read_file(&channel.pwm_path)
                .await
                .ok()
                .and_then(|s| s.parse::<u16>().ok())
                .unwrap_or(128);
            let speed_percent = (pwm_value as f32 / 255.0 * 100.0).round() as u8;

            fans.push(Fan {
                id: fan_id.clone(),
                name: channel.display_name.clone(),
                rpm,
                speed: speed_percent.min(100),
                target_speed: speed_percent.min(100),
                status: if rpm.unwrap_or(0) > 0 { "ok" } else { "stopped" }.to_string(),
                has_pwm_control: true,
                pwm_file: Some(channel.pwm_path.to_string_lossy().to_string()),
                profile_id: None,
                control_sensor: None,
            });
        }

        fans.sort_by(|a, b| a.id.cmp(&b.id));
        fans
    }
}

fn read_motherboard_name() -> String {
    let vendor = std::fs::read_to_string("/sys/class/dmi/id/board_vendor")
        .unwrap_or_default()
        .trim()
        .to_string();
    let name = std::fs::read_to_string("/sys/class/dmi/id/board_name")
        .unwrap_or_default()
        .trim()
        .to_string();

    if !vendor.is_empty() && !name.is_empty() {
        format!("{} {}", vendor, name)
    } else {
        name
    }
}

#[async_trait]
impl HardwareMonitor for LinuxHardwareMonitor {
    async fn discover_sensors(&self) -> Result<Vec<Sensor>, HardwareError> {
        self.ensure_discovered().await?;
        Ok(self.read_sensor_values().await)
    }

    async fn discover_fans(&self) -> Result<Vec<Fan>, HardwareError> {
        self.ensure_discovered().await?;
        Ok(self.read_fan_values().await)
    }

    async fn read_sample(&self) -> Result<Sample, HardwareError> {
        self.ensure_discovered().await?;
        Ok(Sample {
            sensors: self.read_sensor_values().await,
            fans: self.read_fan_values().await,
        })
    }

    async fn set_fan_duty(&self, fan_id: &str, duty: u8) -> Result<(), HardwareError> {
        self.write_fan_duty(fan_id, duty).await
    }

    async fn release_fan_to_auto(&self, fan_id: &str) -> Result<(), HardwareError> {
        self.release_to_auto(fan_id).await
    }

    async fn system_health(&self) -> Result<SystemHealth, HardwareError> {
        // 1 second TTL keeps sysinfo refreshes off the telemetry hot path
        let cache = self.system_info_cache.read().await;
        if let Some((health, timestamp)) = cache.as_ref() {
            if timestamp.elapsed() < std::time::Duration::from_secs(1) {
                return Ok(health.clone());
            }
        }
        drop(cache);

        let mut sys = self.system_info.write().await;
        sys.refresh_cpu();
        sys.refresh_memory();

        let health = SystemHealth {
            cpu_usage: sys.global_cpu_info().cpu_usage() as f64,
            memory_usage: (sys.used_memory() as f64 / sys.total_memory() as f64) * 100.0,
            agent_uptime: self.started.elapsed().as_secs_f64(),
        };

        *self.system_info_cache.write().await = Some((health.clone(), Instant::now()));
        Ok(health)
    }

    async fn invalidate_cache(&self) {
        self.sensor_channels.write().await.clear();
        *self.cached_hwmon_count.write().await = 0;
        debug!("Hardware cache invalidated - next discovery will be full rediscovery");
    }
}
