//! Windows HardwareMonitor variant.
//!
//! Sensor and fan access on Windows goes through the monitoring library
//! bridge service; until that bridge is connected this variant reports an
//! empty capability set and refuses writes explicitly, never dropping one
//! silently. GPU fans on this platform are released to driver-auto while
//! offline, and `fan_safety_minimum` does not apply to released fans (the
//! driver owns the floor).

use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use pankha_protocol::types::{Fan, Sensor, SystemHealth};

use crate::config::types::HardwareSettings;
use crate::hardware::{HardwareError, HardwareMonitor, Sample};

pub struct WindowsHardwareMonitor {
    #[allow(dead_code)]
    config: HardwareSettings,
    system_info: RwLock<sysinfo::System>,
    started: Instant,
}

impl WindowsHardwareMonitor {
    pub fn new(config: HardwareSettings) -> Self {
        Self {
            config,
            system_info: RwLock::new(sysinfo::System::new_all()),
            started: Instant::now(),
        }
    }
}

#[async_trait]
impl HardwareMonitor for WindowsHardwareMonitor {
    async fn discover_sensors(&self) -> Result<Vec<Sensor>, HardwareError> {
        warn!("Windows sensor discovery requires the hardware bridge service");
        Ok(Vec::new())
    }

    async fn discover_fans(&self) -> Result<Vec<Fan>, HardwareError> {
        warn!("Windows fan discovery requires the hardware bridge service");
        Ok(Vec::new())
    }

    async fn read_sample(&self) -> Result<Sample, HardwareError> {
        Ok(Sample::default())
    }

    async fn set_fan_duty(&self, fan_id: &str, duty: u8) -> Result<(), HardwareError> {
        if duty > 100 {
            return Err(HardwareError::OutOfRange(duty));
        }
        Err(HardwareError::Unsupported(fan_id.to_string()))
    }

    async fn release_fan_to_auto(&self, fan_id: &str) -> Result<(), HardwareError> {
        Err(HardwareError::Unsupported(fan_id.to_string()))
    }

    async fn system_health(&self) -> Result<SystemHealth, HardwareError> {
        let mut sys = self.system_info.write().await;
        sys.refresh_cpu();
        sys.refresh_memory();

        Ok(SystemHealth {
            cpu_usage: sys.global_cpu_info().cpu_usage() as f64,
            memory_usage: (sys.used_memory() as f64 / sys.total_memory() as f64) * 100.0,
            agent_uptime: self.started.elapsed().as_secs_f64(),
        })
    }

    async fn invalidate_cache(&self) {}

    fn release_gpu_fans_when_offline(&self) -> bool {
        true
    }
}
