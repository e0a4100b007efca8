//! Platform-agnostic hardware capability surface.
//!
//! Each platform provides one coherent implementation of [`HardwareMonitor`];
//! the control engine is the only caller of [`HardwareMonitor::set_fan_duty`].

pub mod dedup;
#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "windows")]
pub mod windows;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use pankha_protocol::types::{Fan, Sensor, SystemHealth};

use crate::config::types::HardwareSettings;

#[derive(Debug, Error)]
pub enum HardwareError {
    /// One channel failed to read; other channels remain valid.
    #[error("sensor channel unavailable: {0}")]
    ReadUnavailable(String),
    #[error("fan not found: {0}")]
    NotFound(String),
    #[error("fan {0} has no PWM control")]
    Unsupported(String),
    #[error("duty {0} out of range 0-100")]
    OutOfRange(u8),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HardwareError {
    pub(crate) fn from_io(path: &std::path::Path, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            HardwareError::AccessDenied(path.display().to_string())
        } else {
            HardwareError::Io(err)
        }
    }
}

/// One refreshed reading of every discovered channel.
#[derive(Debug, Clone, Default)]
pub struct Sample {
    pub sensors: Vec<Sensor>,
    pub fans: Vec<Fan>,
}

#[async_trait]
pub trait HardwareMonitor: Send + Sync {
    /// Discover all available temperature sensors. Restartable; re-walks
    /// the platform surface when the cached layout is stale.
    async fn discover_sensors(&self) -> Result<Vec<Sensor>, HardwareError>;

    /// Discover all available fans.
    async fn discover_fans(&self) -> Result<Vec<Fan>, HardwareError>;

    /// Refresh all current readings. A failing channel is marked stale in
    /// the returned sample instead of failing the whole read.
    async fn read_sample(&self) -> Result<Sample, HardwareError>;

    /// Write a duty cycle (0-100) to a fan.
    async fn set_fan_duty(&self, fan_id: &str, duty: u8) -> Result<(), HardwareError>;

    /// Hand a fan back to firmware/driver control. Only meaningful on
    /// platforms where this differs from writing a duty.
    async fn release_fan_to_auto(&self, fan_id: &str) -> Result<(), HardwareError>;

    /// Process CPU/memory/uptime for the telemetry health block.
    async fn system_health(&self) -> Result<SystemHealth, HardwareError>;

    /// Drop cached discovery so the next call re-walks hardware.
    async fn invalidate_cache(&self);

    /// Whether GPU fans should be released to driver-auto instead of
    /// pinned to failsafe speed when the hub is unreachable.
    fn release_gpu_fans_when_offline(&self) -> bool {
        false
    }
}

/// Construct the capability set for the build platform.
#[cfg(target_os = "linux")]
pub fn platform_monitor(config: HardwareSettings) -> Arc<dyn HardwareMonitor> {
    Arc::new(linux::monitor::LinuxHardwareMonitor::new(config))
}

#[cfg(target_os = "windows")]
pub fn platform_monitor(config: HardwareSettings) -> Arc<dyn HardwareMonitor> {
    Arc::new(windows::WindowsHardwareMonitor::new(config))
}
