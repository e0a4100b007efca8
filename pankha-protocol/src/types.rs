//! Hardware snapshot types shared between agent and hub: Sensor, Fan, SystemHealth.

use serde::{Deserialize, Serialize};

/// Sensor reading with temperature data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub name: String,
    pub temperature: f64,
    #[serde(rename = "type")]
    pub sensor_type: String,
    pub max_temp: Option<f64>,
    pub crit_temp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "hardwareName")]
    pub hardware_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Hidden sensors stay addressable by id but are excluded from HIGHEST
    /// aggregation and from duplicate grouping output.
    #[serde(default = "default_visible")]
    pub visible: bool,
    /// No reading arrived within the last update interval.
    #[serde(default, skip_serializing_if = "is_false")]
    pub stale: bool,
}

fn default_visible() -> bool {
    true
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Fan information with RPM and PWM control
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fan {
    pub id: String,
    pub name: String,
    pub rpm: Option<u32>,
    pub speed: u8, // 0-100%
    #[serde(rename = "targetSpeed")]
    pub target_speed: u8,
    pub status: String, // "ok", "stopped", "error"
    pub has_pwm_control: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pwm_file: Option<String>,
    /// Hub-owned profile binding; the agent only echoes it back.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "profileId")]
    pub profile_id: Option<String>,
    /// Control source token: a sensor id, [`CONTROL_SOURCE_HIGHEST`], or a
    /// chip-group name.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "controlSensor")]
    pub control_sensor: Option<String>,
}

/// Token assigning a fan to the hottest visible sensor instead of a fixed one.
pub const CONTROL_SOURCE_HIGHEST: &str = "HIGHEST";

/// System health metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    #[serde(rename = "cpuUsage")]
    pub cpu_usage: f64,
    #[serde(rename = "memoryUsage")]
    pub memory_usage: f64,
    #[serde(rename = "agentUptime")]
    pub agent_uptime: f64,
}

impl Fan {
    pub fn controllable(&self) -> bool {
        self.has_pwm_control
    }
}
