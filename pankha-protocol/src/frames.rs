//! Wire frames. All frames are UTF-8 JSON objects with a `type` discriminator;
//! timestamps are milliseconds since the Unix epoch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Fan, Sensor, SystemHealth};

/// Frames the agent sends to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentFrame {
    #[serde(rename = "register")]
    Register { data: RegisterData },
    #[serde(rename = "data")]
    Telemetry { data: TelemetryData },
    #[serde(rename = "updateConfig")]
    UpdateConfig { data: Value },
    #[serde(rename = "commandResponse")]
    CommandResponse(CommandResponse),
    #[serde(rename = "pong")]
    Pong { timestamp: i64 },
}

/// Frames the hub sends to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HubFrame {
    #[serde(rename = "registered")]
    Registered {
        #[serde(skip_serializing_if = "Option::is_none")]
        agent: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        configuration: Option<Value>,
    },
    #[serde(rename = "command")]
    Command { data: CommandEnvelope },
    #[serde(rename = "ping")]
    Ping { timestamp: i64 },
    #[serde(rename = "close")]
    Close,
}

/// Registration payload: identity, version, config snapshot, capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterData {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    pub name: String,
    pub agent_version: String,
    pub platform: String,
    pub update_interval: f64,
    pub fan_step_percent: u8,
    pub hysteresis_temp: f64,
    pub emergency_temp: f64,
    pub failsafe_speed: u8,
    pub log_level: String,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub sensors: Vec<Sensor>,
    pub fans: Vec<Fan>,
    pub fan_control: bool,
}

/// Periodic telemetry payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryData {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    pub timestamp: i64,
    pub sensors: Vec<Sensor>,
    pub fans: Vec<Fan>,
    #[serde(rename = "systemHealth")]
    pub system_health: SystemHealth,
}

/// A command as carried inside a `command` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "commandId")]
    pub command_id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    pub payload: Value,
}

/// Reply to a command, keyed by the originating command id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    #[serde(rename = "commandId")]
    pub command_id: String,
    pub success: bool,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
}

impl CommandResponse {
    pub fn ok(command_id: impl Into<String>, data: Value) -> Self {
        Self {
            command_id: command_id.into(),
            success: true,
            data,
            error: None,
            timestamp: crate::now_millis(),
        }
    }

    pub fn err(command_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            success: false,
            data: Value::Object(Default::default()),
            error: Some(error.into()),
            timestamp: crate::now_millis(),
        }
    }
}

/// Frames the hub sends to UI subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UiFrame {
    #[serde(rename = "fullState")]
    FullState { data: Value },
    #[serde(rename = "systemDelta")]
    SystemDelta { data: Value },
    #[serde(rename = "agentRegistered")]
    AgentRegistered { data: Value },
    #[serde(rename = "agentOffline")]
    AgentOffline { data: Value },
}
