//! Typed command payloads. Unknown types and malformed payloads are rejected
//! here, at parse time, so the dispatcher only ever sees well-formed commands.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::curves::CurvePoint;
use crate::frames::CommandEnvelope;

/// Fan step values accepted by `setFanStep`. 100 disables smoothing.
pub const VALID_FAN_STEPS: [u8; 7] = [3, 5, 10, 15, 25, 50, 100];

pub const VALID_LOG_LEVELS: [&str; 6] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR", "CRITICAL"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum AgentCommand {
    #[serde(rename = "setFanSpeed")]
    SetFanSpeed {
        #[serde(rename = "fanId")]
        fan_id: String,
        speed: u8,
    },
    #[serde(rename = "emergencyStop")]
    EmergencyStop {},
    #[serde(rename = "clearEmergency")]
    ClearEmergency {},
    #[serde(rename = "setUpdateInterval")]
    SetUpdateInterval { interval: f64 },
    #[serde(rename = "setSensorDeduplication")]
    SetSensorDeduplication { enabled: bool },
    #[serde(rename = "setSensorTolerance")]
    SetSensorTolerance { tolerance: f64 },
    #[serde(rename = "setFanStep")]
    SetFanStep { step: u8 },
    #[serde(rename = "setHysteresis")]
    SetHysteresis { hysteresis: f64 },
    #[serde(rename = "setEmergencyTemp")]
    SetEmergencyTemp { temperature: f64 },
    #[serde(rename = "setFailsafeSpeed")]
    SetFailsafeSpeed { speed: u8 },
    #[serde(rename = "setEnableFanControl")]
    SetEnableFanControl { enabled: bool },
    #[serde(rename = "setAgentName")]
    SetAgentName { name: String },
    #[serde(rename = "setLogLevel")]
    SetLogLevel { level: String },
    #[serde(rename = "setFanProfile")]
    SetFanProfile {
        #[serde(rename = "fanId")]
        fan_id: String,
        #[serde(rename = "profileId")]
        profile_id: String,
        points: Vec<CurvePoint>,
        #[serde(rename = "controlSensor")]
        control_sensor: String,
    },
    #[serde(rename = "selfUpdate")]
    SelfUpdate {
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        version: Option<String>,
        hash: String,
    },
    #[serde(rename = "ping")]
    Ping {},
}

#[derive(Debug, Error)]
pub enum CommandParseError {
    #[error("Unknown command type: {0}")]
    UnknownType(String),
    #[error("Invalid payload for {command}: {source}")]
    InvalidPayload {
        command: String,
        source: serde_json::Error,
    },
}

impl AgentCommand {
    /// The wire name of this command, as carried in the `type` field.
    pub fn wire_name(&self) -> &'static str {
        match self {
            AgentCommand::SetFanSpeed { .. } => "setFanSpeed",
            AgentCommand::EmergencyStop {} => "emergencyStop",
            AgentCommand::ClearEmergency {} => "clearEmergency",
            AgentCommand::SetUpdateInterval { .. } => "setUpdateInterval",
            AgentCommand::SetSensorDeduplication { .. } => "setSensorDeduplication",
            AgentCommand::SetSensorTolerance { .. } => "setSensorTolerance",
            AgentCommand::SetFanStep { .. } => "setFanStep",
            AgentCommand::SetHysteresis { .. } => "setHysteresis",
            AgentCommand::SetEmergencyTemp { .. } => "setEmergencyTemp",
            AgentCommand::SetFailsafeSpeed { .. } => "setFailsafeSpeed",
            AgentCommand::SetEnableFanControl { .. } => "setEnableFanControl",
            AgentCommand::SetAgentName { .. } => "setAgentName",
            AgentCommand::SetLogLevel { .. } => "setLogLevel",
            AgentCommand::SetFanProfile { .. } => "setFanProfile",
            AgentCommand::SelfUpdate { .. } => "selfUpdate",
            AgentCommand::Ping {} => "ping",
        }
    }

    /// Parse the typed command out of a received envelope.
    pub fn from_envelope(envelope: &CommandEnvelope) -> Result<AgentCommand, CommandParseError> {
        let tagged = serde_json::json!({
            "type": envelope.command_type,
            "payload": envelope.payload,
        });
        serde_json::from_value(tagged).map_err(|e| {
            if Self::is_known_type(&envelope.command_type) {
                CommandParseError::InvalidPayload {
                    command: envelope.command_type.clone(),
                    source: e,
                }
            } else {
                CommandParseError::UnknownType(envelope.command_type.clone())
            }
        })
    }

    fn is_known_type(name: &str) -> bool {
        matches!(
            name,
            "setFanSpeed"
                | "emergencyStop"
                | "clearEmergency"
                | "setUpdateInterval"
                | "setSensorDeduplication"
                | "setSensorTolerance"
                | "setFanStep"
                | "setHysteresis"
                | "setEmergencyTemp"
                | "setFailsafeSpeed"
                | "setEnableFanControl"
                | "setAgentName"
                | "setLogLevel"
                | "setFanProfile"
                | "selfUpdate"
                | "ping"
        )
    }

    /// Wrap this command into an envelope with the given id.
    pub fn into_envelope(self, command_id: impl Into<String>) -> CommandEnvelope {
        let tagged = serde_json::to_value(&self).expect("command serialization is infallible");
        let payload = tagged.get("payload").cloned().unwrap_or(Value::Object(Default::default()));
        CommandEnvelope {
            command_id: command_id.into(),
            command_type: self.wire_name().to_string(),
            payload,
        }
    }
}
