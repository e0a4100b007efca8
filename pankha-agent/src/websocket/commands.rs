//! Inbound command dispatch. Each command mutates exactly one aspect of
//! agent state and yields exactly one `commandResponse` with the matching
//! command id.

use serde_json::json;
use tracing::{debug, warn};

use pankha_protocol::commands::{AgentCommand, CommandParseError};
use pankha_protocol::curves;
use pankha_protocol::frames::{AgentFrame, CommandEnvelope, CommandResponse};

use crate::app::logging;
use crate::config::validate;
use crate::control::state::{EngineCommand, FanAssignment};

impl super::client::WebSocketClient {
    pub(crate) async fn handle_command(&self, envelope: CommandEnvelope) {
        let command_id = envelope.command_id.clone();
        debug!(
            "Processing command: {} ({})",
            envelope.command_type, command_id
        );

        let command = match AgentCommand::from_envelope(&envelope) {
            Ok(command) => command,
            Err(e @ CommandParseError::UnknownType(_)) => {
                warn!("{}", e);
                self.respond(CommandResponse::err(command_id, e.to_string())).await;
                return;
            }
            Err(e) => {
                self.respond(CommandResponse::err(command_id, e.to_string())).await;
                return;
            }
        };

        match command {
            // selfUpdate responds from its own task once the download verifies
            AgentCommand::SelfUpdate { channel, version, hash } => {
                self.spawn_self_update(command_id, channel, version, hash);
            }
            command => {
                let response = self.dispatch(&command_id, command).await;
                self.respond(response).await;
            }
        }
    }

    async fn dispatch(&self, command_id: &str, command: AgentCommand) -> CommandResponse {
        match command {
            AgentCommand::SetFanSpeed { fan_id, speed } => {
                let config = self.config.snapshot().await;
                if !config.hardware.enable_fan_control {
                    return CommandResponse::err(command_id, "Fan control is disabled");
                }
                if fan_id.trim().is_empty() {
                    return CommandResponse::err(command_id, "Fan ID cannot be empty");
                }
                if let Err(e) = validate::fan_speed(speed as u64) {
                    return CommandResponse::err(command_id, e.to_string());
                }
                let disabled = self
                    .disabled_fans
                    .read()
                    .map(|set| set.contains(&fan_id))
                    .unwrap_or(false);
                if disabled {
                    return CommandResponse::err(
                        command_id,
                        format!("Fan {} control disabled after write failures", fan_id),
                    );
                }
                match self
                    .engine
                    .send(EngineCommand::SetManualDuty {
                        fan_id: fan_id.clone(),
                        duty: speed,
                    })
                    .await
                {
                    // Acked on queue; a later write failure surfaces through
                    // the fan's error status in telemetry.
                    Ok(()) => CommandResponse::ok(
                        command_id,
                        json!({"fanId": fan_id, "speed": speed}),
                    ),
                    Err(_) => CommandResponse::err(command_id, "Control loop unavailable"),
                }
            }
            AgentCommand::EmergencyStop {} => {
                match self.engine.send(EngineCommand::EmergencyStop).await {
                    Ok(()) => CommandResponse::ok(
                        command_id,
                        json!({"message": "Emergency stop executed"}),
                    ),
                    Err(_) => CommandResponse::err(command_id, "Control loop unavailable"),
                }
            }
            AgentCommand::ClearEmergency {} => {
                match self.engine.send(EngineCommand::ClearEmergency).await {
                    Ok(()) => CommandResponse::ok(
                        command_id,
                        json!({"message": "Emergency cleared"}),
                    ),
                    Err(_) => CommandResponse::err(command_id, "Control loop unavailable"),
                }
            }
            AgentCommand::SetUpdateInterval { interval } => {
                if let Err(e) = validate::update_interval(interval) {
                    return CommandResponse::err(command_id, e.to_string());
                }
                match self
                    .config
                    .mutate(|c| c.agent.update_interval = interval)
                    .await
                {
                    Ok(_) => CommandResponse::ok(command_id, json!({"interval": interval})),
                    Err(e) => CommandResponse::err(command_id, e.to_string()),
                }
            }
            AgentCommand::SetSensorDeduplication { enabled } => {
                match self
                    .config
                    .mutate(|c| c.hardware.filter_duplicate_sensors = enabled)
                    .await
                {
                    // Visibility is recomputed on the next tick
                    Ok(_) => CommandResponse::ok(command_id, json!({"enabled": enabled})),
                    Err(e) => CommandResponse::err(command_id, e.to_string()),
                }
            }
            AgentCommand::SetSensorTolerance { tolerance } => {
                if let Err(e) = validate::sensor_tolerance(tolerance) {
                    return CommandResponse::err(command_id, e.to_string());
                }
                match self
                    .config
                    .mutate(|c| c.hardware.duplicate_sensor_tolerance = tolerance)
                    .await
                {
                    Ok(_) => CommandResponse::ok(command_id, json!({"tolerance": tolerance})),
                    Err(e) => CommandResponse::err(command_id, e.to_string()),
                }
            }
            AgentCommand::SetFanStep { step } => {
                if let Err(e) = validate::fan_step(step) {
                    return CommandResponse::err(command_id, e.to_string());
                }
                match self.config.mutate(|c| c.hardware.fan_step_percent = step).await {
                    Ok(_) => CommandResponse::ok(command_id, json!({"step": step})),
                    Err(e) => CommandResponse::err(command_id, e.to_string()),
                }
            }
            AgentCommand::SetHysteresis { hysteresis } => {
                if let Err(e) = validate::hysteresis(hysteresis) {
                    return CommandResponse::err(command_id, e.to_string());
                }
                match self
                    .config
                    .mutate(|c| c.hardware.hysteresis_temp = hysteresis)
                    .await
                {
                    Ok(_) => CommandResponse::ok(command_id, json!({"hysteresis": hysteresis})),
                    Err(e) => CommandResponse::err(command_id, e.to_string()),
                }
            }
            AgentCommand::SetEmergencyTemp { temperature } => {
                if let Err(e) = validate::emergency_temp(temperature) {
                    return CommandResponse::err(command_id, e.to_string());
                }
                match self
                    .config
                    .mutate(|c| c.hardware.emergency_temp = temperature)
                    .await
                {
                    Ok(_) => CommandResponse::ok(command_id, json!({"temperature": temperature})),
                    Err(e) => CommandResponse::err(command_id, e.to_string()),
                }
            }
            AgentCommand::SetFailsafeSpeed { speed } => {
                if let Err(e) = validate::fan_speed(speed as u64) {
                    return CommandResponse::err(command_id, e.to_string());
                }
                match self.config.mutate(|c| c.hardware.failsafe_speed = speed).await {
                    Ok(_) => CommandResponse::ok(command_id, json!({"speed": speed})),
                    Err(e) => CommandResponse::err(command_id, e.to_string()),
                }
            }
            AgentCommand::SetEnableFanControl { enabled } => {
                match self
                    .config
                    .mutate(|c| c.hardware.enable_fan_control = enabled)
                    .await
                {
                    Ok(_) => CommandResponse::ok(command_id, json!({"enabled": enabled})),
                    Err(e) => CommandResponse::err(command_id, e.to_string()),
                }
            }
            AgentCommand::SetAgentName { name } => {
                if let Err(e) = validate::agent_name(&name) {
                    return CommandResponse::err(command_id, e.to_string());
                }
                match self.config.mutate(|c| c.agent.name = name.clone()).await {
                    Ok(_) => CommandResponse::ok(command_id, json!({"name": name})),
                    Err(e) => CommandResponse::err(command_id, e.to_string()),
                }
            }
            AgentCommand::SetLogLevel { level } => {
                if let Err(e) = validate::log_level(&level) {
                    return CommandResponse::err(command_id, e.to_string());
                }
                logging::set_level(&level);
                let level = level.to_uppercase();
                match self.config.mutate(|c| c.agent.log_level = level.clone()).await {
                    Ok(_) => CommandResponse::ok(command_id, json!({"level": level})),
                    Err(e) => CommandResponse::err(command_id, e.to_string()),
                }
            }
            AgentCommand::SetFanProfile {
                fan_id,
                profile_id,
                mut points,
                control_sensor,
            } => {
                if let Err(e) = curves::validate_points(&points) {
                    return CommandResponse::err(command_id, e.to_string());
                }
                curves::normalize_points(&mut points);
                match self
                    .engine
                    .send(EngineCommand::AssignProfile {
                        fan_id: fan_id.clone(),
                        assignment: FanAssignment {
                            profile_id: profile_id.clone(),
                            points,
                            control_sensor,
                        },
                    })
                    .await
                {
                    Ok(()) => CommandResponse::ok(
                        command_id,
                        json!({"fanId": fan_id, "profileId": profile_id}),
                    ),
                    Err(_) => CommandResponse::err(command_id, "Control loop unavailable"),
                }
            }
            AgentCommand::Ping {} => CommandResponse::ok(command_id, json!({"pong": true})),
            AgentCommand::SelfUpdate { .. } => unreachable!("handled before dispatch"),
        }
    }

    pub(crate) async fn respond(&self, response: CommandResponse) {
        debug!(
            "Sending command response: {}, success: {}",
            response.command_id, response.success
        );
        self.session
            .send_reliable(AgentFrame::CommandResponse(response))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, RwLock as StdRwLock};

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use pankha_protocol::frames::{AgentFrame, CommandEnvelope};
    use pankha_protocol::types::{Fan, Sensor, SystemHealth};

    use crate::config::persistence::ConfigStore;
    use crate::config::types::AgentConfig;
    use crate::hardware::{HardwareError, HardwareMonitor, Sample};
    use crate::websocket::client::WebSocketClient;
    use crate::websocket::SessionHandle;

    struct StubMonitor;

    #[async_trait]
    impl HardwareMonitor for StubMonitor {
        async fn discover_sensors(&self) -> Result<Vec<Sensor>, HardwareError> {
            Ok(vec![])
        }
        async fn discover_fans(&self) -> Result<Vec<Fan>, HardwareError> {
            Ok(vec![])
        }
        async fn read_sample(&self) -> Result<Sample, HardwareError> {
            Ok(Sample::default())
        }
        async fn set_fan_duty(&self, _fan_id: &str, _duty: u8) -> Result<(), HardwareError> {
            Ok(())
        }
        async fn release_fan_to_auto(&self, _fan_id: &str) -> Result<(), HardwareError> {
            Ok(())
        }
        async fn system_health(&self) -> Result<SystemHealth, HardwareError> {
            Ok(SystemHealth {
                cpu_usage: 0.0,
                memory_usage: 0.0,
                agent_uptime: 0.0,
            })
        }
        async fn invalidate_cache(&self) {}
    }

    struct Harness {
        client: WebSocketClient,
        outbound: mpsc::Receiver<AgentFrame>,
        engine: mpsc::Receiver<crate::control::state::EngineCommand>,
        disabled: Arc<StdRwLock<HashSet<String>>>,
        _dir: TempDir,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let config = ConfigStore::new(AgentConfig::default(), dir.path().join("config.json"));
        let session = SessionHandle::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        session.attach(outbound_tx).await;
        let (engine_tx, engine_rx) = mpsc::channel(16);
        let disabled = Arc::new(StdRwLock::new(HashSet::new()));
        let client = WebSocketClient::new(
            config,
            Arc::new(StubMonitor),
            session,
            engine_tx,
            disabled.clone(),
        );
        Harness {
            client,
            outbound: outbound_rx,
            engine: engine_rx,
            disabled,
            _dir: dir,
        }
    }

    fn envelope(command_type: &str, payload: serde_json::Value) -> CommandEnvelope {
        CommandEnvelope {
            command_id: "cmd-1".into(),
            command_type: command_type.into(),
            payload,
        }
    }

    async fn response_of(harness: &mut Harness) -> pankha_protocol::frames::CommandResponse {
        match harness.outbound.recv().await.unwrap() {
            AgentFrame::CommandResponse(response) => response,
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn every_command_yields_matching_response() {
        let mut h = harness().await;
        for (command_type, payload) in [
            ("ping", serde_json::json!({})),
            ("setHysteresis", serde_json::json!({"hysteresis": 2.5})),
            ("frobnicate", serde_json::json!({})),
        ] {
            h.client.handle_command(envelope(command_type, payload)).await;
            let response = response_of(&mut h).await;
            assert_eq!(response.command_id, "cmd-1");
        }
    }

    #[tokio::test]
    async fn unknown_command_reports_its_name() {
        let mut h = harness().await;
        h.client
            .handle_command(envelope("frobnicate", serde_json::json!({})))
            .await;
        let response = response_of(&mut h).await;
        assert!(!response.success);
        assert_eq!(
            response.error.as_deref(),
            Some("Unknown command type: frobnicate")
        );
    }

    #[tokio::test]
    async fn set_fan_speed_acks_on_queue_and_reaches_engine() {
        let mut h = harness().await;
        h.client
            .handle_command(envelope(
                "setFanSpeed",
                serde_json::json!({"fanId": "fan1", "speed": 75}),
            ))
            .await;

        let response = response_of(&mut h).await;
        assert!(response.success);
        assert_eq!(response.data["fanId"], "fan1");
        assert_eq!(response.data["speed"], 75);

        match h.engine.recv().await.unwrap() {
            crate::control::state::EngineCommand::SetManualDuty { fan_id, duty } => {
                assert_eq!(fan_id, "fan1");
                assert_eq!(duty, 75);
            }
            other => panic!("unexpected engine command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn out_of_range_speed_is_rejected_without_engine_traffic() {
        let mut h = harness().await;
        h.client
            .handle_command(envelope(
                "setFanSpeed",
                serde_json::json!({"fanId": "fan1", "speed": 101}),
            ))
            .await;
        let response = response_of(&mut h).await;
        assert!(!response.success);
        assert!(h.engine.try_recv().is_err());
    }

    #[tokio::test]
    async fn disabled_fan_refuses_speed_commands() {
        let mut h = harness().await;
        h.disabled.write().unwrap().insert("fan1".to_string());
        h.client
            .handle_command(envelope(
                "setFanSpeed",
                serde_json::json!({"fanId": "fan1", "speed": 50}),
            ))
            .await;
        let response = response_of(&mut h).await;
        assert!(!response.success);
        assert!(h.engine.try_recv().is_err());
    }

    #[tokio::test]
    async fn config_commands_validate_and_persist() {
        let mut h = harness().await;
        h.client
            .handle_command(envelope("setUpdateInterval", serde_json::json!({"interval": 60.0})))
            .await;
        let response = response_of(&mut h).await;
        assert!(!response.success);

        h.client
            .handle_command(envelope("setUpdateInterval", serde_json::json!({"interval": 5.0})))
            .await;
        let response = response_of(&mut h).await;
        assert!(response.success);
        assert_eq!(
            h.client.config.snapshot().await.agent.update_interval,
            5.0
        );
    }
}
