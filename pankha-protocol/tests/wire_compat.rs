//! Wire compatibility for the seven frame types exchanged with deployed
//! fleets: `register`, `data`, `command`, `commandResponse`, `registered`,
//! `ping`, `pong`. Field names and shapes here are load-bearing; changing
//! them strands agents in the field.

use serde_json::json;

use pankha_protocol::commands::AgentCommand;
use pankha_protocol::frames::*;
use pankha_protocol::types::{Fan, Sensor, SystemHealth};

fn sample_sensor() -> Sensor {
    Sensor {
        id: "k10temp_tctl".into(),
        name: "CPU AMD Tctl".into(),
        temperature: 52.5,
        sensor_type: "cpu".into(),
        max_temp: Some(90.0),
        crit_temp: Some(95.0),
        chip: Some("k10temp".into()),
        hardware_name: Some("AMD Ryzen 9 5950X".into()),
        source: Some("/sys/class/hwmon/hwmon2/temp1_input".into()),
        visible: true,
        stale: false,
    }
}

fn sample_fan() -> Fan {
    Fan {
        id: "it8628_fan_1".into(),
        name: "it8628 Fan 1".into(),
        rpm: Some(923),
        speed: 42,
        target_speed: 45,
        status: "ok".into(),
        has_pwm_control: true,
        pwm_file: Some("/sys/class/hwmon/hwmon4/pwm1".into()),
        profile_id: None,
        control_sensor: None,
    }
}

#[test]
fn register_frame_shape() {
    let frame = AgentFrame::Register {
        data: RegisterData {
            agent_id: "linux-bench-1a2b3c4d".into(),
            name: "bench".into(),
            agent_version: "2.0.0".into(),
            platform: "linux".into(),
            update_interval: 3.0,
            fan_step_percent: 5,
            hysteresis_temp: 3.0,
            emergency_temp: 85.0,
            failsafe_speed: 70,
            log_level: "INFO".into(),
            capabilities: Capabilities {
                sensors: vec![sample_sensor()],
                fans: vec![sample_fan()],
                fan_control: true,
            },
        },
    };

    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value["type"], "register");
    assert_eq!(value["data"]["agentId"], "linux-bench-1a2b3c4d");
    assert_eq!(value["data"]["platform"], "linux");
    assert_eq!(value["data"]["capabilities"]["fan_control"], true);
    assert_eq!(
        value["data"]["capabilities"]["sensors"][0]["type"],
        "cpu"
    );
    assert_eq!(
        value["data"]["capabilities"]["sensors"][0]["hardwareName"],
        "AMD Ryzen 9 5950X"
    );
    assert_eq!(
        value["data"]["capabilities"]["fans"][0]["targetSpeed"],
        45
    );
}

#[test]
fn data_frame_shape() {
    let frame = AgentFrame::Telemetry {
        data: TelemetryData {
            agent_id: "linux-bench-1a2b3c4d".into(),
            timestamp: 1722500000000,
            sensors: vec![sample_sensor()],
            fans: vec![sample_fan()],
            system_health: SystemHealth {
                cpu_usage: 12.5,
                memory_usage: 41.0,
                agent_uptime: 3600.0,
            },
        },
    };

    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value["type"], "data");
    assert_eq!(value["data"]["agentId"], "linux-bench-1a2b3c4d");
    assert_eq!(value["data"]["timestamp"], 1722500000000i64);
    assert_eq!(value["data"]["systemHealth"]["cpuUsage"], 12.5);
    assert_eq!(value["data"]["systemHealth"]["memoryUsage"], 41.0);
    assert_eq!(value["data"]["systemHealth"]["agentUptime"], 3600.0);
    assert_eq!(value["data"]["fans"][0]["has_pwm_control"], true);
}

#[test]
fn command_frame_parses_from_live_capture() {
    // Shape as emitted by the deployed hub
    let text = r#"{
        "type": "command",
        "data": {
            "commandId": "3f1c9a2e",
            "type": "setFanSpeed",
            "payload": {"fanId": "it8628_fan_1", "speed": 75}
        }
    }"#;
    let frame: HubFrame = serde_json::from_str(text).unwrap();
    let HubFrame::Command { data } = frame else {
        panic!("wrong frame variant");
    };
    assert_eq!(data.command_id, "3f1c9a2e");
    let command = AgentCommand::from_envelope(&data).unwrap();
    assert!(matches!(
        command,
        AgentCommand::SetFanSpeed { ref fan_id, speed: 75 } if fan_id == "it8628_fan_1"
    ));
}

#[test]
fn command_response_shape() {
    let frame = AgentFrame::CommandResponse(CommandResponse {
        command_id: "3f1c9a2e".into(),
        success: true,
        data: json!({"fanId": "it8628_fan_1", "speed": 75}),
        error: None,
        timestamp: 1722500000123,
    });

    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value["type"], "commandResponse");
    assert_eq!(value["commandId"], "3f1c9a2e");
    assert_eq!(value["success"], true);
    assert_eq!(value["data"]["speed"], 75);
    assert_eq!(value["timestamp"], 1722500000123i64);
    assert!(value.get("error").is_none());
}

#[test]
fn registered_frame_parses_with_and_without_configuration() {
    let bare: HubFrame = serde_json::from_str(r#"{"type":"registered"}"#).unwrap();
    assert!(matches!(
        bare,
        HubFrame::Registered { configuration: None, .. }
    ));

    let with_config: HubFrame = serde_json::from_str(
        r#"{"type":"registered","configuration":{"update_interval":5.0,"log_level":"DEBUG"}}"#,
    )
    .unwrap();
    let HubFrame::Registered { configuration: Some(configuration), .. } = with_config else {
        panic!("expected configuration");
    };
    assert_eq!(configuration["update_interval"], 5.0);
}

#[test]
fn ping_pong_shapes() {
    let ping: HubFrame = serde_json::from_str(
        r#"{"type":"ping","timestamp":1722500000000}"#,
    )
    .unwrap();
    assert!(matches!(ping, HubFrame::Ping { timestamp: 1722500000000 }));

    let pong = AgentFrame::Pong { timestamp: 1722500000555 };
    let value = serde_json::to_value(&pong).unwrap();
    assert_eq!(value["type"], "pong");
    assert_eq!(value["timestamp"], 1722500000555i64);
}

#[test]
fn frames_round_trip_through_text() {
    let frames = vec![
        AgentFrame::Pong { timestamp: 1 },
        AgentFrame::CommandResponse(CommandResponse {
            command_id: "c1".into(),
            success: false,
            data: json!({}),
            error: Some("Unknown command type: frobnicate".into()),
            timestamp: 2,
        }),
    ];
    for frame in frames {
        let text = serde_json::to_string(&frame).unwrap();
        let back: AgentFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            serde_json::to_value(&back).unwrap()
        );
    }
}

#[test]
fn duties_are_integers_and_temperatures_one_decimal() {
    let value = serde_json::to_value(sample_fan()).unwrap();
    assert!(value["speed"].is_u64());
    assert!(value["targetSpeed"].is_u64());

    let value = serde_json::to_value(sample_sensor()).unwrap();
    // 52.5 survives exactly; the agent rounds readings to one decimal
    assert_eq!(value["temperature"], 52.5);
}
