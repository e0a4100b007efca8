//! Telemetry delta computation. A subscriber broadcast carries only entries
//! that moved past the noise floor: 0.1 °C for temperatures, 1 % for duty,
//! 5 RPM for tachometers.

use serde_json::{json, Value};

use pankha_protocol::frames::TelemetryData;
use pankha_protocol::types::{Fan, Sensor};

const TEMP_EPSILON: f64 = 0.1;
const DUTY_EPSILON: i32 = 1;
const RPM_EPSILON: i64 = 5;

/// Changed fields for one agent since the previous telemetry frame.
#[derive(Debug, Clone, Default)]
pub struct SystemDelta {
    pub sensors: Vec<Value>,
    pub fans: Vec<Value>,
}

impl SystemDelta {
    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty() && self.fans.is_empty()
    }

    pub fn into_payload(self, agent_id: &str, timestamp: i64) -> Value {
        let mut payload = json!({
            "agentId": agent_id,
            "timestamp": timestamp,
        });
        if !self.sensors.is_empty() {
            payload["sensors"] = Value::Array(self.sensors);
        }
        if !self.fans.is_empty() {
            payload["fans"] = Value::Array(self.fans);
        }
        payload
    }
}

/// Diff a fresh telemetry frame against the previous one. `previous` of
/// `None` means everything is new and everything is included.
pub fn compute_delta(previous: Option<&TelemetryData>, current: &TelemetryData) -> SystemDelta {
    let mut delta = SystemDelta::default();

    for sensor in &current.sensors {
        let before = previous.and_then(|p| p.sensors.iter().find(|s| s.id == sensor.id));
        if sensor_changed(before, sensor) {
            delta.sensors.push(sensor_delta(before, sensor));
        }
    }

    for fan in &current.fans {
        let before = previous.and_then(|p| p.fans.iter().find(|f| f.id == fan.id));
        if fan_changed(before, fan) {
            delta.fans.push(fan_delta(fan));
        }
    }

    delta
}

fn sensor_changed(before: Option<&Sensor>, now: &Sensor) -> bool {
    match before {
        None => true,
        Some(before) => {
            (before.temperature - now.temperature).abs() >= TEMP_EPSILON
                || before.visible != now.visible
                || before.stale != now.stale
        }
    }
}

fn fan_changed(before: Option<&Fan>, now: &Fan) -> bool {
    match before {
        None => true,
        Some(before) => {
            (before.speed as i32 - now.speed as i32).abs() >= DUTY_EPSILON
                || (before.target_speed as i32 - now.target_speed as i32).abs() >= DUTY_EPSILON
                || (before.rpm.unwrap_or(0) as i64 - now.rpm.unwrap_or(0) as i64).abs()
                    >= RPM_EPSILON
                || before.status != now.status
        }
    }
}

/// Deltas carry only the fields a dashboard updates live. Visibility and
/// staleness ride along whenever they flipped (or on the first frame).
fn sensor_delta(before: Option<&Sensor>, sensor: &Sensor) -> Value {
    let mut value = json!({
        "id": sensor.id,
        "temperature": sensor.temperature,
    });
    if before.map(|b| b.visible) != Some(sensor.visible) {
        value["visible"] = json!(sensor.visible);
    }
    if before.map(|b| b.stale) != Some(sensor.stale) {
        value["stale"] = json!(sensor.stale);
    }
    value
}

fn fan_delta(fan: &Fan) -> Value {
    json!({
        "id": fan.id,
        "speed": fan.speed,
        "targetSpeed": fan.target_speed,
        "rpm": fan.rpm,
        "status": fan.status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pankha_protocol::types::SystemHealth;

    fn sensor(id: &str, temp: f64) -> Sensor {
        Sensor {
            id: id.into(),
            name: id.into(),
            temperature: temp,
            sensor_type: "cpu".into(),
            max_temp: None,
            crit_temp: None,
            chip: None,
            hardware_name: None,
            source: None,
            visible: true,
            stale: false,
        }
    }

    fn fan(id: &str, speed: u8, rpm: u32) -> Fan {
        Fan {
            id: id.into(),
            name: id.into(),
            rpm: Some(rpm),
            speed,
            target_speed: speed,
            status: "ok".into(),
            has_pwm_control: true,
            pwm_file: None,
            profile_id: None,
            control_sensor: None,
        }
    }

    fn telemetry(sensors: Vec<Sensor>, fans: Vec<Fan>) -> TelemetryData {
        TelemetryData {
            agent_id: "a1".into(),
            timestamp: 1,
            sensors,
            fans,
            system_health: SystemHealth {
                cpu_usage: 0.0,
                memory_usage: 0.0,
                agent_uptime: 0.0,
            },
        }
    }

    #[test]
    fn first_frame_includes_everything() {
        let current = telemetry(vec![sensor("s1", 40.0)], vec![fan("f1", 30, 900)]);
        let delta = compute_delta(None, &current);
        assert_eq!(delta.sensors.len(), 1);
        assert_eq!(delta.fans.len(), 1);
    }

    #[test]
    fn sub_epsilon_changes_are_suppressed() {
        let prev = telemetry(vec![sensor("s1", 40.0)], vec![fan("f1", 30, 900)]);
        let current = telemetry(vec![sensor("s1", 40.05)], vec![fan("f1", 30, 903)]);
        let delta = compute_delta(Some(&prev), &current);
        assert!(delta.is_empty());
    }

    #[test]
    fn past_epsilon_changes_are_included() {
        let prev = telemetry(vec![sensor("s1", 40.0)], vec![fan("f1", 30, 900)]);
        let current = telemetry(vec![sensor("s1", 40.2)], vec![fan("f1", 31, 900)]);
        let delta = compute_delta(Some(&prev), &current);
        assert_eq!(delta.sensors.len(), 1);
        assert_eq!(delta.fans.len(), 1);
        assert_eq!(delta.sensors[0]["temperature"], 40.2);
        assert_eq!(delta.fans[0]["speed"], 31);
    }

    #[test]
    fn rpm_moves_need_five_units() {
        let prev = telemetry(vec![], vec![fan("f1", 30, 900)]);
        let current = telemetry(vec![], vec![fan("f1", 30, 904)]);
        assert!(compute_delta(Some(&prev), &current).is_empty());
        let current = telemetry(vec![], vec![fan("f1", 30, 905)]);
        assert_eq!(compute_delta(Some(&prev), &current).fans.len(), 1);
    }

    #[test]
    fn status_flips_always_broadcast() {
        let prev = telemetry(vec![], vec![fan("f1", 30, 900)]);
        let mut changed = fan("f1", 30, 900);
        changed.status = "error".into();
        let current = telemetry(vec![], vec![changed]);
        assert_eq!(compute_delta(Some(&prev), &current).fans.len(), 1);
    }

    #[test]
    fn payload_shape_carries_agent_id() {
        let current = telemetry(vec![sensor("s1", 40.0)], vec![]);
        let delta = compute_delta(None, &current);
        let payload = delta.into_payload("a1", 123);
        assert_eq!(payload["agentId"], "a1");
        assert_eq!(payload["sensors"][0]["id"], "s1");
        assert!(payload.get("fans").is_none());
    }
}
