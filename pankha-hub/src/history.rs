//! Short-horizon telemetry history per agent, held in fixed-size ring
//! buffers for the dashboard's live charts. The retention sink owns the
//! long-term record; this is the last few minutes only.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use pankha_protocol::frames::TelemetryData;

/// Default ring capacity: 300 samples (15 min at a 3 s interval).
const DEFAULT_CAPACITY: usize = 300;

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: Vec<T>,
    capacity: usize,
    head: usize,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
            head: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() < self.capacity {
            self.items.push(item);
        } else {
            self.items[self.head] = item;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Oldest-first snapshot.
    pub fn to_vec(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.items.len());
        out.extend_from_slice(&self.items[self.head..]);
        out.extend_from_slice(&self.items[..self.head]);
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TempSample {
    pub timestamp: i64,
    pub temperature: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FanSample {
    pub timestamp: i64,
    pub duty: u8,
    pub rpm: Option<u32>,
}

/// Per-agent histories keyed by sensor/fan id.
#[derive(Debug)]
struct AgentHistory {
    sensors: HashMap<String, RingBuffer<TempSample>>,
    fans: HashMap<String, RingBuffer<FanSample>>,
}

impl AgentHistory {
    fn new() -> Self {
        Self {
            sensors: HashMap::new(),
            fans: HashMap::new(),
        }
    }

    fn ingest(&mut self, telemetry: &TelemetryData, capacity: usize) {
        for sensor in telemetry.sensors.iter().filter(|s| !s.stale) {
            self.sensors
                .entry(sensor.id.clone())
                .or_insert_with(|| RingBuffer::new(capacity))
                .push(TempSample {
                    timestamp: telemetry.timestamp,
                    temperature: sensor.temperature,
                });
        }
        for fan in &telemetry.fans {
            self.fans
                .entry(fan.id.clone())
                .or_insert_with(|| RingBuffer::new(capacity))
                .push(FanSample {
                    timestamp: telemetry.timestamp,
                    duty: fan.speed,
                    rpm: fan.rpm,
                });
        }
    }
}

pub struct HistoryStore {
    agents: RwLock<HashMap<String, AgentHistory>>,
    capacity: usize,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub async fn ingest(&self, telemetry: &TelemetryData) {
        let mut agents = self.agents.write().await;
        agents
            .entry(telemetry.agent_id.clone())
            .or_insert_with(AgentHistory::new)
            .ingest(telemetry, self.capacity);
    }

    /// History survives disconnects; it goes away when the operator removes
    /// the agent.
    pub async fn remove_agent(&self, agent_id: &str) {
        self.agents.write().await.remove(agent_id);
    }

    /// Chart payload for one agent, optionally narrowed to one sensor or
    /// one fan. `None` when the agent has no recorded history.
    pub async fn chart_for(
        &self,
        agent_id: &str,
        sensor_id: Option<&str>,
        fan_id: Option<&str>,
    ) -> Option<Value> {
        let agents = self.agents.read().await;
        let history = agents.get(agent_id)?;

        let sensors: HashMap<&String, Vec<TempSample>> = history
            .sensors
            .iter()
            .filter(|(id, _)| sensor_id.map_or(true, |wanted| wanted == id.as_str()))
            .map(|(id, ring)| (id, ring.to_vec()))
            .collect();
        let fans: HashMap<&String, Vec<FanSample>> = history
            .fans
            .iter()
            .filter(|(id, _)| fan_id.map_or(true, |wanted| wanted == id.as_str()))
            .map(|(id, ring)| (id, ring.to_vec()))
            .collect();

        Some(json!({
            "agentId": agent_id,
            "sensors": sensors,
            "fans": fans,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pankha_protocol::types::{Fan, Sensor, SystemHealth};

    fn telemetry(agent_id: &str, temp: f64, timestamp: i64) -> TelemetryData {
        TelemetryData {
            agent_id: agent_id.into(),
            timestamp,
            sensors: vec![Sensor {
                id: "s1".into(),
                name: "s1".into(),
                temperature: temp,
                sensor_type: "cpu".into(),
                max_temp: None,
                crit_temp: None,
                chip: None,
                hardware_name: None,
                source: None,
                visible: true,
                stale: false,
            }],
            fans: vec![Fan {
                id: "f1".into(),
                name: "f1".into(),
                rpm: Some(900),
                speed: 40,
                target_speed: 40,
                status: "ok".into(),
                has_pwm_control: true,
                pwm_file: None,
                profile_id: None,
                control_sensor: None,
            }],
            system_health: SystemHealth {
                cpu_usage: 0.0,
                memory_usage: 0.0,
                agent_uptime: 0.0,
            },
        }
    }

    #[test]
    fn ring_buffer_wraps_oldest_first() {
        let mut ring = RingBuffer::new(3);
        for i in 1..=5 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.to_vec(), vec![3, 4, 5]);
    }

    #[test]
    fn ring_buffer_under_capacity_keeps_order() {
        let mut ring = RingBuffer::new(10);
        ring.push("a");
        ring.push("b");
        assert_eq!(ring.to_vec(), vec!["a", "b"]);
        assert!(!ring.is_empty());
    }

    #[tokio::test]
    async fn history_accumulates_per_channel() {
        let store = HistoryStore::with_capacity(16);
        store.ingest(&telemetry("a1", 40.0, 1)).await;
        store.ingest(&telemetry("a1", 42.0, 2)).await;

        let chart = store.chart_for("a1", None, None).await.unwrap();
        assert_eq!(chart["sensors"]["s1"].as_array().unwrap().len(), 2);
        assert_eq!(chart["sensors"]["s1"][1]["temperature"], 42.0);
        assert_eq!(chart["fans"]["f1"][0]["duty"], 40);
    }

    #[tokio::test]
    async fn chart_filters_by_channel_id() {
        let store = HistoryStore::with_capacity(16);
        store.ingest(&telemetry("a1", 40.0, 1)).await;

        let chart = store.chart_for("a1", Some("s1"), Some("nope")).await.unwrap();
        assert!(chart["sensors"]["s1"].is_array());
        assert!(chart["fans"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_agent_has_no_chart() {
        let store = HistoryStore::new();
        assert!(store.chart_for("ghost", None, None).await.is_none());
    }

    #[tokio::test]
    async fn capacity_bounds_history() {
        let store = HistoryStore::with_capacity(4);
        for i in 0..10 {
            store.ingest(&telemetry("a1", 40.0 + i as f64, i)).await;
        }
        let chart = store.chart_for("a1", None, None).await.unwrap();
        let samples = chart["sensors"]["s1"].as_array().unwrap();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0]["timestamp"], 6);
        assert_eq!(samples[3]["timestamp"], 9);
    }

    #[tokio::test]
    async fn remove_agent_drops_history() {
        let store = HistoryStore::new();
        store.ingest(&telemetry("a1", 40.0, 1)).await;
        store.remove_agent("a1").await;
        assert!(store.chart_for("a1", None, None).await.is_none());
    }
}
