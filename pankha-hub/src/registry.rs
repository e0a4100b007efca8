//! Fleet registry: the hub's in-memory view of every agent, plus the UI
//! subscriber fan-out with per-subscriber backpressure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use pankha_protocol::frames::{HubFrame, RegisterData, TelemetryData, UiFrame};

use crate::delta::compute_delta;

/// Outgoing queue depth per UI subscriber. The first overflow switches the
/// subscriber to coalesced deltas; the second disconnects it.
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
    Updating,
    Error,
}

pub struct AgentEntry {
    pub register: RegisterData,
    pub last_telemetry: Option<TelemetryData>,
    pub status: AgentStatus,
    pub last_seen: i64,
    /// Writer queue of the live agent session; `None` while offline.
    pub session: Option<mpsc::Sender<HubFrame>>,
    /// Authoritative profile binding per fan, pushed down on change.
    pub fan_bindings: HashMap<String, FanBinding>,
    /// Version we expect the agent to report after a commanded update.
    pub expected_version: Option<String>,
    pub updating_since: Option<Instant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FanBinding {
    #[serde(rename = "profileId")]
    pub profile_id: String,
    #[serde(rename = "controlSensor")]
    pub control_sensor: String,
}

struct Subscriber {
    tx: mpsc::Sender<UiFrame>,
    /// Pending per-agent delta payloads, latest value per entity.
    coalesced: HashMap<String, Value>,
    overflows: u8,
}

pub struct FleetRegistry {
    agents: RwLock<HashMap<String, AgentEntry>>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_subscriber_id: AtomicU64,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Idempotent on agent id: a re-register replaces the session handle and
    /// updates the snapshot without duplicating the entry.
    pub async fn register_agent(
        &self,
        data: RegisterData,
        session: mpsc::Sender<HubFrame>,
    ) -> Value {
        let agent_id = data.agent_id.clone();
        let mut agents = self.agents.write().await;

        let reported_version = data.agent_version.clone();
        let entry = agents.entry(agent_id.clone()).or_insert_with(|| AgentEntry {
            register: data.clone(),
            last_telemetry: None,
            status: AgentStatus::Online,
            last_seen: pankha_protocol::now_millis(),
            session: None,
            fan_bindings: HashMap::new(),
            expected_version: None,
            updating_since: None,
        });

        entry.register = data;
        entry.session = Some(session);
        entry.last_seen = pankha_protocol::now_millis();

        // An in-flight update resolves when the expected version shows up
        if let Some(expected) = entry.expected_version.clone() {
            if reported_version.trim_start_matches('v') == expected.trim_start_matches('v') {
                info!("Agent {} came back on expected version {}", agent_id, expected);
                entry.expected_version = None;
                entry.updating_since = None;
            } else {
                warn!(
                    "Agent {} re-registered on {} while update to {} pending",
                    agent_id, reported_version, expected
                );
            }
        }
        entry.status = AgentStatus::Online;

        let record = agent_record(&agent_id, entry);
        drop(agents);

        self.broadcast(UiFrame::AgentRegistered { data: record.clone() })
            .await;
        record
    }

    /// Ingest one telemetry frame: update the cached projection and return
    /// the delta to broadcast (empty deltas are not emitted).
    pub async fn ingest_telemetry(&self, data: TelemetryData) {
        let mut agents = self.agents.write().await;
        let Some(entry) = agents.get_mut(&data.agent_id) else {
            debug!("Telemetry from unregistered agent {}", data.agent_id);
            return;
        };

        let delta = compute_delta(entry.last_telemetry.as_ref(), &data);
        entry.last_seen = pankha_protocol::now_millis();
        entry.last_telemetry = Some(data.clone());
        drop(agents);

        if !delta.is_empty() {
            let payload = delta.into_payload(&data.agent_id, data.timestamp);
            self.broadcast(UiFrame::SystemDelta { data: payload }).await;
        }
    }

    /// The cached projection expires on disconnect; only identity and the
    /// last register snapshot survive.
    pub async fn mark_offline(&self, agent_id: &str) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.session = None;
            entry.last_telemetry = None;
            // An updating agent is expected to drop; keep that status
            if entry.status != AgentStatus::Updating {
                entry.status = AgentStatus::Offline;
            }
        }
        drop(agents);

        self.broadcast(UiFrame::AgentOffline {
            data: json!({"agentId": agent_id}),
        })
        .await;
    }

    pub async fn mark_error(&self, agent_id: &str) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.status = AgentStatus::Error;
            entry.session = None;
        }
    }

    /// The agent refused or aborted the update while still connected.
    pub async fn clear_updating(&self, agent_id: &str) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            if entry.status == AgentStatus::Updating {
                entry.status = if entry.session.is_some() {
                    AgentStatus::Online
                } else {
                    AgentStatus::Offline
                };
            }
            entry.expected_version = None;
            entry.updating_since = None;
        }
    }

    pub async fn mark_updating(&self, agent_id: &str, expected_version: Option<String>) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.status = AgentStatus::Updating;
            entry.expected_version = expected_version;
            entry.updating_since = Some(Instant::now());
        }
    }

    /// Declare agents stuck in `updating` as errored after the bound.
    pub async fn sweep_stale_updates(&self, timeout: std::time::Duration) {
        let mut agents = self.agents.write().await;
        for (agent_id, entry) in agents.iter_mut() {
            if entry.status == AgentStatus::Updating {
                if let Some(since) = entry.updating_since {
                    if since.elapsed() > timeout {
                        warn!("Agent {} update timed out, marking error", agent_id);
                        entry.status = AgentStatus::Error;
                        entry.expected_version = None;
                        entry.updating_since = None;
                    }
                }
            }
        }
    }

    pub async fn fan_bindings(&self, agent_id: &str) -> Vec<(String, FanBinding)> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .map(|entry| {
                entry
                    .fan_bindings
                    .iter()
                    .map(|(fan_id, binding)| (fan_id.clone(), binding.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn set_fan_binding(&self, agent_id: &str, fan_id: &str, binding: FanBinding) -> bool {
        let mut agents = self.agents.write().await;
        match agents.get_mut(agent_id) {
            Some(entry) => {
                entry.fan_bindings.insert(fan_id.to_string(), binding);
                true
            }
            None => false,
        }
    }

    pub async fn session(&self, agent_id: &str) -> Option<mpsc::Sender<HubFrame>> {
        self.agents.read().await.get(agent_id)?.session.clone()
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn status_of(&self, agent_id: &str) -> Option<AgentStatus> {
        self.agents.read().await.get(agent_id).map(|e| e.status)
    }

    /// Single-agent record for `GET /api/systems/:id`.
    pub async fn agent_snapshot(&self, agent_id: &str) -> Option<Value> {
        let agents = self.agents.read().await;
        agents
            .get(agent_id)
            .map(|entry| agent_record(agent_id, entry))
    }

    /// Full fleet snapshot for `fullState` and `GET /api/systems`.
    pub async fn snapshot(&self) -> Value {
        let agents = self.agents.read().await;
        let mut systems: Vec<Value> = agents
            .iter()
            .map(|(agent_id, entry)| agent_record(agent_id, entry))
            .collect();
        systems.sort_by_key(|v| v["agentId"].as_str().unwrap_or_default().to_string());
        json!({ "systems": systems })
    }

    /// Attach a UI subscriber. The caller first sends `fullState` on the
    /// returned receiver's channel, then forwards broadcasts.
    pub async fn subscribe(&self) -> (u64, mpsc::Receiver<UiFrame>) {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        self.subscribers.lock().await.insert(
            id,
            Subscriber {
                tx,
                coalesced: HashMap::new(),
                overflows: 0,
            },
        );
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().await.remove(&id);
    }

    /// Fan a frame out to every subscriber. A full queue coalesces deltas
    /// (latest value per entity); a second overflow drops the subscriber,
    /// whose reader then closes with a recoverable code.
    pub async fn broadcast(&self, frame: UiFrame) {
        let mut dead: Vec<u64> = Vec::new();
        let mut subscribers = self.subscribers.lock().await;

        for (id, subscriber) in subscribers.iter_mut() {
            // Flush anything coalesced earlier, oldest agent first
            if !subscriber.coalesced.is_empty() {
                let pending: Vec<(String, Value)> = subscriber.coalesced.drain().collect();
                for (agent_id, payload) in pending {
                    if let Err(mpsc::error::TrySendError::Full(UiFrame::SystemDelta { data })) =
                        subscriber
                            .tx
                            .try_send(UiFrame::SystemDelta { data: payload })
                    {
                        subscriber.coalesced.insert(agent_id, data);
                    }
                }
            }

            match subscriber.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    subscriber.overflows = subscriber.overflows.saturating_add(1);
                    if subscriber.overflows >= 2 {
                        warn!("Subscriber {} overflowed twice, disconnecting", id);
                        dead.push(*id);
                        continue;
                    }
                    if let UiFrame::SystemDelta { data } = frame {
                        let agent_id = data["agentId"].as_str().unwrap_or_default().to_string();
                        match subscriber.coalesced.remove(&agent_id) {
                            Some(existing) => {
                                subscriber
                                    .coalesced
                                    .insert(agent_id, merge_deltas(existing, data));
                            }
                            None => {
                                subscriber.coalesced.insert(agent_id, data);
                            }
                        }
                    }
                    // Lifecycle frames are small and rare; losing one to an
                    // already-overflowing subscriber is acceptable
                }
            }
        }

        for id in dead {
            subscribers.remove(&id);
        }
    }
}

/// Collapse two delta payloads for the same agent, keeping the latest value
/// per sensor/fan id.
fn merge_deltas(older: Value, newer: Value) -> Value {
    let mut merged = older;
    for key in ["sensors", "fans"] {
        let newer_items = newer[key].as_array().cloned().unwrap_or_default();
        if newer_items.is_empty() {
            continue;
        }
        let mut items = merged[key].as_array().cloned().unwrap_or_default();
        for new_item in newer_items {
            let id = new_item["id"].as_str().unwrap_or_default().to_string();
            items.retain(|existing| existing["id"].as_str() != Some(id.as_str()));
            items.push(new_item);
        }
        merged[key] = Value::Array(items);
    }
    if let Some(ts) = newer.get("timestamp") {
        merged["timestamp"] = ts.clone();
    }
    merged
}

fn agent_record(agent_id: &str, entry: &AgentEntry) -> Value {
    json!({
        "agentId": agent_id,
        "name": entry.register.name,
        "platform": entry.register.platform,
        "agentVersion": entry.register.agent_version,
        "status": entry.status,
        "lastSeen": entry.last_seen,
        "updateInterval": entry.register.update_interval,
        "fanControl": entry.register.capabilities.fan_control,
        "sensors": entry
            .last_telemetry
            .as_ref()
            .map(|t| &t.sensors)
            .unwrap_or(&entry.register.capabilities.sensors),
        "fans": entry
            .last_telemetry
            .as_ref()
            .map(|t| &t.fans)
            .unwrap_or(&entry.register.capabilities.fans),
        "fanBindings": entry.fan_bindings,
        "systemHealth": entry.last_telemetry.as_ref().map(|t| &t.system_health),
    })
}
