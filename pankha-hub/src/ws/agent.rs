//! Agent session task. One task per connected agent; frames from a given
//! agent are processed in arrival order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use pankha_protocol::frames::{AgentFrame, HubFrame};

use crate::state::AppState;

/// Keepalive probe cadence; the agent answers with `pong`.
const PING_INTERVAL: Duration = Duration::from_secs(15);
/// No inbound frame for this long closes the session.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);
/// Malformed frames beyond this within the window close the session.
const MALFORMED_LIMIT: usize = 5;
const MALFORMED_WINDOW: Duration = Duration::from_secs(10);

pub async fn agent_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_agent(socket, state))
}

/// Outer wrapper isolates a panicking session: the task dies, the agent is
/// marked `error`, the dispatcher lives on.
async fn handle_agent(socket: WebSocket, state: Arc<AppState>) {
    let agent_id: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let session = tokio::spawn(session_loop(socket, state.clone(), agent_id.clone()));
    let outcome = session.await;

    let agent_id = agent_id.lock().await.clone();
    match outcome {
        Ok(()) => {
            if let Some(agent_id) = agent_id {
                info!("Agent session ended: {}", agent_id);
                state.commands.abandon_agent(&agent_id).await;
                state.registry.mark_offline(&agent_id).await;
            }
        }
        Err(join_error) => {
            error!("Agent session task failed: {}", join_error);
            if let Some(agent_id) = agent_id {
                state.commands.abandon_agent(&agent_id).await;
                state.registry.mark_error(&agent_id).await;
            }
        }
    }
}

async fn session_loop(
    socket: WebSocket,
    state: Arc<AppState>,
    agent_id_slot: Arc<Mutex<Option<String>>>,
) {
    let (mut sink, mut stream) = socket.split();

    // Single-writer discipline: this task drains the queue, nothing else
    // touches the sink
    let (frame_tx, mut frame_rx) = mpsc::channel::<HubFrame>(64);
    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize hub frame: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut last_inbound = Instant::now();
    let mut malformed: Vec<Instant> = Vec::new();
    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ping_timer.tick() => {
                if last_inbound.elapsed() > LIVENESS_TIMEOUT {
                    let id = agent_id_slot.lock().await.clone();
                    warn!("Agent session liveness expired ({:?})", id);
                    break;
                }
                let ping = HubFrame::Ping { timestamp: pankha_protocol::now_millis() };
                if frame_tx.send(ping).await.is_err() {
                    break;
                }
            }
            message = stream.next() => {
                let Some(message) = message else { break };
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        debug!("Agent socket error: {}", e);
                        break;
                    }
                };
                match message {
                    Message::Text(text) => {
                        last_inbound = Instant::now();
                        if let Err(e) = handle_frame(&text, &state, &agent_id_slot, &frame_tx).await {
                            warn!("Discarding malformed agent frame: {}", e);
                            let now = Instant::now();
                            malformed.retain(|t| now.duration_since(*t) < MALFORMED_WINDOW);
                            malformed.push(now);
                            if malformed.len() >= MALFORMED_LIMIT {
                                error!("Repeated malformed frames, closing agent session");
                                break;
                            }
                        }
                    }
                    Message::Ping(_) | Message::Pong(_) => {
                        last_inbound = Instant::now();
                    }
                    Message::Close(_) => break,
                    _ => last_inbound = Instant::now(),
                }
            }
        }
    }

    writer.abort();
    let _ = writer.await;
}

async fn handle_frame(
    text: &str,
    state: &Arc<AppState>,
    agent_id_slot: &Arc<Mutex<Option<String>>>,
    frame_tx: &mpsc::Sender<HubFrame>,
) -> anyhow::Result<()> {
    let frame: AgentFrame = serde_json::from_str(text)?;
    match frame {
        AgentFrame::Register { data } => {
            let agent_id = data.agent_id.clone();

            if let Some(max) = state.license.max_agents() {
                let known = state.registry.agent_count().await;
                let is_known = state.registry.status_of(&agent_id).await.is_some();
                if !is_known && known >= max {
                    warn!("Agent {} rejected: license cap of {} reached", agent_id, max);
                    let _ = frame_tx.send(HubFrame::Close).await;
                    return Ok(());
                }
            }

            info!("Agent registered: {} ({})", agent_id, data.platform);
            *agent_id_slot.lock().await = Some(agent_id.clone());
            let record = state
                .registry
                .register_agent(data, frame_tx.clone())
                .await;
            let _ = frame_tx
                .send(HubFrame::Registered {
                    agent: Some(record),
                    configuration: None,
                })
                .await;

            // Assignments are hub-owned; a re-registering agent lost its
            // in-memory copy, so push every binding back down
            let bindings = state.registry.fan_bindings(&agent_id).await;
            if !bindings.is_empty() {
                let state = state.clone();
                tokio::spawn(async move {
                    for (fan_id, binding) in bindings {
                        let Some(profile) = state.profiles.get(&binding.profile_id).await else {
                            continue;
                        };
                        let command = pankha_protocol::commands::AgentCommand::SetFanProfile {
                            fan_id: fan_id.clone(),
                            profile_id: profile.id.clone(),
                            points: profile.points.clone(),
                            control_sensor: binding.control_sensor.clone(),
                        };
                        if let Err(e) =
                            state.commands.issue(&state.registry, &agent_id, command).await
                        {
                            warn!(
                                "Failed to re-push profile for {} fan {}: {}",
                                agent_id, fan_id, e
                            );
                            break;
                        }
                    }
                });
            }
        }
        AgentFrame::Telemetry { data } => {
            state.retention.enqueue(&data).await;
            state.history.ingest(&data).await;
            state.registry.ingest_telemetry(data).await;
        }
        AgentFrame::CommandResponse(response) => {
            state.commands.resolve(response).await;
        }
        AgentFrame::Pong { .. } => {
            debug!("Agent keepalive pong");
        }
        AgentFrame::UpdateConfig { data } => {
            debug!("Agent announced local config change: {}", data);
        }
    }
    Ok(())
}
