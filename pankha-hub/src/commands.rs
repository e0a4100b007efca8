//! Command routing: UI writes become agent commands; the matching
//! `commandResponse` resolves the caller, or a timeout surfaces an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use pankha_protocol::commands::AgentCommand;
use pankha_protocol::frames::{CommandResponse, HubFrame};

use crate::registry::FleetRegistry;

/// Round-trip bound; unresolved commands error out to the issuer.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// More pending commands than this per agent reads as backpressure (429).
pub const MAX_PENDING_PER_AGENT: usize = 32;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("agent {0} is not connected")]
    AgentOffline(String),
    #[error("too many pending commands for agent {0}")]
    Backpressure(String),
    #[error("command timed out after {}s", COMMAND_TIMEOUT.as_secs())]
    Timeout,
    #[error("agent session dropped before responding")]
    SessionDropped,
}

struct Pending {
    agent_id: String,
    resolver: oneshot::Sender<CommandResponse>,
}

pub struct CommandRouter {
    pending: Mutex<HashMap<String, Pending>>,
}

impl CommandRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Send a command on the agent's session and wait for the matching
    /// response.
    pub async fn issue(
        &self,
        registry: &FleetRegistry,
        agent_id: &str,
        command: AgentCommand,
    ) -> Result<CommandResponse, CommandError> {
        let session = registry
            .session(agent_id)
            .await
            .ok_or_else(|| CommandError::AgentOffline(agent_id.to_string()))?;

        let command_id = Uuid::new_v4().to_string();
        let (resolver, resolved) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            let in_flight = pending.values().filter(|p| p.agent_id == agent_id).count();
            if in_flight >= MAX_PENDING_PER_AGENT {
                return Err(CommandError::Backpressure(agent_id.to_string()));
            }
            pending.insert(
                command_id.clone(),
                Pending {
                    agent_id: agent_id.to_string(),
                    resolver,
                },
            );
        }

        let frame = HubFrame::Command {
            data: command.into_envelope(command_id.clone()),
        };
        if session.send(frame).await.is_err() {
            self.pending.lock().await.remove(&command_id);
            return Err(CommandError::AgentOffline(agent_id.to_string()));
        }
        debug!("Issued command {} to agent {}", command_id, agent_id);

        match tokio::time::timeout(COMMAND_TIMEOUT, resolved).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(CommandError::SessionDropped),
            Err(_) => {
                self.pending.lock().await.remove(&command_id);
                warn!("Command {} to agent {} timed out", command_id, agent_id);
                Err(CommandError::Timeout)
            }
        }
    }

    /// Resolve the waiter for an inbound `commandResponse`.
    pub async fn resolve(&self, response: CommandResponse) {
        let Some(pending) = self.pending.lock().await.remove(&response.command_id) else {
            debug!("Response for unknown command {}", response.command_id);
            return;
        };
        let _ = pending.resolver.send(response);
    }

    /// Fail everything still pending for a dropped agent session.
    pub async fn abandon_agent(&self, agent_id: &str) {
        let mut pending = self.pending.lock().await;
        pending.retain(|_, p| p.agent_id != agent_id);
    }
}
