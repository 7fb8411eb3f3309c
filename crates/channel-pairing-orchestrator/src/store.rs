//! Record-store boundary used to resolve agents and persist the connected flag.

use crate::error::{PairingError, PairingResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// The slice of an agent record the orchestrator needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub connected: bool,
}

/// Agent persistence owned by the host application.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn get_agent(&self, agent_id: i64) -> PairingResult<Option<AgentRecord>>;

    async fn set_connected(&self, agent_id: i64, connected: bool) -> PairingResult<()>;
}

/// Process-local store, used by the CLI and in tests.
#[derive(Debug, Default)]
pub struct InMemoryAgentStore {
    agents: Mutex<HashMap<i64, AgentRecord>>,
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an agent and return its id.
    pub fn insert(&self, name: impl Into<String>) -> i64 {
        let mut agents = lock(&self.agents);
        let id = agents.keys().max().copied().unwrap_or(0) + 1;
        agents.insert(
            id,
            AgentRecord {
                id,
                name: name.into(),
                connected: false,
            },
        );
        id
    }

    pub fn get(&self, agent_id: i64) -> Option<AgentRecord> {
        lock(&self.agents).get(&agent_id).cloned()
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn get_agent(&self, agent_id: i64) -> PairingResult<Option<AgentRecord>> {
        Ok(self.get(agent_id))
    }

    async fn set_connected(&self, agent_id: i64, connected: bool) -> PairingResult<()> {
        let mut agents = lock(&self.agents);
        let agent = agents
            .get_mut(&agent_id)
            .ok_or(PairingError::AgentNotFound(agent_id))?;
        agent.connected = connected;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
