//! Context store - persisted context snapshots and their domain memory
//!
//! A context snapshot lives at `context:<id>`, the free-form domain memory
//! associated with it at `memory:<id>`, and every known id is kept in the
//! global `contexts` index.

use crate::episodic::EpisodicMemory;
use crate::error::{RmemError, RmemResult};
use crate::lock::ContextLockManager;
use crate::storage::{KeyValueProvider, Metadata, SetOptions};
use crate::working::WorkingMemory;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

const INDEX_KEY: &str = "contexts";

/// Persisted state of one context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Context id
    pub id: String,

    /// Owning agent, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    /// Caller-defined state
    #[serde(default)]
    pub state: Value,

    /// Optional metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// When the context was first saved
    pub created_at: chrono::DateTime<chrono::Utc>,

    /// When the context was last saved
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl ContextSnapshot {
    /// Create a snapshot
    pub fn new(id: impl Into<String>, state: impl Into<Value>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: id.into(),
            agent_id: None,
            state: state.into(),
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the owning agent
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Context snapshots plus the global context index
pub struct ContextStore {
    kv: Arc<dyn KeyValueProvider>,
    locks: Arc<ContextLockManager>,
    working: Arc<WorkingMemory>,
    episodes: Arc<EpisodicMemory>,
}

impl ContextStore {
    /// Create a context store
    pub fn new(
        kv: Arc<dyn KeyValueProvider>,
        locks: Arc<ContextLockManager>,
        working: Arc<WorkingMemory>,
        episodes: Arc<EpisodicMemory>,
    ) -> Self {
        Self {
            kv,
            locks,
            working,
            episodes,
        }
    }

    /// Snapshot key
    pub fn context_key(id: &str) -> String {
        format!("context:{}", id)
    }

    /// Domain memory key
    pub fn memory_key(id: &str) -> String {
        format!("memory:{}", id)
    }

    async fn read_index(&self) -> RmemResult<Vec<String>> {
        match self.kv.get(INDEX_KEY).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| RmemError::serialization("context_index_read", e)),
            None => Ok(Vec::new()),
        }
    }

    async fn update_index(&self, f: impl FnOnce(&mut Vec<String>)) -> RmemResult<()> {
        self.locks
            .with_lock(INDEX_KEY, || async {
                let mut ids = self.read_index().await?;
                f(&mut ids);
                self.kv.set(INDEX_KEY, json!(ids), SetOptions::new()).await
            })
            .await
    }

    /// Save a snapshot, keeping the original creation time
    pub async fn save(&self, mut snapshot: ContextSnapshot) -> RmemResult<ContextSnapshot> {
        if snapshot.id.is_empty() {
            return Err(RmemError::validation("id", "must not be empty", "\"\""));
        }

        if let Some(existing) = self.get(&snapshot.id).await? {
            snapshot.created_at = existing.created_at;
        }
        snapshot.updated_at = chrono::Utc::now();

        let value = serde_json::to_value(&snapshot)
            .map_err(|e| RmemError::serialization("context_save", e))?;
        self.kv
            .set(&Self::context_key(&snapshot.id), value, SetOptions::new())
            .await?;

        let id = snapshot.id.clone();
        self.update_index(|ids| {
            if !ids.contains(&id) {
                ids.push(id);
            }
        })
        .await?;

        tracing::debug!(context_id = %snapshot.id, "Context saved");
        Ok(snapshot)
    }

    /// Read a snapshot
    pub async fn get(&self, id: &str) -> RmemResult<Option<ContextSnapshot>> {
        match self.kv.get(&Self::context_key(id)).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| RmemError::serialization("context_get", e)),
            None => Ok(None),
        }
    }

    /// Ids of every saved context, in save order
    pub async fn list(&self) -> RmemResult<Vec<String>> {
        self.read_index().await
    }

    /// Store the domain memory of a context
    pub async fn save_memory(&self, id: &str, memory: Value) -> RmemResult<()> {
        self.kv
            .set(&Self::memory_key(id), memory, SetOptions::new())
            .await
    }

    /// Read the domain memory of a context
    pub async fn get_memory(&self, id: &str) -> RmemResult<Option<Value>> {
        self.kv.get(&Self::memory_key(id)).await
    }

    /// Remove a context with its domain memory, working memory and episodes
    pub async fn delete(&self, id: &str) -> RmemResult<bool> {
        let existed = self.kv.delete(&Self::context_key(id)).await?;
        self.kv.delete(&Self::memory_key(id)).await?;
        self.update_index(|ids| ids.retain(|known| known != id)).await?;

        self.working.delete(id).await?;
        let episodes = self.episodes.delete_context(id).await?;

        tracing::info!(context_id = id, episodes = episodes, "Context deleted");
        Ok(existed)
    }
}
