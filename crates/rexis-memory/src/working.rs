//! Working memory - the live, typed event log of one context
//!
//! Each context owns a [`WorkingMemoryData`] record persisted at
//! `working-memory:<context_id>`. Entries land in one of eight ordered arrays
//! chosen by their `ref` tag. Every mutation is a read-modify-write executed
//! under the context's lock, so concurrent pushes on the same context are
//! strictly ordered and never lose entries.

use crate::episodic::EpisodicMemory;
use crate::error::{RmemError, RmemResult};
use crate::lock::ContextLockManager;
use crate::manager::{apply_pressure, MemoryManager, PressureContext};
use crate::storage::{KeyValueProvider, Metadata, SetOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Current time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn new_entry_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Entry kind; selects the array an entry is appended to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogRef {
    /// User or upstream input
    Input,
    /// Agent output
    Output,
    /// Intermediate reasoning
    Thought,
    /// Action invocation
    ActionCall,
    /// Action outcome
    ActionResult,
    /// Generic event
    Event,
    /// Plan step
    Step,
    /// Run boundary record
    Run,
    /// Unrecognized tag; stored with the events
    Other(String),
}

impl LogRef {
    /// Wire form of the tag
    pub fn as_str(&self) -> &str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Thought => "thought",
            Self::ActionCall => "action_call",
            Self::ActionResult => "action_result",
            Self::Event => "event",
            Self::Step => "step",
            Self::Run => "run",
            Self::Other(tag) => tag,
        }
    }
}

impl From<String> for LogRef {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "input" => Self::Input,
            "output" => Self::Output,
            "thought" => Self::Thought,
            "action_call" => Self::ActionCall,
            "action_result" => Self::ActionResult,
            "event" => Self::Event,
            "step" => Self::Step,
            "run" => Self::Run,
            _ => Self::Other(tag),
        }
    }
}

impl From<&str> for LogRef {
    fn from(tag: &str) -> Self {
        Self::from(tag.to_string())
    }
}

impl From<LogRef> for String {
    fn from(kind: LogRef) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for LogRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One working-memory entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unique entry id
    #[serde(default = "new_entry_id")]
    pub id: String,

    /// Entry kind
    #[serde(rename = "ref")]
    pub kind: LogRef,

    /// Action or event name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Payload (text for inputs/outputs/thoughts, structured otherwise)
    #[serde(default)]
    pub content: Value,

    /// Creation time, ms since epoch
    #[serde(default = "now_millis")]
    pub timestamp: i64,

    /// Error message when the entry records a failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Whether downstream processing consumed the entry
    #[serde(default)]
    pub processed: bool,

    /// Free-form metadata
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl LogEntry {
    /// Create an entry of the given kind
    pub fn new(kind: impl Into<LogRef>, content: impl Into<Value>) -> Self {
        Self {
            id: new_entry_id(),
            kind: kind.into(),
            name: None,
            content: content.into(),
            timestamp: now_millis(),
            error: None,
            processed: false,
            metadata: Metadata::new(),
        }
    }

    /// Input entry
    pub fn input(text: impl Into<String>) -> Self {
        Self::new(LogRef::Input, text.into())
    }

    /// Output entry
    pub fn output(text: impl Into<String>) -> Self {
        Self::new(LogRef::Output, text.into())
    }

    /// Thought entry
    pub fn thought(text: impl Into<String>) -> Self {
        Self::new(LogRef::Thought, text.into())
    }

    /// Action call entry
    pub fn action_call(name: impl Into<String>, arguments: impl Into<Value>) -> Self {
        Self::new(LogRef::ActionCall, arguments).with_name(name)
    }

    /// Action result entry
    pub fn action_result(name: impl Into<String>, result: impl Into<Value>) -> Self {
        Self::new(LogRef::ActionResult, result).with_name(name)
    }

    /// Event entry
    pub fn event(name: impl Into<String>, data: impl Into<Value>) -> Self {
        Self::new(LogRef::Event, data).with_name(name)
    }

    /// Set the name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Record an error
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Override the timestamp
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Content rendered as text
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// The eight ordered arrays of one context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkingMemoryData {
    pub inputs: Vec<LogEntry>,
    pub outputs: Vec<LogEntry>,
    pub thoughts: Vec<LogEntry>,
    pub calls: Vec<LogEntry>,
    pub results: Vec<LogEntry>,
    pub events: Vec<LogEntry>,
    pub steps: Vec<LogEntry>,
    pub runs: Vec<LogEntry>,
}

impl WorkingMemoryData {
    /// Empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Array an entry of `kind` belongs to
    pub fn array(&self, kind: &LogRef) -> &Vec<LogEntry> {
        match kind {
            LogRef::Input => &self.inputs,
            LogRef::Output => &self.outputs,
            LogRef::Thought => &self.thoughts,
            LogRef::ActionCall => &self.calls,
            LogRef::ActionResult => &self.results,
            LogRef::Step => &self.steps,
            LogRef::Run => &self.runs,
            LogRef::Event | LogRef::Other(_) => &self.events,
        }
    }

    /// Mutable array an entry of `kind` belongs to
    pub fn array_mut(&mut self, kind: &LogRef) -> &mut Vec<LogEntry> {
        match kind {
            LogRef::Input => &mut self.inputs,
            LogRef::Output => &mut self.outputs,
            LogRef::Thought => &mut self.thoughts,
            LogRef::ActionCall => &mut self.calls,
            LogRef::ActionResult => &mut self.results,
            LogRef::Step => &mut self.steps,
            LogRef::Run => &mut self.runs,
            LogRef::Event | LogRef::Other(_) => &mut self.events,
        }
    }

    /// Append an entry to its array
    pub fn push(&mut self, entry: LogEntry) {
        self.array_mut(&entry.kind.clone()).push(entry);
    }

    /// Arrays with their names, in a fixed order
    pub fn arrays(&self) -> [(&'static str, &Vec<LogEntry>); 8] {
        [
            ("inputs", &self.inputs),
            ("outputs", &self.outputs),
            ("thoughts", &self.thoughts),
            ("calls", &self.calls),
            ("results", &self.results),
            ("events", &self.events),
            ("steps", &self.steps),
            ("runs", &self.runs),
        ]
    }

    /// Every entry, array by array
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.arrays().into_iter().flat_map(|(_, entries)| entries.iter())
    }

    /// Entry count across all arrays
    pub fn total_entries(&self) -> usize {
        self.arrays().iter().map(|(_, entries)| entries.len()).sum()
    }

    /// Whether every array is empty
    pub fn is_empty(&self) -> bool {
        self.total_entries() == 0
    }

    /// Apply `f` to every array
    pub fn for_each_array_mut(&mut self, mut f: impl FnMut(&'static str, &mut Vec<LogEntry>)) {
        f("inputs", &mut self.inputs);
        f("outputs", &mut self.outputs);
        f("thoughts", &mut self.thoughts);
        f("calls", &mut self.calls);
        f("results", &mut self.results);
        f("events", &mut self.events);
        f("steps", &mut self.steps);
        f("runs", &mut self.runs);
    }

    /// Human-readable entry-count digest
    pub fn summarize(&self) -> String {
        let counts: Vec<String> = self
            .arrays()
            .iter()
            .map(|(name, entries)| format!("{}: {}", name, entries.len()))
            .collect();
        format!("{} (total {})", counts.join(", "), self.total_entries())
    }
}

/// Per-push options
#[derive(Clone, Default)]
pub struct PushOptions {
    /// Eviction policy evaluated after the append
    pub manager: Option<Arc<dyn MemoryManager>>,

    /// Agent performing the push
    pub agent_id: Option<String>,
}

impl PushOptions {
    /// No policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate `manager` after the append
    pub fn with_manager(mut self, manager: Arc<dyn MemoryManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Set the pushing agent
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

impl fmt::Debug for PushOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushOptions")
            .field("manager", &self.manager.as_ref().map(|m| m.name().to_string()))
            .field("agent_id", &self.agent_id)
            .finish()
    }
}

/// Working memory store for all contexts
pub struct WorkingMemory {
    kv: Arc<dyn KeyValueProvider>,
    locks: Arc<ContextLockManager>,
    episodes: Option<Arc<EpisodicMemory>>,
}

impl WorkingMemory {
    /// Create a working memory store
    pub fn new(kv: Arc<dyn KeyValueProvider>, locks: Arc<ContextLockManager>) -> Self {
        Self {
            kv,
            locks,
            episodes: None,
        }
    }

    /// Make episodic memory available to pressure handlers
    pub fn with_episodes(mut self, episodes: Arc<EpisodicMemory>) -> Self {
        self.episodes = Some(episodes);
        self
    }

    /// Storage key of a context's record
    pub fn key(context_id: &str) -> String {
        format!("working-memory:{}", context_id)
    }

    /// Lock key guarding a context's record
    pub fn lock_key(context_id: &str) -> String {
        format!("working:{}", context_id)
    }

    async fn load(&self, context_id: &str) -> RmemResult<Option<WorkingMemoryData>> {
        match self.kv.get(&Self::key(context_id)).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| RmemError::serialization("working_memory_load", e)),
            None => Ok(None),
        }
    }

    async fn store(&self, context_id: &str, data: &WorkingMemoryData) -> RmemResult<()> {
        let value = serde_json::to_value(data)
            .map_err(|e| RmemError::serialization("working_memory_store", e))?;
        self.kv
            .set(&Self::key(context_id), value, SetOptions::new())
            .await
    }

    /// Create the context's record unless it already exists
    pub async fn create(&self, context_id: &str) -> RmemResult<WorkingMemoryData> {
        self.locks
            .with_lock(&Self::lock_key(context_id), || async {
                // Re-check under the lock so racing creators converge
                if let Some(existing) = self.load(context_id).await? {
                    return Ok(existing);
                }

                let data = WorkingMemoryData::new();
                self.store(context_id, &data).await?;
                tracing::debug!(context_id = context_id, "Working memory created");
                Ok(data)
            })
            .await
    }

    /// Read the context's record, creating it on first access
    pub async fn get(&self, context_id: &str) -> RmemResult<WorkingMemoryData> {
        match self.load(context_id).await? {
            Some(data) => Ok(data),
            None => self.create(context_id).await,
        }
    }

    /// Replace the whole record
    pub async fn set(&self, context_id: &str, data: WorkingMemoryData) -> RmemResult<()> {
        self.locks
            .with_lock(&Self::lock_key(context_id), || async {
                self.store(context_id, &data).await
            })
            .await
    }

    /// Append an entry and apply the optional eviction policy, all under the
    /// context's lock. Returns the persisted record.
    pub async fn push(
        &self,
        context_id: &str,
        entry: LogEntry,
        options: PushOptions,
    ) -> RmemResult<WorkingMemoryData> {
        self.locks
            .with_lock(&Self::lock_key(context_id), || async {
                let mut data = self.load(context_id).await?.unwrap_or_default();
                data.push(entry);

                if let Some(manager) = &options.manager {
                    let ctx = PressureContext {
                        context_id: context_id.to_string(),
                        agent_id: options.agent_id.clone(),
                        episodes: self.episodes.clone(),
                    };
                    data = apply_pressure(manager.as_ref(), data, &ctx).await;
                }

                self.store(context_id, &data).await?;
                Ok(data)
            })
            .await
    }

    /// Reset the record to empty
    pub async fn clear(&self, context_id: &str) -> RmemResult<()> {
        self.locks
            .with_lock(&Self::lock_key(context_id), || async {
                self.store(context_id, &WorkingMemoryData::new()).await?;
                tracing::debug!(context_id = context_id, "Working memory cleared");
                Ok(())
            })
            .await
    }

    /// Remove the record entirely
    pub async fn delete(&self, context_id: &str) -> RmemResult<bool> {
        self.locks
            .with_lock(&Self::lock_key(context_id), || async {
                self.kv.delete(&Self::key(context_id)).await
            })
            .await
    }

    /// Entry-count digest of a context
    pub async fn summarize(&self, context_id: &str) -> RmemResult<String> {
        Ok(self.get(context_id).await?.summarize())
    }

    /// Last `n` entries across all arrays, oldest first
    pub async fn get_recent(&self, context_id: &str, n: usize) -> RmemResult<Vec<LogEntry>> {
        let data = self.get(context_id).await?;

        let mut entries: Vec<LogEntry> = data.iter().cloned().collect();
        entries.sort_by_key(|e| e.timestamp);
        let skip = entries.len().saturating_sub(n);

        Ok(entries.into_iter().skip(skip).collect())
    }

    /// Entry count of a context
    pub async fn total_entries(&self, context_id: &str) -> RmemResult<usize> {
        Ok(self.get(context_id).await?.total_entries())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryKvProvider;
    use serde_json::json;

    async fn working() -> WorkingMemory {
        let kv = Arc::new(InMemoryKvProvider::new());
        kv.initialize().await.unwrap();
        WorkingMemory::new(kv, Arc::new(ContextLockManager::new()))
    }

    #[test]
    fn test_ref_tag_selects_array() {
        let mut data = WorkingMemoryData::new();
        data.push(LogEntry::input("hi"));
        data.push(LogEntry::action_call("search", json!({"q": "rust"})));
        data.push(LogEntry::new("something_custom", "x"));
        data.push(LogEntry::new("step", json!({"n": 1})));

        assert_eq!(data.inputs.len(), 1);
        assert_eq!(data.calls.len(), 1);
        assert_eq!(data.events.len(), 1);
        assert_eq!(data.steps.len(), 1);
        assert_eq!(data.total_entries(), 4);
    }

    #[test]
    fn test_entry_serializes_ref_tag() {
        let entry = LogEntry::action_result("search", json!(["a"])).with_error("timeout");
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["ref"], json!("action_result"));
        assert_eq!(value["name"], json!("search"));

        let parsed: LogEntry = serde_json::from_value(json!({"ref": "mystery", "content": 3})).unwrap();
        assert_eq!(parsed.kind, LogRef::Other("mystery".to_string()));
        assert!(!parsed.id.is_empty());
    }

    #[tokio::test]
    async fn test_get_creates_and_push_appends() {
        let working = working().await;

        let data = working.get("ctx").await.unwrap();
        assert!(data.is_empty());

        working
            .push("ctx", LogEntry::input("hello"), PushOptions::new())
            .await
            .unwrap();
        working
            .push("ctx", LogEntry::output("hi there"), PushOptions::new())
            .await
            .unwrap();

        let data = working.get("ctx").await.unwrap();
        assert_eq!(data.inputs[0].text(), "hello");
        assert_eq!(data.outputs[0].text(), "hi there");
        assert_eq!(working.total_entries("ctx").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_set_clear_and_summarize() {
        let working = working().await;

        let mut data = WorkingMemoryData::new();
        data.push(LogEntry::thought("consider options"));
        data.push(LogEntry::input("q"));
        working.set("ctx", data).await.unwrap();

        let summary = working.summarize("ctx").await.unwrap();
        assert!(summary.contains("inputs: 1"));
        assert!(summary.contains("thoughts: 1"));
        assert!(summary.ends_with("(total 2)"));

        working.clear("ctx").await.unwrap();
        assert_eq!(working.total_entries("ctx").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_recent_orders_by_timestamp() {
        let working = working().await;

        for (i, entry) in [
            LogEntry::input("first"),
            LogEntry::thought("second"),
            LogEntry::output("third"),
        ]
        .into_iter()
        .enumerate()
        {
            working
                .push("ctx", entry.with_timestamp(1_000 + i as i64), PushOptions::new())
                .await
                .unwrap();
        }

        let recent = working.get_recent("ctx", 2).await.unwrap();
        let texts: Vec<String> = recent.iter().map(|e| e.text()).collect();
        assert_eq!(texts, vec!["second", "third"]);
    }
}
