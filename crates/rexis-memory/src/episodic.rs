//! Episodic memory - bounded, summarized slices of a context's history
//!
//! Entries observed for a context are accumulated into an episode between a
//! start and an end boundary (see [`EpisodeHooks`]). A finished episode is
//! stored in three places that always change together:
//!
//! - the record at `episode:<id>` in key-value storage
//! - its summary (and optionally one document per log line) in the vector
//!   namespace `episodes:<context_id>`
//! - the per-context id list at `episodes:context:<context_id>`, capped at
//!   `max_episodes_per_context` with the oldest evicted first

use crate::compression::Summarizer;
use crate::config::EpisodicSettings;
use crate::error::{RmemError, RmemResult};
use crate::lock::ContextLockManager;
use crate::storage::{
    KeyValueProvider, Metadata, SetOptions, VectorDocument, VectorProvider, VectorQuery,
};
use crate::working::{now_millis, LogEntry, LogRef};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// What an episode covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeType {
    /// Input/output exchange
    #[default]
    Conversation,
    /// Exchange that invoked actions
    Action,
    /// Caller-defined unit of work
    Task,
    /// Merged or archived history
    Compression,
}

impl EpisodeType {
    /// Wire form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Action => "action",
            Self::Task => "task",
            Self::Compression => "compression",
        }
    }
}

/// A stored episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// Unique identifier
    pub id: String,

    /// Owning context
    pub context_id: String,

    /// Kind of episode
    #[serde(rename = "type")]
    pub episode_type: EpisodeType,

    /// Summary text (what gets indexed)
    pub summary: String,

    /// The covered entries, in order; immutable once stored
    #[serde(default)]
    pub logs: Vec<LogEntry>,

    /// Optional metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// Importance score (0.0 to 1.0)
    pub importance: f64,

    /// First covered timestamp, ms
    pub start_time: i64,

    /// Last covered timestamp, ms
    pub end_time: i64,

    /// `end_time - start_time`
    pub duration_ms: i64,
}

impl Episode {
    /// Create an episode spanning its logs' timestamps (now when empty)
    pub fn new(
        context_id: impl Into<String>,
        episode_type: EpisodeType,
        summary: impl Into<String>,
        logs: Vec<LogEntry>,
    ) -> Self {
        let now = now_millis();
        let start_time = logs.iter().map(|l| l.timestamp).min().unwrap_or(now);
        let end_time = logs.iter().map(|l| l.timestamp).max().unwrap_or(now);

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            context_id: context_id.into(),
            episode_type,
            summary: summary.into(),
            logs,
            metadata: Metadata::new(),
            importance: 0.5,
            start_time,
            end_time,
            duration_ms: end_time - start_time,
        }
    }

    /// Use an explicit id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set importance
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Override the time span
    pub fn with_span(mut self, start_time: i64, end_time: i64) -> Self {
        self.start_time = start_time;
        self.end_time = end_time.max(start_time);
        self.duration_ms = self.end_time - self.start_time;
        self
    }
}

/// Episode search hit
#[derive(Debug, Clone)]
pub struct EpisodeMatch {
    pub episode: Episode,
    pub score: f32,
}

/// Episode boundary predicates
pub trait EpisodeHooks: Send + Sync {
    /// Whether `entry` opens an episode while the context is idle
    fn should_start_episode(&self, entry: &LogEntry, last_episode_end: Option<i64>) -> bool;

    /// Whether `entry` closes the episode accumulated so far
    fn should_end_episode(&self, entry: &LogEntry, buffer: &[LogEntry]) -> bool;
}

/// Start on an input after a minimum gap; end on an output or action result
#[derive(Debug, Clone)]
pub struct DefaultEpisodeHooks {
    pub min_gap_ms: i64,
}

impl DefaultEpisodeHooks {
    /// Hooks with the given minimum gap between episodes
    pub fn new(min_gap_secs: u64) -> Self {
        Self {
            min_gap_ms: (min_gap_secs as i64).saturating_mul(1000),
        }
    }
}

impl Default for DefaultEpisodeHooks {
    fn default() -> Self {
        Self::new(300)
    }
}

impl EpisodeHooks for DefaultEpisodeHooks {
    fn should_start_episode(&self, entry: &LogEntry, last_episode_end: Option<i64>) -> bool {
        entry.kind == LogRef::Input
            && last_episode_end
                .map(|end| entry.timestamp - end >= self.min_gap_ms)
                .unwrap_or(true)
    }

    fn should_end_episode(&self, entry: &LogEntry, buffer: &[LogEntry]) -> bool {
        !buffer.is_empty() && matches!(entry.kind, LogRef::Output | LogRef::ActionResult)
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    buffer: Vec<LogEntry>,
    last_episode_end: Option<i64>,
}

/// Episodic memory for all contexts
pub struct EpisodicMemory {
    kv: Arc<dyn KeyValueProvider>,
    vector: Arc<dyn VectorProvider>,
    locks: Arc<ContextLockManager>,
    settings: EpisodicSettings,
    hooks: Arc<dyn EpisodeHooks>,
    summarizer: Summarizer,
    accumulators: DashMap<String, Accumulator>,
}

impl EpisodicMemory {
    /// Create episodic memory with default hooks derived from `settings`
    pub fn new(
        kv: Arc<dyn KeyValueProvider>,
        vector: Arc<dyn VectorProvider>,
        locks: Arc<ContextLockManager>,
        settings: EpisodicSettings,
    ) -> Self {
        let hooks = Arc::new(DefaultEpisodeHooks::new(settings.min_episode_gap_secs));
        Self {
            kv,
            vector,
            locks,
            settings,
            hooks,
            summarizer: Summarizer::deterministic(),
            accumulators: DashMap::new(),
        }
    }

    /// Replace the boundary predicates
    pub fn with_hooks(mut self, hooks: Arc<dyn EpisodeHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Summarizer used by [`EpisodicMemory::compress`]
    pub fn with_summarizer(mut self, summarizer: Summarizer) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Record key
    pub fn episode_key(id: &str) -> String {
        format!("episode:{}", id)
    }

    /// Per-context id list key
    pub fn context_list_key(context_id: &str) -> String {
        format!("episodes:context:{}", context_id)
    }

    /// Vector namespace of a context's episodes
    pub fn namespace(context_id: &str) -> String {
        format!("episodes:{}", context_id)
    }

    fn vector_ids(episode_id: &str, log_count: usize) -> Vec<String> {
        std::iter::once(episode_id.to_string())
            .chain((0..log_count).map(|i| format!("{}:log:{}", episode_id, i)))
            .collect()
    }

    /// Feed one entry into the context's boundary state machine.
    ///
    /// Returns the episode when `entry` closed one; it has already been stored.
    pub async fn observe(&self, context_id: &str, entry: LogEntry) -> RmemResult<Option<Episode>> {
        let finished = {
            let mut acc = self.accumulators.entry(context_id.to_string()).or_default();

            if acc.buffer.is_empty() {
                if self.hooks.should_start_episode(&entry, acc.last_episode_end) {
                    acc.buffer.push(entry);
                }
                None
            } else if self.hooks.should_end_episode(&entry, &acc.buffer) {
                acc.last_episode_end = Some(entry.timestamp);
                let mut logs = std::mem::take(&mut acc.buffer);
                logs.push(entry);
                Some(logs)
            } else {
                acc.buffer.push(entry);
                None
            }
        };

        let Some(logs) = finished else {
            return Ok(None);
        };

        let episode = self.create_from_logs(context_id, logs);
        self.store(episode.clone()).await?;
        Ok(Some(episode))
    }

    /// Entries accumulated for a context's open episode
    pub fn pending(&self, context_id: &str) -> usize {
        self.accumulators
            .get(context_id)
            .map(|acc| acc.buffer.len())
            .unwrap_or(0)
    }

    /// Build (without storing) an episode from raw entries.
    ///
    /// The summary concatenates the first input, the action names and the
    /// last output.
    pub fn create_from_logs(&self, context_id: &str, logs: Vec<LogEntry>) -> Episode {
        let first_input = logs.iter().find(|l| l.kind == LogRef::Input).map(|l| l.text());
        let last_output = logs.iter().rev().find(|l| l.kind == LogRef::Output).map(|l| l.text());

        let mut actions: Vec<String> = Vec::new();
        for log in logs
            .iter()
            .filter(|l| matches!(l.kind, LogRef::ActionCall | LogRef::ActionResult))
        {
            if let Some(name) = &log.name {
                if !actions.contains(name) {
                    actions.push(name.clone());
                }
            }
        }

        let mut parts = Vec::new();
        if let Some(input) = first_input {
            parts.push(format!("Input: {}", input));
        }
        if !actions.is_empty() {
            parts.push(format!("Actions: {}", actions.join(", ")));
        }
        if let Some(output) = last_output {
            parts.push(format!("Output: {}", output));
        }
        let summary = if parts.is_empty() {
            format!("Episode with {} entries", logs.len())
        } else {
            parts.join(" | ")
        };

        let episode_type = if actions.is_empty() {
            EpisodeType::Conversation
        } else {
            EpisodeType::Action
        };
        let importance = if logs.iter().any(|l| l.error.is_some()) {
            0.7
        } else {
            0.5
        };

        Episode::new(context_id, episode_type, summary, logs).with_importance(importance)
    }

    /// Persist an episode: record, vector documents and capped context list
    pub async fn store(&self, episode: Episode) -> RmemResult<()> {
        let value = serde_json::to_value(&episode)
            .map_err(|e| RmemError::serialization("episode_store", e))?;
        self.kv
            .set(&Self::episode_key(&episode.id), value, SetOptions::new())
            .await?;

        let namespace = Self::namespace(&episode.context_id);
        let mut documents = vec![VectorDocument::new(&episode.id, &episode.summary)
            .with_namespace(&namespace)
            .with_metadata("type", "episode")
            .with_metadata("episodeId", episode.id.as_str())
            .with_metadata("contextId", episode.context_id.as_str())
            .with_metadata("episodeType", episode.episode_type.as_str())
            .with_metadata("importance", episode.importance)
            .with_metadata("timestamp", episode.end_time)];

        if self.settings.index_logs {
            for (i, log) in episode.logs.iter().enumerate() {
                let text = log.text();
                if text.is_empty() {
                    continue;
                }
                documents.push(
                    VectorDocument::new(format!("{}:log:{}", episode.id, i), text)
                        .with_namespace(&namespace)
                        .with_metadata("type", "episode_log")
                        .with_metadata("episodeId", episode.id.as_str())
                        .with_metadata("contextId", episode.context_id.as_str())
                        .with_metadata("role", log.kind.as_str())
                        .with_metadata("timestamp", log.timestamp),
                );
            }
        }
        if let Err(e) = self.vector.index(documents).await {
            self.discard(&episode).await;
            return Err(e);
        }

        // The list entry goes last: an episode missing from it could never be evicted
        let evicted = match self.append_to_context(&episode.context_id, &episode.id).await {
            Ok(evicted) => evicted,
            Err(e) => {
                self.discard(&episode).await;
                return Err(e);
            }
        };

        tracing::debug!(
            context_id = %episode.context_id,
            episode_id = %episode.id,
            evicted = evicted,
            "Episode stored"
        );

        Ok(())
    }

    /// Undo a store that failed part way; the caller still sees the original error
    async fn discard(&self, episode: &Episode) {
        let namespace = Self::namespace(&episode.context_id);
        let ids = Self::vector_ids(&episode.id, episode.logs.len());
        if let Err(e) = self.vector.delete(&ids, Some(&namespace)).await {
            tracing::warn!(episode_id = %episode.id, error = %e, "Could not drop episode documents");
        }
        if let Err(e) = self.kv.delete(&Self::episode_key(&episode.id)).await {
            tracing::warn!(episode_id = %episode.id, error = %e, "Could not drop episode record");
        }
    }

    /// Append to the context list under its lock, evicting past the cap
    async fn append_to_context(&self, context_id: &str, episode_id: &str) -> RmemResult<usize> {
        let list_key = Self::context_list_key(context_id);

        self.locks
            .with_lock(&list_key, || async {
                let mut ids = self.read_list(context_id).await?;
                ids.retain(|id| id != episode_id);
                ids.push(episode_id.to_string());

                let excess = ids.len().saturating_sub(self.settings.max_episodes_per_context);
                let evicted: Vec<String> = ids.drain(..excess).collect();
                for id in &evicted {
                    self.remove_record(context_id, id).await?;
                }

                self.kv
                    .set(&list_key, json!(ids), SetOptions::new())
                    .await?;

                if !evicted.is_empty() {
                    tracing::info!(
                        context_id = context_id,
                        evicted = evicted.len(),
                        "Evicted oldest episodes"
                    );
                }

                Ok(evicted.len())
            })
            .await
    }

    async fn read_list(&self, context_id: &str) -> RmemResult<Vec<String>> {
        match self.kv.get(&Self::context_list_key(context_id)).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| RmemError::serialization("episode_list_read", e)),
            None => Ok(Vec::new()),
        }
    }

    /// Delete the record and its vector documents (not the list entry)
    async fn remove_record(&self, context_id: &str, episode_id: &str) -> RmemResult<bool> {
        let log_count = self.get(episode_id).await?.map(|e| e.logs.len()).unwrap_or(0);

        let namespace = Self::namespace(context_id);
        self.vector
            .delete(&Self::vector_ids(episode_id, log_count), Some(&namespace))
            .await?;

        self.kv.delete(&Self::episode_key(episode_id)).await
    }

    /// Read an episode record
    pub async fn get(&self, episode_id: &str) -> RmemResult<Option<Episode>> {
        match self.kv.get(&Self::episode_key(episode_id)).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| RmemError::serialization("episode_get", e)),
            None => Ok(None),
        }
    }

    /// Delete an episode from all three places
    pub async fn delete(&self, episode_id: &str) -> RmemResult<bool> {
        let Some(episode) = self.get(episode_id).await? else {
            return Ok(false);
        };

        let context_id = episode.context_id.clone();
        let list_key = Self::context_list_key(&context_id);

        self.locks
            .with_lock(&list_key, || async {
                let removed = self.remove_record(&context_id, episode_id).await?;

                let mut ids = self.read_list(&context_id).await?;
                ids.retain(|id| id != episode_id);
                self.kv.set(&list_key, json!(ids), SetOptions::new()).await?;

                Ok(removed)
            })
            .await
    }

    /// Delete every episode of a context; returns how many were removed
    pub async fn delete_context(&self, context_id: &str) -> RmemResult<usize> {
        let list_key = Self::context_list_key(context_id);

        let removed = self
            .locks
            .with_lock(&list_key, || async {
                let ids = self.read_list(context_id).await?;
                let mut removed = 0;
                for id in &ids {
                    if self.remove_record(context_id, id).await? {
                        removed += 1;
                    }
                }
                self.kv.delete(&list_key).await?;
                Ok::<_, RmemError>(removed)
            })
            .await?;

        self.accumulators.remove(context_id);
        Ok(removed)
    }

    async fn hydrate(&self, ids: &[String]) -> RmemResult<Vec<Episode>> {
        let mut episodes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(episode) = self.get(id).await? {
                episodes.push(episode);
            }
        }
        Ok(episodes)
    }

    /// Number of stored episodes of a context
    pub async fn count(&self, context_id: &str) -> RmemResult<usize> {
        Ok(self.read_list(context_id).await?.len())
    }

    /// Episodes of a context, most recent first
    pub async fn get_by_context(
        &self,
        context_id: &str,
        limit: Option<usize>,
    ) -> RmemResult<Vec<Episode>> {
        let ids = self.read_list(context_id).await?;
        let mut episodes = self.hydrate(&ids).await?;

        episodes.sort_by(|a, b| b.end_time.cmp(&a.end_time).then_with(|| b.id.cmp(&a.id)));
        if let Some(limit) = limit {
            episodes.truncate(limit);
        }

        Ok(episodes)
    }

    /// Episodes of a context, oldest first
    pub async fn get_timeline(&self, context_id: &str) -> RmemResult<Vec<Episode>> {
        let ids = self.read_list(context_id).await?;
        let mut episodes = self.hydrate(&ids).await?;
        episodes.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        Ok(episodes)
    }

    /// Similarity search within a context's episodes
    pub async fn find_similar(
        &self,
        context_id: &str,
        query: &str,
        limit: usize,
    ) -> RmemResult<Vec<EpisodeMatch>> {
        // Log documents share an episode, so over-fetch before collapsing
        let hits = self
            .vector
            .search(
                VectorQuery::text(query)
                    .in_namespace(Self::namespace(context_id))
                    .with_limit(limit.saturating_mul(4).max(limit)),
            )
            .await?;

        let mut seen = HashSet::new();
        let mut matches = Vec::new();
        for hit in hits {
            let episode_id = hit
                .metadata
                .as_ref()
                .and_then(|m| m.get("episodeId"))
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or(hit.id);

            if !seen.insert(episode_id.clone()) {
                continue;
            }
            if let Some(episode) = self.get(&episode_id).await? {
                matches.push(EpisodeMatch {
                    episode,
                    score: hit.score,
                });
            }
            if matches.len() >= limit {
                break;
            }
        }

        Ok(matches)
    }

    /// Merge episodes into one compression episode (not stored)
    pub async fn compress(&self, episodes: &[Episode]) -> RmemResult<Episode> {
        let Some(first) = episodes.first() else {
            return Err(RmemError::validation(
                "episodes",
                "must not be empty",
                "0 episodes provided",
            ));
        };

        let summary = self.summarizer.summarize_episodes(episodes).await;

        let mut logs: Vec<LogEntry> = episodes.iter().flat_map(|e| e.logs.iter().cloned()).collect();
        logs.sort_by_key(|l| l.timestamp);

        let start = episodes.iter().map(|e| e.start_time).min().unwrap_or(first.start_time);
        let end = episodes.iter().map(|e| e.end_time).max().unwrap_or(first.end_time);
        let importance = episodes.iter().map(|e| e.importance).fold(0.0_f64, f64::max);
        let original: Vec<&str> = episodes.iter().map(|e| e.id.as_str()).collect();

        Ok(
            Episode::new(&first.context_id, EpisodeType::Compression, summary, logs)
                .with_span(start, end)
                .with_importance(importance)
                .with_metadata("originalEpisodes", json!(original))
                .with_metadata("compressionRatio", episodes.len()),
        )
    }

    /// Digest of the most recent episodes of a context
    pub async fn generate_context_summary(
        &self,
        context_id: &str,
        num_episodes: usize,
    ) -> RmemResult<String> {
        let recent = self.get_by_context(context_id, Some(num_episodes)).await?;

        if recent.is_empty() {
            return Ok(String::new());
        }

        let mut summary = String::from("Recent interaction history:\n");
        for episode in &recent {
            let date = chrono::DateTime::from_timestamp_millis(episode.end_time)
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "unknown".to_string());
            summary.push_str(&format!("- [{}] {}\n", date, episode.summary));
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryKvProvider, InMemoryVectorProvider};
    use crate::error::ErrorKind;

    struct Fixture {
        kv: Arc<InMemoryKvProvider>,
        vector: Arc<InMemoryVectorProvider>,
        episodes: EpisodicMemory,
    }

    async fn fixture(settings: EpisodicSettings) -> Fixture {
        let kv = Arc::new(InMemoryKvProvider::new());
        let vector = Arc::new(InMemoryVectorProvider::new());
        kv.initialize().await.unwrap();
        vector.initialize().await.unwrap();

        let episodes = EpisodicMemory::new(
            kv.clone(),
            vector.clone(),
            Arc::new(ContextLockManager::new()),
            settings,
        );
        Fixture { kv, vector, episodes }
    }

    /// KV whose context-list writes always fail
    struct ListlessKv(InMemoryKvProvider);

    #[async_trait::async_trait]
    impl KeyValueProvider for ListlessKv {
        async fn initialize(&self) -> RmemResult<()> {
            self.0.initialize().await
        }
        async fn close(&self) -> RmemResult<()> {
            self.0.close().await
        }
        async fn health(&self) -> RmemResult<crate::storage::HealthReport> {
            self.0.health().await
        }
        async fn get(&self, key: &str) -> RmemResult<Option<Value>> {
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: Value, options: SetOptions) -> RmemResult<()> {
            if key.starts_with("episodes:context:") {
                return Err(RmemError::storage("kv_set", "disk full"));
            }
            self.0.set(key, value, options).await
        }
        async fn delete(&self, key: &str) -> RmemResult<bool> {
            self.0.delete(key).await
        }
        async fn keys(&self, pattern: Option<&str>) -> RmemResult<Vec<String>> {
            self.0.keys(pattern).await
        }
        fn scan<'a>(&'a self, pattern: Option<&'a str>) -> crate::storage::KvScan<'a> {
            self.0.scan(pattern)
        }
    }

    fn exchange(question: &str, answer: &str, at: i64) -> Vec<LogEntry> {
        vec![
            LogEntry::input(question).with_timestamp(at),
            LogEntry::action_call("search", json!({"q": question})).with_timestamp(at + 1),
            LogEntry::output(answer).with_timestamp(at + 2),
        ]
    }

    #[tokio::test]
    async fn test_create_from_logs_summary() {
        let f = fixture(EpisodicSettings::default()).await;
        let episode = f
            .episodes
            .create_from_logs("ctx", exchange("weather in paris?", "sunny", 1_000));

        assert_eq!(
            episode.summary,
            "Input: weather in paris? | Actions: search | Output: sunny"
        );
        assert_eq!(episode.episode_type, EpisodeType::Action);
        assert_eq!(episode.start_time, 1_000);
        assert_eq!(episode.duration_ms, 2);
    }

    #[tokio::test]
    async fn test_observe_state_machine() {
        let f = fixture(EpisodicSettings::default()).await;

        // Outputs while idle are ignored
        assert!(f.episodes.observe("ctx", LogEntry::output("stray")).await.unwrap().is_none());
        assert_eq!(f.episodes.pending("ctx"), 0);

        let logs = exchange("hello", "hi", 0);
        assert!(f.episodes.observe("ctx", logs[0].clone()).await.unwrap().is_none());
        assert!(f.episodes.observe("ctx", logs[1].clone()).await.unwrap().is_none());
        assert_eq!(f.episodes.pending("ctx"), 2);

        let episode = f
            .episodes
            .observe("ctx", logs[2].clone())
            .await
            .unwrap()
            .expect("output closes the episode");
        assert_eq!(episode.logs.len(), 3);
        assert_eq!(f.episodes.pending("ctx"), 0);
        assert_eq!(f.episodes.count("ctx").await.unwrap(), 1);

        // Within the minimum gap a new input does not open an episode
        let early = LogEntry::input("again").with_timestamp(60_000);
        f.episodes.observe("ctx", early).await.unwrap();
        assert_eq!(f.episodes.pending("ctx"), 0);

        let later = LogEntry::input("much later").with_timestamp(2 + 300_000);
        f.episodes.observe("ctx", later).await.unwrap();
        assert_eq!(f.episodes.pending("ctx"), 1);
    }

    #[tokio::test]
    async fn test_store_indexes_summary_and_logs() {
        let f = fixture(EpisodicSettings {
            index_logs: true,
            ..EpisodicSettings::default()
        })
        .await;

        let episode = f.episodes.create_from_logs("ctx", exchange("rust lifetimes", "explained", 0));
        let id = episode.id.clone();
        f.episodes.store(episode).await.unwrap();

        assert!(f.kv.exists(&format!("episode:{}", id)).await.unwrap());
        // Summary plus three log lines
        assert_eq!(f.vector.count(Some("episodes:ctx")).await.unwrap(), 4);

        let similar = f.episodes.find_similar("ctx", "rust lifetimes", 5).await.unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].episode.id, id);

        assert!(f.episodes.delete(&id).await.unwrap());
        assert_eq!(f.vector.count(Some("episodes:ctx")).await.unwrap(), 0);
        assert_eq!(f.episodes.count("ctx").await.unwrap(), 0);
        assert!(!f.episodes.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_capping_evicts_oldest_everywhere() {
        let f = fixture(EpisodicSettings {
            max_episodes_per_context: 3,
            ..EpisodicSettings::default()
        })
        .await;

        let mut ids = Vec::new();
        for i in 0..4 {
            let episode = f
                .episodes
                .create_from_logs("ctx", exchange(&format!("question {}", i), "answer", i * 10));
            ids.push(episode.id.clone());
            f.episodes.store(episode).await.unwrap();
        }

        assert_eq!(f.episodes.count("ctx").await.unwrap(), 3);
        assert!(!f.kv.exists(&format!("episode:{}", ids[0])).await.unwrap());
        assert_eq!(f.vector.count(Some("episodes:ctx")).await.unwrap(), 3);

        let timeline = f.episodes.get_timeline("ctx").await.unwrap();
        let timeline_ids: Vec<&str> = timeline.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(timeline_ids, vec![ids[1].as_str(), ids[2].as_str(), ids[3].as_str()]);

        let by_context = f.episodes.get_by_context("ctx", Some(2)).await.unwrap();
        assert_eq!(by_context[0].id, ids[3]);
        assert_eq!(by_context.len(), 2);
    }

    #[tokio::test]
    async fn test_compress_merges_episodes() {
        let f = fixture(EpisodicSettings::default()).await;

        let err = f.episodes.compress(&[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let a = f.episodes.create_from_logs("ctx", exchange("one", "1", 0));
        let b = f.episodes.create_from_logs("ctx", exchange("two", "2", 100));
        let merged = f.episodes.compress(&[a.clone(), b.clone()]).await.unwrap();

        assert_eq!(merged.episode_type, EpisodeType::Compression);
        assert_eq!(merged.logs.len(), 6);
        assert_eq!(merged.start_time, 0);
        assert_eq!(merged.end_time, 102);
        assert_eq!(merged.metadata.get("compressionRatio"), Some(&json!(2)));
        assert_eq!(
            merged.metadata.get("originalEpisodes"),
            Some(&json!([a.id, b.id]))
        );
    }

    #[tokio::test]
    async fn test_context_summary_and_delete_context() {
        let f = fixture(EpisodicSettings::default()).await;
        assert_eq!(f.episodes.generate_context_summary("ctx", 5).await.unwrap(), "");

        for i in 0..2 {
            let episode = f
                .episodes
                .create_from_logs("ctx", exchange(&format!("q{}", i), "a", i * 10));
            f.episodes.store(episode).await.unwrap();
        }

        let summary = f.episodes.generate_context_summary("ctx", 5).await.unwrap();
        assert!(summary.starts_with("Recent interaction history:\n"));
        assert_eq!(summary.lines().count(), 3);

        assert_eq!(f.episodes.delete_context("ctx").await.unwrap(), 2);
        assert_eq!(f.episodes.count("ctx").await.unwrap(), 0);
        assert_eq!(f.kv.count(Some("episode:*")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_list_append_leaves_no_orphans() {
        let kv = Arc::new(ListlessKv(InMemoryKvProvider::new()));
        let vector = Arc::new(InMemoryVectorProvider::new());
        kv.initialize().await.unwrap();
        vector.initialize().await.unwrap();
        let settings = EpisodicSettings {
            index_logs: true,
            ..EpisodicSettings::default()
        };
        let episodes = EpisodicMemory::new(
            kv.clone(),
            vector.clone(),
            Arc::new(ContextLockManager::new()),
            settings,
        );

        let episode = episodes.create_from_logs("ctx", exchange("deploy status?", "green", 1_000));
        let id = episode.id.clone();

        let err = episodes.store(episode).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(episodes.get(&id).await.unwrap().is_none());
        assert_eq!(vector.count(Some("episodes:ctx")).await.unwrap(), 0);
    }
}
