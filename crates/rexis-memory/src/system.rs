//! Memory system - coordinates every memory type behind `remember`, `recall`
//! and `forget`
//!
//! Key-value storage is mandatory: [`MemorySystem::initialize`] fails when it
//! is unusable. A vector or graph backend that fails to come up leaves the
//! system in degraded mode; direct vector indexing, the vector recall branch
//! and graph writes are then skipped with a warning.

use crate::classify::{classify, Classified, EpisodeDraft, MemoryKind};
use crate::compression::Summarizer;
use crate::config::{MemoryConfig, MemorySettings};
use crate::contexts::ContextStore;
use crate::episodic::{Episode, EpisodeType, EpisodicMemory};
use crate::error::{RmemError, RmemResult};
use crate::events::{EventBus, MemoryEvent};
use crate::facts::{Fact, FactStore};
use crate::graph::{Entity, GraphMemory, Relationship};
use crate::lock::ContextLockManager;
use crate::manager::{fifo_manager, FifoOptions};
use crate::middleware::MiddlewareChain;
use crate::recall::{rank, timestamp_millis, MemoryResult, RecallOptions, ResultType};
use crate::semantic::SemanticMemory;
use crate::storage::{
    GraphProvider, HealthReport, HealthStatus, KeyValueProvider, Metadata, SetOptions,
    VectorDocument, VectorProvider, VectorQuery,
};
use crate::working::{now_millis, LogEntry, LogRef, PushOptions, WorkingMemory, WorkingMemoryData};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Options of [`MemorySystem::remember`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RememberOptions {
    /// Persist the raw content under this key
    pub key: Option<String>,

    /// Explicit kind; shape heuristics apply when `None`
    #[serde(rename = "type")]
    pub kind: Option<MemoryKind>,

    /// Context the content belongs to
    pub context_id: Option<String>,

    /// Vector document id (defaults to the key, else a fresh id)
    pub id: Option<String>,

    /// Vector namespace (unscoped when `None`)
    pub namespace: Option<String>,

    /// Metadata stored with the raw record and the vector document
    pub metadata: Metadata,

    /// Index string content into the vector store
    pub index: bool,

    /// Expiry of the raw record, seconds
    pub ttl_secs: Option<u64>,
}

impl Default for RememberOptions {
    fn default() -> Self {
        Self {
            key: None,
            kind: None,
            context_id: None,
            id: None,
            namespace: None,
            metadata: Metadata::new(),
            index: true,
            ttl_secs: None,
        }
    }
}

impl RememberOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_kind(mut self, kind: MemoryKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Skip vector indexing
    pub fn without_index(mut self) -> Self {
        self.index = false;
        self
    }

    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl_secs = Some(seconds);
        self
    }
}

/// Raw record written by `remember` when a key is given
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMemory {
    pub content: Value,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    /// Write time, ms since epoch
    pub timestamp: i64,
}

/// What `remember` wrote
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RememberReceipt {
    pub key: Option<String>,
    pub vector_id: Option<String>,
    pub fact: Option<Fact>,
    pub episode: Option<Episode>,
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

impl RememberReceipt {
    /// Number of records written
    pub fn stored(&self) -> usize {
        usize::from(self.key.is_some())
            + usize::from(self.vector_id.is_some())
            + usize::from(self.fact.is_some())
            + usize::from(self.episode.is_some())
            + self.entities.len()
            + self.relationships.len()
    }
}

/// Selection of what `forget` deletes; every criterion given is applied
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ForgetCriteria {
    /// Glob over key-value keys
    pub pattern: Option<String>,

    /// Typed deletion: facts (by tags and context), episodes (by context),
    /// patterns, or vector documents (by id)
    #[serde(rename = "type")]
    pub memory_type: Option<ResultType>,

    /// Facts must carry every tag
    pub tags: Vec<String>,

    /// Context scope for facts and episodes
    pub context_id: Option<String>,

    /// Vector document ids
    pub ids: Vec<String>,

    /// Vector namespace of `ids`
    pub namespace: Option<String>,

    /// Delete key-value records whose `timestamp` is older, ms since epoch
    pub older_than: Option<i64>,
}

impl ForgetCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete keys matching a glob
    pub fn matching(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Delete facts carrying every tag
    pub fn facts_tagged<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.memory_type = Some(ResultType::Fact);
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Delete every episode of a context
    pub fn episodes_of(mut self, context_id: impl Into<String>) -> Self {
        self.memory_type = Some(ResultType::Episode);
        self.context_id = Some(context_id.into());
        self
    }

    /// Delete every learned pattern
    pub fn patterns(mut self) -> Self {
        self.memory_type = Some(ResultType::Pattern);
        self
    }

    /// Delete vector documents
    pub fn vectors<I, S>(mut self, ids: I, namespace: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.memory_type = Some(ResultType::Vector);
        self.ids = ids.into_iter().map(Into::into).collect();
        self.namespace = namespace.map(str::to_string);
        self
    }

    /// Restrict to one context
    pub fn in_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Delete records older than a point in time
    pub fn older_than(mut self, cutoff: chrono::DateTime<chrono::Utc>) -> Self {
        self.older_than = Some(cutoff.timestamp_millis());
        self
    }

    /// Delete records older than a timestamp in ms
    pub fn older_than_millis(mut self, cutoff: i64) -> Self {
        self.older_than = Some(cutoff);
        self
    }

    fn is_empty(&self) -> bool {
        self.pattern.is_none() && self.memory_type.is_none() && self.older_than.is_none()
    }
}

/// Aggregated provider health
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub kv: HealthReport,
    pub vector: HealthReport,
    pub graph: HealthReport,
}

fn provider_usable(provider: &'static str, init: RmemResult<()>, health: RmemResult<HealthReport>) -> bool {
    if let Err(e) = init {
        tracing::warn!(provider, error = %e, "Provider failed to initialize; continuing degraded");
        return false;
    }
    match health {
        Ok(report) if report.is_usable() => true,
        Ok(report) => {
            tracing::warn!(provider, message = ?report.message, "Provider unhealthy; continuing degraded");
            false
        }
        Err(e) => {
            tracing::warn!(provider, error = %e, "Provider health check failed; continuing degraded");
            false
        }
    }
}

/// Unified memory system
pub struct MemorySystem {
    kv: Arc<dyn KeyValueProvider>,
    vector: Arc<dyn VectorProvider>,
    graph_provider: Arc<dyn GraphProvider>,
    settings: MemorySettings,

    locks: Arc<ContextLockManager>,
    working: Arc<WorkingMemory>,
    episodes: Arc<EpisodicMemory>,
    facts: Arc<FactStore>,
    semantic: Arc<SemanticMemory>,
    graph: Arc<GraphMemory>,
    contexts: Arc<ContextStore>,

    middlewares: MiddlewareChain,
    events: EventBus,

    initialized: AtomicBool,
    vector_ready: AtomicBool,
    graph_ready: AtomicBool,
}

impl MemorySystem {
    /// Wire every store from a configuration. Call
    /// [`initialize`](Self::initialize) before use.
    pub fn new(config: MemoryConfig) -> Self {
        let MemoryConfig {
            kv,
            vector,
            graph,
            settings,
            language_model,
            middlewares,
            episode_hooks,
        } = config;

        let locks = Arc::new(ContextLockManager::new());

        let mut episodes = EpisodicMemory::new(
            kv.clone(),
            vector.clone(),
            locks.clone(),
            settings.episodic.clone(),
        )
        .with_summarizer(Summarizer::from_option(language_model));
        if let Some(hooks) = episode_hooks {
            episodes = episodes.with_hooks(hooks);
        }
        let episodes = Arc::new(episodes);

        let working = Arc::new(WorkingMemory::new(kv.clone(), locks.clone()).with_episodes(episodes.clone()));
        let facts = Arc::new(FactStore::new(kv.clone(), vector.clone(), settings.facts.clone()));
        let semantic = Arc::new(
            SemanticMemory::new(kv.clone(), vector.clone(), settings.semantic.clone())
                .with_locks(locks.clone()),
        );
        let graph_memory = Arc::new(GraphMemory::new(graph.clone()));
        let contexts = Arc::new(ContextStore::new(
            kv.clone(),
            locks.clone(),
            working.clone(),
            episodes.clone(),
        ));

        Self {
            kv,
            vector,
            graph_provider: graph,
            settings,
            locks,
            working,
            episodes,
            facts,
            semantic,
            graph: graph_memory,
            contexts,
            middlewares: MiddlewareChain::new(middlewares),
            events: EventBus::default(),
            initialized: AtomicBool::new(false),
            vector_ready: AtomicBool::new(false),
            graph_ready: AtomicBool::new(false),
        }
    }

    /// Bring up the providers and middlewares.
    ///
    /// Fails only when key-value storage is unusable.
    pub async fn initialize(&self) -> RmemResult<()> {
        self.kv
            .initialize()
            .await
            .map_err(|e| RmemError::backend_unavailable("kv", e.to_string()))?;
        let kv_health = self.kv.health().await?;
        if !kv_health.is_usable() {
            return Err(RmemError::backend_unavailable(
                "kv",
                kv_health.message.unwrap_or_else(|| "unhealthy".to_string()),
            ));
        }

        let vector_ok = provider_usable("vector", self.vector.initialize().await, self.vector.health().await);
        let graph_ok = provider_usable(
            "graph",
            self.graph_provider.initialize().await,
            self.graph_provider.health().await,
        );
        self.vector_ready.store(vector_ok, Ordering::Release);
        self.graph_ready.store(graph_ok, Ordering::Release);

        self.middlewares.initialize().await;
        self.initialized.store(true, Ordering::Release);

        let degraded = !(vector_ok && graph_ok);
        tracing::info!(
            vector = vector_ok,
            graph = graph_ok,
            middlewares = self.middlewares.len(),
            "Memory system initialized"
        );
        self.events.emit(MemoryEvent::Initialized { degraded });

        Ok(())
    }

    /// Close every provider. Vector and graph failures are logged; a
    /// key-value failure is returned.
    pub async fn close(&self) -> RmemResult<()> {
        self.initialized.store(false, Ordering::Release);

        if let Err(e) = self.vector.close().await {
            tracing::warn!(error = %e, "Vector provider failed to close");
        }
        if let Err(e) = self.graph_provider.close().await {
            tracing::warn!(error = %e, "Graph provider failed to close");
        }
        let kv = self.kv.close().await;

        tracing::info!("Memory system closed");
        self.events.emit(MemoryEvent::Closed);
        kv
    }

    /// Provider health, aggregated
    pub async fn health(&self) -> SystemHealth {
        let report = |result: RmemResult<HealthReport>| {
            result.unwrap_or_else(|e| HealthReport::unhealthy(e.to_string()))
        };
        let (kv, vector, graph) = tokio::join!(
            self.kv.health(),
            self.vector.health(),
            self.graph_provider.health()
        );
        let (kv, vector, graph) = (report(kv), report(vector), report(graph));

        let status = if !kv.is_usable() {
            HealthStatus::Unhealthy
        } else if vector.status != HealthStatus::Healthy || graph.status != HealthStatus::Healthy {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        SystemHealth {
            status,
            kv,
            vector,
            graph,
        }
    }

    fn ensure_ready(&self) -> RmemResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RmemError::not_ready("memory system"))
        }
    }

    /// Whether vector or graph features are disabled
    pub fn is_degraded(&self) -> bool {
        !(self.vector_ready.load(Ordering::Acquire) && self.graph_ready.load(Ordering::Acquire))
    }

    fn vector_ready(&self) -> bool {
        self.vector_ready.load(Ordering::Acquire)
    }

    fn graph_ready(&self) -> bool {
        self.graph_ready.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    /// Push options carrying the FIFO policy configured under `[working]`
    pub fn push_options(&self) -> PushOptions {
        PushOptions::new().with_manager(Arc::new(fifo_manager(FifoOptions::from_settings(
            &self.settings.working,
        ))))
    }

    pub fn locks(&self) -> &Arc<ContextLockManager> {
        &self.locks
    }

    pub fn working(&self) -> &Arc<WorkingMemory> {
        &self.working
    }

    pub fn episodes(&self) -> &Arc<EpisodicMemory> {
        &self.episodes
    }

    pub fn facts(&self) -> &Arc<FactStore> {
        &self.facts
    }

    pub fn semantic(&self) -> &Arc<SemanticMemory> {
        &self.semantic
    }

    pub fn graph(&self) -> &Arc<GraphMemory> {
        &self.graph
    }

    pub fn contexts(&self) -> &Arc<ContextStore> {
        &self.contexts
    }

    /// Register a synchronous event listener
    pub fn on(&self, listener: impl Fn(&MemoryEvent) + Send + Sync + 'static) {
        self.events.on(listener);
    }

    /// Receive every future event
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.events.subscribe()
    }

    /// Read a raw record written by `remember`
    pub async fn get(&self, key: &str) -> RmemResult<Option<StoredMemory>> {
        self.ensure_ready()?;
        match self.kv.get(key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| RmemError::serialization("memory_get", e)),
            None => Ok(None),
        }
    }

    /// Append an entry to a context's working memory and feed the episode
    /// state machine. An action result is also learned from as a pattern,
    /// paired with the latest call of the same action.
    pub async fn log(
        &self,
        context_id: &str,
        entry: LogEntry,
        options: PushOptions,
    ) -> RmemResult<WorkingMemoryData> {
        self.ensure_ready()?;

        let data = self.working.push(context_id, entry.clone(), options).await?;

        if self.vector_ready() {
            match self.episodes.observe(context_id, entry.clone()).await {
                Ok(Some(episode)) => self.events.emit(MemoryEvent::EpisodeStored {
                    id: episode.id,
                    context_id: context_id.to_string(),
                }),
                Ok(None) => {}
                Err(e) => tracing::warn!(context_id, error = %e, "Episode tracking failed"),
            }

            if entry.kind == LogRef::ActionResult {
                let call = data.calls.iter().rev().find(|c| c.name == entry.name);
                if let Some(call) = call {
                    if let Err(e) = self.semantic.learn_from_action(call, &entry).await {
                        tracing::warn!(context_id, error = %e, "Pattern learning failed");
                    }
                }
            }
        }

        Ok(data)
    }

    /// Store content in every memory its shape (or explicit kind) calls for.
    ///
    /// Independent writes are issued concurrently and awaited together; the
    /// first failure is returned.
    pub async fn remember(
        &self,
        content: impl Into<Value>,
        options: RememberOptions,
    ) -> RmemResult<RememberReceipt> {
        self.ensure_ready()?;
        let content = content.into();

        self.middlewares.before_remember(&content, &options).await?;
        self.events.emit(MemoryEvent::BeforeRemember {
            key: options.key.clone(),
        });

        let content = self.middlewares.transform_store(content).await?;

        let mut fact = None;
        let mut draft = None;
        let mut entities = Vec::new();
        let mut relationships = Vec::new();
        for item in classify(&content, options.kind, options.context_id.as_deref())? {
            match item {
                Classified::Fact(f) => fact = Some(f),
                Classified::Episode(d) => draft = Some(d),
                Classified::Entity(e) => entities.push(e),
                Classified::Relationship(r) => relationships.push(r),
            }
        }

        let now = now_millis();
        let (key, vector_id, fact, episode, (entities, relationships)) = tokio::try_join!(
            self.write_raw(&content, &options, now),
            self.index_content(&content, &options, now),
            self.store_fact(fact),
            self.store_episode(draft),
            self.store_graph(entities, relationships),
        )?;

        let receipt = RememberReceipt {
            key,
            vector_id,
            fact,
            episode,
            entities,
            relationships,
        };
        self.emit_stored(&receipt);

        tracing::debug!(
            key = ?receipt.key,
            stored = receipt.stored(),
            "Content remembered"
        );

        self.middlewares.after_remember(&receipt).await;
        self.events.emit(MemoryEvent::AfterRemember {
            key: receipt.key.clone(),
            stored: receipt.stored(),
        });

        Ok(receipt)
    }

    async fn write_raw(&self, content: &Value, options: &RememberOptions, now: i64) -> RmemResult<Option<String>> {
        let Some(key) = &options.key else {
            return Ok(None);
        };

        let record = StoredMemory {
            content: content.clone(),
            metadata: options.metadata.clone(),
            context_id: options.context_id.clone(),
            timestamp: now,
        };
        let value = serde_json::to_value(&record)
            .map_err(|e| RmemError::serialization("remember_raw", e))?;

        let mut set = SetOptions::new();
        if let Some(ttl) = options.ttl_secs {
            set = set.with_ttl(ttl);
        }
        self.kv.set(key, value, set).await?;

        Ok(Some(key.clone()))
    }

    async fn index_content(&self, content: &Value, options: &RememberOptions, now: i64) -> RmemResult<Option<String>> {
        let Some(text) = content.as_str() else {
            return Ok(None);
        };
        if !options.index || text.trim().is_empty() {
            return Ok(None);
        }
        if !self.vector_ready() {
            tracing::warn!("Vector backend unavailable; content not indexed");
            return Ok(None);
        }

        let id = options
            .id
            .clone()
            .or_else(|| options.key.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut metadata = options.metadata.clone();
        metadata.entry("timestamp".to_string()).or_insert_with(|| json!(now));
        if let Some(key) = &options.key {
            metadata.insert("key".to_string(), json!(key));
        }
        if let Some(ctx) = &options.context_id {
            metadata.insert("contextId".to_string(), json!(ctx));
        }

        let mut document = VectorDocument::new(&id, text).with_metadata_map(metadata);
        if let Some(namespace) = &options.namespace {
            document = document.with_namespace(namespace);
        }
        self.vector.index(vec![document]).await?;

        Ok(Some(id))
    }

    async fn store_fact(&self, fact: Option<Fact>) -> RmemResult<Option<Fact>> {
        match fact {
            Some(fact) => self.facts.store(fact).await.map(Some),
            None => Ok(None),
        }
    }

    async fn store_episode(&self, draft: Option<EpisodeDraft>) -> RmemResult<Option<Episode>> {
        let Some(EpisodeDraft {
            context_id,
            logs,
            summary,
        }) = draft
        else {
            return Ok(None);
        };

        let episode = match (summary, logs.is_empty()) {
            (Some(summary), true) => Episode::new(&context_id, EpisodeType::Conversation, summary, logs),
            (Some(summary), false) => Episode {
                summary,
                ..self.episodes.create_from_logs(&context_id, logs)
            },
            (None, _) => self.episodes.create_from_logs(&context_id, logs),
        };

        self.episodes.store(episode.clone()).await?;
        Ok(Some(episode))
    }

    async fn store_graph(
        &self,
        entities: Vec<Entity>,
        relationships: Vec<Relationship>,
    ) -> RmemResult<(Vec<Entity>, Vec<Relationship>)> {
        if entities.is_empty() && relationships.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        if !self.graph_ready() {
            tracing::warn!(
                entities = entities.len(),
                relationships = relationships.len(),
                "Graph backend unavailable; entities not stored"
            );
            return Ok((Vec::new(), Vec::new()));
        }

        let stored_entities =
            futures::future::try_join_all(entities.into_iter().map(|e| self.graph.add_entity(e))).await?;

        // Endpoints must exist before the edges are added
        let mut stored_relationships = Vec::with_capacity(relationships.len());
        for relationship in relationships {
            stored_relationships.push(self.graph.add_relationship(relationship).await?);
        }

        Ok((stored_entities, stored_relationships))
    }

    fn emit_stored(&self, receipt: &RememberReceipt) {
        if let Some(key) = &receipt.key {
            self.events.emit(MemoryEvent::KvStored { key: key.clone() });
        }
        if let Some(id) = &receipt.vector_id {
            self.events.emit(MemoryEvent::VectorStored { id: id.clone() });
        }
        if let Some(fact) = &receipt.fact {
            self.events.emit(MemoryEvent::FactStored { id: fact.id.clone() });
        }
        if let Some(episode) = &receipt.episode {
            self.events.emit(MemoryEvent::EpisodeStored {
                id: episode.id.clone(),
                context_id: episode.context_id.clone(),
            });
        }
        for entity in &receipt.entities {
            self.events.emit(MemoryEvent::EntityStored { id: entity.id.clone() });
        }
        for relationship in &receipt.relationships {
            self.events.emit(MemoryEvent::RelationshipStored {
                id: relationship.id.clone(),
            });
        }
    }

    /// Search every selected store concurrently and return ranked results.
    ///
    /// A failing store is logged and contributes no results.
    pub async fn recall(&self, query: &str, options: RecallOptions) -> RmemResult<Vec<MemoryResult>> {
        self.ensure_ready()?;

        self.middlewares.before_recall(query, &options).await?;
        self.events.emit(MemoryEvent::BeforeRecall {
            query: query.to_string(),
        });

        let limit = options.limit.unwrap_or(self.settings.recall.default_limit);
        // Over-fetch so grouping and de-duplication can still fill the limit
        let fetch = limit.max(1).saturating_mul(3);

        let (vectors, facts, episodes, patterns) = tokio::join!(
            self.recall_vectors(query, &options, fetch),
            self.recall_facts(query, &options, fetch),
            self.recall_episodes(query, &options, fetch),
            self.recall_patterns(query, &options, fetch),
        );

        let mut merged = Vec::new();
        for (result_type, branch) in [
            (ResultType::Vector, vectors),
            (ResultType::Fact, facts),
            (ResultType::Episode, episodes),
            (ResultType::Pattern, patterns),
        ] {
            match branch {
                Ok(results) => merged.extend(results),
                Err(e) => tracing::warn!(store = result_type.as_str(), error = %e, "Recall branch failed"),
            }
        }

        let ranked = rank(
            merged,
            &options,
            self.settings.recall.default_limit,
            self.settings.recall.dedupe,
            now_millis(),
        );
        let results = self.middlewares.transform_retrieve(ranked).await?;

        self.middlewares.after_recall(query, &results).await;
        self.events.emit(MemoryEvent::AfterRecall {
            query: query.to_string(),
            results: results.len(),
        });

        Ok(results)
    }

    async fn recall_vectors(&self, query: &str, options: &RecallOptions, fetch: usize) -> RmemResult<Vec<MemoryResult>> {
        if !options.wants(ResultType::Vector) || !self.vector_ready() {
            return Ok(Vec::new());
        }

        let mut vector_query = VectorQuery::text(query).with_limit(fetch);
        if let Some(namespace) = &options.namespace {
            vector_query = vector_query.in_namespace(namespace);
        }
        for (key, value) in &options.filter {
            vector_query = vector_query.with_filter(key.clone(), value.clone());
        }

        Ok(self
            .vector
            .search(vector_query)
            .await?
            .into_iter()
            .map(|hit| {
                MemoryResult::new(
                    hit.id,
                    ResultType::Vector,
                    hit.content.unwrap_or_default(),
                    f64::from(hit.score),
                )
                .with_metadata_map(hit.metadata.unwrap_or_default())
            })
            .collect())
    }

    async fn recall_facts(&self, query: &str, options: &RecallOptions, fetch: usize) -> RmemResult<Vec<MemoryResult>> {
        if !options.wants(ResultType::Fact) {
            return Ok(Vec::new());
        }

        Ok(self
            .facts
            .search(query, fetch)
            .await?
            .into_iter()
            .map(|m| {
                MemoryResult::new(&m.fact.id, ResultType::Fact, &m.fact.statement, f64::from(m.score))
                    .with_confidence(m.fact.confidence)
                    .with_metadata("source", m.fact.source.as_str())
                    .with_metadata("tags", json!(m.fact.tags))
                    .with_metadata("entities", json!(m.fact.entities))
                    .with_metadata("timestamp", m.fact.updated_at.timestamp_millis())
            })
            .collect())
    }

    async fn recall_episodes(&self, query: &str, options: &RecallOptions, fetch: usize) -> RmemResult<Vec<MemoryResult>> {
        let Some(context_id) = options.context_id.as_deref() else {
            return Ok(Vec::new());
        };
        if !options.wants(ResultType::Episode) {
            return Ok(Vec::new());
        }

        Ok(self
            .episodes
            .find_similar(context_id, query, fetch)
            .await?
            .into_iter()
            .map(|m| {
                let episode = m.episode;
                MemoryResult::new(&episode.id, ResultType::Episode, &episode.summary, f64::from(m.score))
                    .with_metadata("contextId", episode.context_id.as_str())
                    .with_metadata("episodeType", episode.episode_type.as_str())
                    .with_metadata("importance", episode.importance)
                    .with_metadata("timestamp", episode.end_time)
            })
            .collect())
    }

    async fn recall_patterns(&self, query: &str, options: &RecallOptions, fetch: usize) -> RmemResult<Vec<MemoryResult>> {
        if !options.wants(ResultType::Pattern) {
            return Ok(Vec::new());
        }

        Ok(self
            .semantic
            .search_patterns(query, fetch)
            .await?
            .into_iter()
            .map(|m| {
                let pattern = m.pattern;
                MemoryResult::new(&pattern.id, ResultType::Pattern, &pattern.trigger, f64::from(m.score))
                    .with_confidence(pattern.confidence)
                    .with_metadata("response", pattern.response.as_str())
                    .with_metadata("successRate", pattern.success_rate)
                    .with_metadata("occurrences", pattern.occurrences)
                    .with_metadata("timestamp", pattern.updated_at.timestamp_millis())
            })
            .collect())
    }

    /// Delete everything the criteria select; returns the number of records
    /// removed
    pub async fn forget(&self, criteria: ForgetCriteria) -> RmemResult<usize> {
        self.ensure_ready()?;
        if criteria.is_empty() {
            return Err(RmemError::validation(
                "criteria",
                "must select pattern, type or older_than",
                "{}",
            ));
        }

        self.middlewares.before_forget(&criteria).await?;
        self.events.emit(MemoryEvent::BeforeForget);

        let mut deleted = 0;

        if let Some(pattern) = &criteria.pattern {
            let keys = self.kv.keys(Some(pattern)).await?;
            deleted += self.kv.delete_batch(&keys).await?;
        }

        match criteria.memory_type {
            Some(ResultType::Fact) => {
                for fact in self.facts.find_by_tags(&criteria.tags).await? {
                    let in_scope = criteria
                        .context_id
                        .as_ref()
                        .map_or(true, |ctx| fact.context_id.as_ref() == Some(ctx));
                    if in_scope && self.facts.delete(&fact.id).await? {
                        deleted += 1;
                    }
                }
            }
            Some(ResultType::Episode) => {
                let context_id = criteria.context_id.as_deref().ok_or_else(|| {
                    RmemError::validation("context_id", "required to forget episodes", "none")
                })?;
                deleted += self.episodes.delete_context(context_id).await?;
            }
            Some(ResultType::Pattern) => {
                for pattern in self.semantic.list_patterns().await? {
                    if self.semantic.delete(&pattern.id).await? {
                        deleted += 1;
                    }
                }
            }
            Some(ResultType::Vector) => {
                if self.vector_ready() {
                    deleted += self
                        .vector
                        .delete(&criteria.ids, criteria.namespace.as_deref())
                        .await?;
                } else {
                    tracing::warn!("Vector backend unavailable; documents not deleted");
                }
            }
            None => {}
        }

        if let Some(cutoff) = criteria.older_than {
            let records: Vec<(String, Value)> = self.kv.scan(None).try_collect().await?;
            let expired: Vec<String> = records
                .into_iter()
                .filter(|(_, value)| {
                    value
                        .get("timestamp")
                        .and_then(timestamp_millis)
                        .is_some_and(|ts| ts < cutoff)
                })
                .map(|(key, _)| key)
                .collect();
            deleted += self.kv.delete_batch(&expired).await?;
        }

        tracing::info!(deleted, "Memories forgotten");

        self.middlewares.after_forget(&criteria, deleted).await;
        self.events.emit(MemoryEvent::AfterForget { deleted });

        Ok(deleted)
    }
}

impl std::fmt::Debug for MemorySystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySystem")
            .field("kv", &self.kv.name())
            .field("vector", &self.vector.name())
            .field("graph", &self.graph_provider.name())
            .field("initialized", &self.initialized.load(Ordering::Acquire))
            .field("degraded", &self.is_degraded())
            .field("middlewares", &self.middlewares)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::{InMemoryGraphProvider, InMemoryKvProvider};
    use parking_lot::Mutex;

    async fn system() -> MemorySystem {
        let system = MemorySystem::new(MemoryConfig::in_memory());
        system.initialize().await.unwrap();
        system
    }

    /// Vector backend whose initialization always fails
    struct DownVector;

    #[async_trait::async_trait]
    impl VectorProvider for DownVector {
        async fn initialize(&self) -> RmemResult<()> {
            Err(RmemError::backend_unavailable("vector", "connection refused"))
        }
        async fn close(&self) -> RmemResult<()> {
            Ok(())
        }
        async fn health(&self) -> RmemResult<HealthReport> {
            Ok(HealthReport::unhealthy("down"))
        }
        async fn index(&self, _documents: Vec<VectorDocument>) -> RmemResult<()> {
            Err(RmemError::not_ready("vector"))
        }
        async fn search(&self, _query: VectorQuery) -> RmemResult<Vec<crate::storage::VectorSearchResult>> {
            Err(RmemError::not_ready("vector"))
        }
        async fn update(&self, id: &str, _namespace: Option<&str>, _patch: crate::storage::DocumentPatch) -> RmemResult<()> {
            Err(RmemError::not_found("vector document", id))
        }
        async fn delete(&self, _ids: &[String], _namespace: Option<&str>) -> RmemResult<usize> {
            Err(RmemError::not_ready("vector"))
        }
        async fn count(&self, _namespace: Option<&str>) -> RmemResult<usize> {
            Err(RmemError::not_ready("vector"))
        }
    }

    #[tokio::test]
    async fn test_operations_require_initialize() {
        let system = MemorySystem::new(MemoryConfig::in_memory());
        let err = system.recall("x", RecallOptions::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotReady);
    }

    #[tokio::test]
    async fn test_degraded_vector_backend() {
        let config = MemoryConfig::new(
            Arc::new(InMemoryKvProvider::new()),
            Arc::new(DownVector),
            Arc::new(InMemoryGraphProvider::new()),
        );
        let system = MemorySystem::new(config);
        system.initialize().await.unwrap();
        assert!(system.is_degraded());

        let receipt = system
            .remember("kept in kv only", RememberOptions::new().with_key("note:1"))
            .await
            .unwrap();
        assert_eq!(receipt.key.as_deref(), Some("note:1"));
        assert!(receipt.vector_id.is_none());

        // Fact and pattern branches fail; recall still answers
        assert!(system.recall("kept", RecallOptions::new()).await.unwrap().is_empty());
        assert_eq!(system.health().await.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_remember_dispatches_by_shape() {
        let system = system().await;
        let content = json!({
            "statement": "Alice leads the Rexis project",
            "entities": [{"name": "Alice", "type": "person"}, {"name": "Rexis", "type": "project"}],
            "relationships": [{"from": "Alice", "to": "Rexis", "type": "leads"}]
        });

        let receipt = system.remember(content, RememberOptions::new()).await.unwrap();
        let fact = receipt.fact.clone().unwrap();
        assert_eq!(receipt.entities.len(), 2);
        assert_eq!(receipt.relationships.len(), 1);
        assert!(receipt.vector_id.is_none());

        assert!(system.facts().get(&fact.id).await.unwrap().is_some());
        let related = system
            .graph()
            .find_related(&receipt.entities[0].id, Some("leads"), crate::storage::Direction::Outgoing)
            .await
            .unwrap();
        assert_eq!(related[0].entity.name, "Rexis");
    }

    #[tokio::test]
    async fn test_events_are_ordered() {
        let system = system().await;
        let names = Arc::new(Mutex::new(Vec::new()));
        let sink = names.clone();
        system.on(move |event| sink.lock().push(event.name()));

        system
            .remember(
                json!("water boils at 100C"),
                RememberOptions::new().with_kind(MemoryKind::Fact).with_key("k1"),
            )
            .await
            .unwrap();

        assert_eq!(
            *names.lock(),
            vec![
                "beforeRemember",
                "kv.stored",
                "vector.stored",
                "fact.stored",
                "afterRemember"
            ]
        );
    }

    #[tokio::test]
    async fn test_recall_merges_stores() {
        let system = system().await;
        system
            .remember("rust borrow checker notes", RememberOptions::new())
            .await
            .unwrap();
        system
            .remember(json!({"statement": "rust has a borrow checker"}), RememberOptions::new())
            .await
            .unwrap();

        let results = system.recall("rust borrow checker", RecallOptions::new()).await.unwrap();
        let types: Vec<ResultType> = results.iter().map(|r| r.result_type).collect();
        assert!(types.contains(&ResultType::Vector));
        assert!(types.contains(&ResultType::Fact));

        let only_facts = system
            .recall("rust borrow checker", RecallOptions::new().with_types([ResultType::Fact]))
            .await
            .unwrap();
        assert!(only_facts.iter().all(|r| r.result_type == ResultType::Fact));
    }

    #[tokio::test]
    async fn test_log_builds_episodes_and_patterns() {
        let system = system().await;

        system.log("c1", LogEntry::input("find rust jobs"), PushOptions::new()).await.unwrap();
        system
            .log("c1", LogEntry::action_call("job_search", json!("rust")), PushOptions::new())
            .await
            .unwrap();
        system
            .log("c1", LogEntry::action_result("job_search", "12 openings"), PushOptions::new())
            .await
            .unwrap();

        assert_eq!(system.episodes().count("c1").await.unwrap(), 1);
        assert_eq!(system.working().total_entries("c1").await.unwrap(), 3);

        let patterns = system.semantic().list_patterns().await.unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].trigger, "job_search rust");
    }

    #[tokio::test]
    async fn test_forget_by_pattern_tags_and_age() {
        let system = system().await;
        system
            .remember("a", RememberOptions::new().with_key("session:1").without_index())
            .await
            .unwrap();
        system
            .remember("b", RememberOptions::new().with_key("session:2").without_index())
            .await
            .unwrap();
        system
            .remember(
                json!({"statement": "temp fact", "tags": ["scratch"]}),
                RememberOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(system.forget(ForgetCriteria::new().matching("session:*")).await.unwrap(), 2);
        assert!(system.get("session:1").await.unwrap().is_none());

        assert_eq!(
            system.forget(ForgetCriteria::new().facts_tagged(["scratch"])).await.unwrap(),
            1
        );

        system
            .remember("old", RememberOptions::new().with_key("old:1").without_index())
            .await
            .unwrap();
        let future = now_millis() + 1_000;
        assert_eq!(system.forget(ForgetCriteria::new().older_than_millis(future)).await.unwrap(), 1);

        let err = system.forget(ForgetCriteria::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_configured_working_ceiling_drives_push_options() {
        let mut settings = MemorySettings::default();
        settings.working.default_max_size = 4;
        settings.working.preserve_inputs = 2;
        let system = MemorySystem::new(MemoryConfig::in_memory().with_settings(settings));
        system.initialize().await.unwrap();

        for i in 0..5 {
            system
                .log("tight", LogEntry::input(format!("m{}", i)), system.push_options())
                .await
                .unwrap();
        }
        let inputs: Vec<Value> = system
            .working()
            .get("tight")
            .await
            .unwrap()
            .inputs
            .into_iter()
            .map(|e| e.content)
            .collect();
        assert_eq!(inputs, vec![json!("m2"), json!("m3"), json!("m4")]);

        let roomy = self::system().await;
        for i in 0..5 {
            roomy
                .log("roomy", LogEntry::input(format!("m{}", i)), roomy.push_options())
                .await
                .unwrap();
        }
        assert_eq!(roomy.working().get("roomy").await.unwrap().inputs.len(), 5);
    }
}
