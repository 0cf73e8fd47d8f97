//! # Memory Manager Policies
//!
//! A [`MemoryManager`] decides when a context's working memory is under
//! pressure and how to shrink it. Policies are plain values scoped to a push
//! call; any number of them can coexist.
//!
//! Every hook is optional. When a hook is absent the built-in behaviour for
//! the policy's [`PruneStrategy`] applies:
//!
//! - `should_prune`: total entry count reaches `max_size`
//! - `on_memory_pressure`: FIFO trimming, or summarize-and-archive for `Smart`
//!
//! Pressure handling never fails the write path: [`apply_pressure`] logs any
//! policy error and keeps the unpruned memory.
//!
//! Built-in policies: [`fifo_manager`], [`token_limiter`],
//! [`smart_memory_manager`], [`context_aware_manager`] and [`hybrid_manager`].

use crate::compression::{LanguageModel, Summarizer};
use crate::config::WorkingSettings;
use crate::episodic::{Episode, EpisodeType, EpisodicMemory};
use crate::error::{RmemError, RmemResult};
use crate::working::{LogEntry, WorkingMemoryData};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Built-in pruning strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PruneStrategy {
    /// Drop the oldest entries
    #[default]
    Fifo,
    /// Least recently used; entries carry no access times, so this trims like `Fifo`
    Lru,
    /// Summarize the oldest entries into an archived episode
    Smart,
    /// Caller-provided `on_memory_pressure`
    Custom,
}

/// Predicate pinning individual entries
pub type PreservePredicate = Arc<dyn Fn(&LogEntry) -> bool + Send + Sync>;

/// Entries that survive pruning
#[derive(Clone)]
pub struct PreserveRules {
    /// Most recent inputs always kept
    pub recent_inputs: usize,

    /// Most recent outputs always kept
    pub recent_outputs: usize,

    /// Entries whose name matches are always kept
    pub action_names: Vec<String>,

    /// Entries matching this predicate are always kept
    pub custom: Option<PreservePredicate>,
}

impl Default for PreserveRules {
    fn default() -> Self {
        Self {
            recent_inputs: 10,
            recent_outputs: 10,
            action_names: Vec::new(),
            custom: None,
        }
    }
}

impl PreserveRules {
    /// Default rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the last `n` inputs
    pub fn with_recent_inputs(mut self, n: usize) -> Self {
        self.recent_inputs = n;
        self
    }

    /// Keep the last `n` outputs
    pub fn with_recent_outputs(mut self, n: usize) -> Self {
        self.recent_outputs = n;
        self
    }

    /// Pin entries with this action name
    pub fn with_action(mut self, name: impl Into<String>) -> Self {
        self.action_names.push(name.into());
        self
    }

    /// Pin entries matching a predicate
    pub fn with_custom(mut self, predicate: impl Fn(&LogEntry) -> bool + Send + Sync + 'static) -> Self {
        self.custom = Some(Arc::new(predicate));
        self
    }

    /// Whether an entry is pinned regardless of age
    pub fn is_pinned(&self, entry: &LogEntry) -> bool {
        let by_name = entry
            .name
            .as_ref()
            .map(|n| self.action_names.contains(n))
            .unwrap_or(false);

        by_name || self.custom.as_ref().map(|f| f(entry)).unwrap_or(false)
    }
}

impl fmt::Debug for PreserveRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreserveRules")
            .field("recent_inputs", &self.recent_inputs)
            .field("recent_outputs", &self.recent_outputs)
            .field("action_names", &self.action_names)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

/// What a policy sees besides the memory itself
#[derive(Clone)]
pub struct PressureContext {
    /// Context being pushed to
    pub context_id: String,

    /// Agent performing the push
    pub agent_id: Option<String>,

    /// Where compressed history is archived
    pub episodes: Option<Arc<EpisodicMemory>>,
}

impl PressureContext {
    /// Context without an agent or episode archive
    pub fn new(context_id: impl Into<String>) -> Self {
        Self {
            context_id: context_id.into(),
            agent_id: None,
            episodes: None,
        }
    }

    /// Archive compressed history into `episodes`
    pub fn with_episodes(mut self, episodes: Arc<EpisodicMemory>) -> Self {
        self.episodes = Some(episodes);
        self
    }
}

impl fmt::Debug for PressureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PressureContext")
            .field("context_id", &self.context_id)
            .field("agent_id", &self.agent_id)
            .field("episodes", &self.episodes.is_some())
            .finish()
    }
}

/// Eviction and compression policy for working memory.
///
/// Optional hooks return `None` to defer to the built-in behaviour.
#[async_trait::async_trait]
pub trait MemoryManager: Send + Sync {
    /// Policy name used in logs and errors
    fn name(&self) -> &str {
        "memory-manager"
    }

    /// Entry count at which the default predicate fires
    fn max_size(&self) -> usize;

    /// Built-in strategy used without an `on_memory_pressure` hook
    fn strategy(&self) -> PruneStrategy {
        PruneStrategy::Fifo
    }

    /// Entries that survive built-in pruning
    fn preserve(&self) -> PreserveRules {
        PreserveRules::default()
    }

    /// Custom pressure predicate
    async fn should_prune(
        &self,
        _memory: &WorkingMemoryData,
        _ctx: &PressureContext,
    ) -> Option<RmemResult<bool>> {
        None
    }

    /// Custom pressure transform
    async fn on_memory_pressure(
        &self,
        _memory: &WorkingMemoryData,
        _ctx: &PressureContext,
    ) -> Option<RmemResult<WorkingMemoryData>> {
        None
    }

    /// Summarize entries for the `Smart` strategy
    async fn compress(
        &self,
        _entries: &[LogEntry],
        _ctx: &PressureContext,
    ) -> Option<RmemResult<String>> {
        None
    }
}

/// Evaluate a policy against freshly appended memory.
///
/// Returns the pruned memory, or the input unchanged when no pressure exists
/// or the policy fails.
pub async fn apply_pressure(
    manager: &dyn MemoryManager,
    memory: WorkingMemoryData,
    ctx: &PressureContext,
) -> WorkingMemoryData {
    let under_pressure = match should_prune(manager, &memory, ctx).await {
        Ok(flag) => flag,
        Err(e) => {
            tracing::warn!(
                policy = manager.name(),
                context_id = %ctx.context_id,
                error = %e,
                "Pressure predicate failed, leaving memory unpruned"
            );
            return memory;
        }
    };

    if !under_pressure {
        return memory;
    }

    match relieve(manager, &memory, ctx).await {
        Ok(pruned) => {
            tracing::debug!(
                policy = manager.name(),
                context_id = %ctx.context_id,
                before = memory.total_entries(),
                after = pruned.total_entries(),
                "Working memory pruned"
            );
            pruned
        }
        Err(e) => {
            tracing::warn!(
                policy = manager.name(),
                context_id = %ctx.context_id,
                error = %e,
                "Pressure handler failed, leaving memory unpruned"
            );
            memory
        }
    }
}

/// The policy's pressure predicate, or the entry-count default
pub(crate) async fn should_prune(
    manager: &dyn MemoryManager,
    memory: &WorkingMemoryData,
    ctx: &PressureContext,
) -> RmemResult<bool> {
    match manager.should_prune(memory, ctx).await {
        Some(result) => result,
        None => Ok(memory.total_entries() >= manager.max_size()),
    }
}

/// The policy's pressure transform, or its built-in strategy
pub(crate) async fn relieve(
    manager: &dyn MemoryManager,
    memory: &WorkingMemoryData,
    ctx: &PressureContext,
) -> RmemResult<WorkingMemoryData> {
    if let Some(result) = manager.on_memory_pressure(memory, ctx).await {
        return result;
    }

    match manager.strategy() {
        PruneStrategy::Fifo | PruneStrategy::Lru => Ok(fifo_prune(memory, &manager.preserve())),
        PruneStrategy::Smart => smart_prune(manager, memory, ctx).await,
        PruneStrategy::Custom => Err(RmemError::policy(
            manager.name(),
            "custom strategy requires an on_memory_pressure hook",
        )),
    }
}

/// Keep the last `keep` entries plus pinned ones
fn keep_recent(entries: &mut Vec<LogEntry>, keep: usize, preserve: &PreserveRules) {
    let cutoff = entries.len().saturating_sub(keep);
    let mut index = 0;
    entries.retain(|entry| {
        let kept = index >= cutoff || preserve.is_pinned(entry);
        index += 1;
        kept
    });
}

/// Proportional floor: `ratio` of `len`, at least `min`
fn floor(len: usize, ratio: f64, min: usize) -> usize {
    ((len as f64 * ratio).ceil() as usize).max(min)
}

fn trim_secondary_arrays(memory: &mut WorkingMemoryData, preserve: &PreserveRules) {
    let thoughts = floor(memory.thoughts.len(), 0.1, 3);
    keep_recent(&mut memory.thoughts, thoughts, preserve);

    let calls = floor(memory.calls.len(), 0.3, 10);
    keep_recent(&mut memory.calls, calls, preserve);

    let results = floor(memory.results.len(), 0.3, 10);
    keep_recent(&mut memory.results, results, preserve);
}

/// Built-in FIFO trimming
pub fn fifo_prune(memory: &WorkingMemoryData, preserve: &PreserveRules) -> WorkingMemoryData {
    let mut pruned = memory.clone();
    keep_recent(&mut pruned.inputs, preserve.recent_inputs, preserve);
    keep_recent(&mut pruned.outputs, preserve.recent_outputs, preserve);
    trim_secondary_arrays(&mut pruned, preserve);
    pruned
}

/// Oldest unpinned entries beyond the newest `keep`
fn overflow(entries: &[LogEntry], keep: usize, preserve: &PreserveRules) -> Vec<LogEntry> {
    let cutoff = entries.len().saturating_sub(keep);
    entries[..cutoff]
        .iter()
        .filter(|e| !preserve.is_pinned(e))
        .cloned()
        .collect()
}

/// Built-in summarize-and-archive
async fn smart_prune(
    manager: &dyn MemoryManager,
    memory: &WorkingMemoryData,
    ctx: &PressureContext,
) -> RmemResult<WorkingMemoryData> {
    let preserve = manager.preserve();

    let mut archived = overflow(&memory.inputs, preserve.recent_inputs, &preserve);
    archived.extend(overflow(&memory.outputs, preserve.recent_outputs, &preserve));
    if archived.is_empty() {
        return Ok(fifo_prune(memory, &preserve));
    }
    archived.sort_by_key(|e| e.timestamp);

    let summary = match manager.compress(&archived, ctx).await {
        Some(result) => result?,
        None => Summarizer::deterministic().summarize_entries(&archived).await,
    };

    let archived_count = archived.len();
    let ids: HashSet<String> = archived.iter().map(|e| e.id.clone()).collect();

    match &ctx.episodes {
        Some(episodes) => {
            let episode = Episode::new(&ctx.context_id, EpisodeType::Compression, summary, archived)
                .with_metadata("compressedEntries", archived_count);
            episodes.store(episode).await?;
        }
        None => tracing::debug!(
            context_id = %ctx.context_id,
            "No episodic memory attached, compressed summary not archived"
        ),
    }

    let mut pruned = memory.clone();
    pruned.inputs.retain(|e| !ids.contains(&e.id));
    pruned.outputs.retain(|e| !ids.contains(&e.id));
    trim_secondary_arrays(&mut pruned, &preserve);

    tracing::info!(
        context_id = %ctx.context_id,
        compressed = archived_count,
        "Compressed working memory into episode"
    );

    Ok(pruned)
}

/// Rough token count of a text, weighted by character density.
///
/// Symbol-heavy or structured text packs fewer characters per token than
/// prose.
pub fn estimate_tokens(text: &str, structured: bool) -> usize {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }

    let symbols = text
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .count();
    let density = symbols as f64 / chars as f64;

    let chars_per_token = if structured || density > 0.2 { 3.0 } else { 4.0 };
    (chars as f64 / chars_per_token).ceil() as usize
}

/// Tokens attributed to one entry, including a small per-entry overhead
pub fn entry_tokens(entry: &LogEntry) -> usize {
    let name = entry.name.as_deref().map(|n| estimate_tokens(n, false)).unwrap_or(0);
    4 + name + estimate_tokens(&entry.text(), !entry.content.is_string())
}

/// Estimated token count of a whole working memory
pub fn memory_tokens(memory: &WorkingMemoryData) -> usize {
    memory.iter().map(entry_tokens).sum()
}

/// Options for [`fifo_manager`]
#[derive(Debug, Clone)]
pub struct FifoOptions {
    pub max_size: usize,
    pub preserve_inputs: usize,
    pub preserve_outputs: usize,
    pub preserve_actions: Vec<String>,
}

impl FifoOptions {
    /// Options with the given size ceiling
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            preserve_inputs: 10,
            preserve_outputs: 10,
            preserve_actions: Vec::new(),
        }
    }

    /// Ceiling and preserve counts from the `[working]` settings
    pub fn from_settings(settings: &WorkingSettings) -> Self {
        Self::new(settings.default_max_size)
            .preserve_inputs(settings.preserve_inputs)
            .preserve_outputs(settings.preserve_outputs)
    }

    /// Keep the last `n` inputs
    pub fn preserve_inputs(mut self, n: usize) -> Self {
        self.preserve_inputs = n;
        self
    }

    /// Keep the last `n` outputs
    pub fn preserve_outputs(mut self, n: usize) -> Self {
        self.preserve_outputs = n;
        self
    }

    /// Always keep entries of this action
    pub fn preserve_action(mut self, name: impl Into<String>) -> Self {
        self.preserve_actions.push(name.into());
        self
    }
}

/// Oldest-first eviction
#[derive(Debug, Clone)]
pub struct FifoManager {
    options: FifoOptions,
}

/// FIFO policy
pub fn fifo_manager(options: FifoOptions) -> FifoManager {
    FifoManager { options }
}

#[async_trait::async_trait]
impl MemoryManager for FifoManager {
    fn name(&self) -> &str {
        "fifo"
    }

    fn max_size(&self) -> usize {
        self.options.max_size
    }

    fn preserve(&self) -> PreserveRules {
        PreserveRules {
            recent_inputs: self.options.preserve_inputs,
            recent_outputs: self.options.preserve_outputs,
            action_names: self.options.preserve_actions.clone(),
            custom: None,
        }
    }
}

/// Token-budget policy
#[derive(Debug, Clone)]
pub struct TokenLimiter {
    max_tokens: usize,
}

/// Prune once the estimated token count exceeds `max_tokens`
pub fn token_limiter(max_tokens: usize) -> TokenLimiter {
    TokenLimiter { max_tokens }
}

impl TokenLimiter {
    const KEEP_RECENT: usize = 3;

    /// Drop the oldest unprotected entries until the budget holds
    pub fn prune(&self, memory: &WorkingMemoryData) -> WorkingMemoryData {
        let mut total = memory_tokens(memory);
        if total <= self.max_tokens {
            return memory.clone();
        }

        let protected: HashSet<&str> = memory
            .inputs
            .iter()
            .rev()
            .take(Self::KEEP_RECENT)
            .chain(memory.outputs.iter().rev().take(Self::KEEP_RECENT))
            .map(|e| e.id.as_str())
            .collect();

        let mut candidates: Vec<&LogEntry> = memory
            .iter()
            .filter(|e| !protected.contains(e.id.as_str()))
            .collect();
        candidates.sort_by_key(|e| e.timestamp);

        let mut dropped: HashSet<String> = HashSet::new();
        for entry in candidates {
            if total <= self.max_tokens {
                break;
            }
            total = total.saturating_sub(entry_tokens(entry));
            dropped.insert(entry.id.clone());
        }

        let mut pruned = memory.clone();
        pruned.for_each_array_mut(|_, entries| entries.retain(|e| !dropped.contains(&e.id)));
        pruned
    }
}

#[async_trait::async_trait]
impl MemoryManager for TokenLimiter {
    fn name(&self) -> &str {
        "token-limiter"
    }

    fn max_size(&self) -> usize {
        usize::MAX
    }

    fn strategy(&self) -> PruneStrategy {
        PruneStrategy::Custom
    }

    async fn should_prune(
        &self,
        memory: &WorkingMemoryData,
        _ctx: &PressureContext,
    ) -> Option<RmemResult<bool>> {
        Some(Ok(memory_tokens(memory) > self.max_tokens))
    }

    async fn on_memory_pressure(
        &self,
        memory: &WorkingMemoryData,
        _ctx: &PressureContext,
    ) -> Option<RmemResult<WorkingMemoryData>> {
        Some(Ok(self.prune(memory)))
    }
}

/// Options for [`smart_memory_manager`]
#[derive(Clone)]
pub struct SmartOptions {
    pub max_size: usize,
    pub preserve_important: bool,
    pub model: Option<Arc<dyn LanguageModel>>,
}

impl SmartOptions {
    /// Options with the given size ceiling and no model
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            preserve_important: false,
            model: None,
        }
    }

    /// Keep more history uncompressed
    pub fn preserve_important(mut self, preserve: bool) -> Self {
        self.preserve_important = preserve;
        self
    }

    /// Summarize with a language model
    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }
}

/// Summarize-and-archive policy
#[derive(Debug, Clone)]
pub struct SmartMemoryManager {
    max_size: usize,
    preserve_important: bool,
    summarizer: Summarizer,
}

/// Compression policy backed by an optional language model
pub fn smart_memory_manager(options: SmartOptions) -> SmartMemoryManager {
    SmartMemoryManager {
        max_size: options.max_size,
        preserve_important: options.preserve_important,
        summarizer: Summarizer::from_option(options.model),
    }
}

#[async_trait::async_trait]
impl MemoryManager for SmartMemoryManager {
    fn name(&self) -> &str {
        "smart"
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    fn strategy(&self) -> PruneStrategy {
        PruneStrategy::Smart
    }

    fn preserve(&self) -> PreserveRules {
        let keep = if self.preserve_important {
            (self.max_size / 2).max(4)
        } else {
            (self.max_size / 4).max(2)
        };
        PreserveRules::new()
            .with_recent_inputs(keep)
            .with_recent_outputs(keep)
    }

    async fn compress(
        &self,
        entries: &[LogEntry],
        _ctx: &PressureContext,
    ) -> Option<RmemResult<String>> {
        Some(Ok(self.summarizer.summarize_entries(entries).await))
    }
}

/// Keyword-preserving policy
#[derive(Debug, Clone)]
pub struct ContextAwareManager {
    max_size: usize,
    keywords: Vec<String>,
}

/// Keep entries mentioning `keywords` or carrying an error; trim the rest
/// proportionally
pub fn context_aware_manager(max_size: usize, keywords: Vec<String>) -> ContextAwareManager {
    ContextAwareManager {
        max_size,
        keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
    }
}

impl ContextAwareManager {
    fn is_relevant(&self, entry: &LogEntry) -> bool {
        if entry.error.is_some() {
            return true;
        }
        let text = entry.text().to_lowercase();
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }

    /// Proportional trim keeping relevant entries
    pub fn prune(&self, memory: &WorkingMemoryData) -> WorkingMemoryData {
        let total = memory.total_entries().max(1);
        let ratio = ((self.max_size as f64 * 0.75) / total as f64).min(1.0);

        let mut pruned = memory.clone();
        pruned.for_each_array_mut(|_, entries| {
            let ordinary = entries.iter().filter(|e| !self.is_relevant(e)).count();
            let keep = (ordinary as f64 * ratio).floor() as usize;
            let cutoff = ordinary - keep;

            let mut seen = 0;
            entries.retain(|e| {
                if self.is_relevant(e) {
                    return true;
                }
                seen += 1;
                seen > cutoff
            });
        });
        pruned
    }
}

#[async_trait::async_trait]
impl MemoryManager for ContextAwareManager {
    fn name(&self) -> &str {
        "context-aware"
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    fn strategy(&self) -> PruneStrategy {
        PruneStrategy::Custom
    }

    async fn on_memory_pressure(
        &self,
        memory: &WorkingMemoryData,
        _ctx: &PressureContext,
    ) -> Option<RmemResult<WorkingMemoryData>> {
        Some(Ok(self.prune(memory)))
    }
}

/// Layered policy: token ceiling, then primary, then secondary
pub struct HybridManager {
    max_tokens: Option<usize>,
    primary: Arc<dyn MemoryManager>,
    secondary: Option<Arc<dyn MemoryManager>>,
}

/// Combine policies so that pressure handling never fails
pub fn hybrid_manager(
    primary: Arc<dyn MemoryManager>,
    secondary: Option<Arc<dyn MemoryManager>>,
    max_tokens: Option<usize>,
) -> HybridManager {
    HybridManager {
        max_tokens,
        primary,
        secondary,
    }
}

impl HybridManager {
    fn over_token_ceiling(&self, memory: &WorkingMemoryData) -> Option<usize> {
        self.max_tokens.filter(|max| memory_tokens(memory) > *max)
    }
}

impl fmt::Debug for HybridManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridManager")
            .field("max_tokens", &self.max_tokens)
            .field("primary", &self.primary.name())
            .field("secondary", &self.secondary.as_ref().map(|s| s.name().to_string()))
            .finish()
    }
}

#[async_trait::async_trait]
impl MemoryManager for HybridManager {
    fn name(&self) -> &str {
        "hybrid"
    }

    fn max_size(&self) -> usize {
        self.primary.max_size()
    }

    fn strategy(&self) -> PruneStrategy {
        PruneStrategy::Custom
    }

    async fn should_prune(
        &self,
        memory: &WorkingMemoryData,
        ctx: &PressureContext,
    ) -> Option<RmemResult<bool>> {
        if self.over_token_ceiling(memory).is_some() {
            return Some(Ok(true));
        }

        let decision = match should_prune(self.primary.as_ref(), memory, ctx).await {
            Ok(flag) => flag,
            Err(e) => {
                tracing::warn!(policy = self.primary.name(), error = %e, "Primary predicate failed");
                match &self.secondary {
                    Some(secondary) => should_prune(secondary.as_ref(), memory, ctx)
                        .await
                        .unwrap_or(false),
                    None => false,
                }
            }
        };

        Some(Ok(decision))
    }

    async fn on_memory_pressure(
        &self,
        memory: &WorkingMemoryData,
        ctx: &PressureContext,
    ) -> Option<RmemResult<WorkingMemoryData>> {
        if let Some(max_tokens) = self.over_token_ceiling(memory) {
            return Some(Ok(token_limiter(max_tokens).prune(memory)));
        }

        match relieve(self.primary.as_ref(), memory, ctx).await {
            Ok(pruned) => return Some(Ok(pruned)),
            Err(e) => {
                tracing::warn!(policy = self.primary.name(), error = %e, "Primary policy failed");
            }
        }

        if let Some(secondary) = &self.secondary {
            match relieve(secondary.as_ref(), memory, ctx).await {
                Ok(pruned) => return Some(Ok(pruned)),
                Err(e) => {
                    tracing::warn!(policy = secondary.name(), error = %e, "Secondary policy failed");
                }
            }
        }

        Some(Ok(memory.clone()))
    }
}
