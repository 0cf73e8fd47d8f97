//! Semantic memory - learned concepts and action patterns
//!
//! Records live at `semantic:<id>`. Concepts are indexed into the `concepts`
//! vector namespace; patterns are indexed by their trigger text into
//! `patterns`, which is how repeated occurrences of the same trigger are
//! recognized and folded into one pattern.

use crate::config::SemanticSettings;
use crate::error::{RmemError, RmemResult};
use crate::lock::ContextLockManager;
use crate::storage::{
    KeyValueProvider, Metadata, SetOptions, VectorDocument, VectorProvider, VectorQuery,
};
use crate::working::LogEntry;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Vector namespace of concepts
pub const CONCEPTS_NAMESPACE: &str = "concepts";

/// Vector namespace of pattern triggers
pub const PATTERNS_NAMESPACE: &str = "patterns";

/// Lock serializing pattern learning; similar triggers fold into one record
const PATTERN_LOCK_KEY: &str = "semantic:patterns";

/// A learned generalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticConcept {
    /// Unique identifier
    pub id: String,

    /// Concept category
    #[serde(rename = "type")]
    pub concept_type: String,

    /// Concept text
    pub content: String,

    /// Confidence score (0.0 to 1.0)
    pub confidence: f64,

    /// Times the concept was observed
    pub occurrences: u32,

    /// Optional metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// When the concept was created
    pub created_at: chrono::DateTime<chrono::Utc>,

    /// When the concept was last updated
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl SemanticConcept {
    /// Create a new concept
    pub fn new(concept_type: impl Into<String>, content: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            concept_type: concept_type.into(),
            content: content.into(),
            confidence: 0.5,
            occurrences: 1,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set confidence score
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A trigger/response pair learned from action outcomes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    /// Unique identifier
    pub id: String,

    /// What the pattern reacts to
    pub trigger: String,

    /// What worked last
    pub response: String,

    /// Running-average confidence (0.0 to 1.0)
    pub confidence: f64,

    /// Times the trigger was seen
    pub occurrences: u32,

    /// Fraction of successful occurrences
    pub success_rate: f64,

    /// Optional metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// When the pattern was created
    pub created_at: chrono::DateTime<chrono::Utc>,

    /// When the pattern was last updated
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Pattern {
    const SUCCESS_CONFIDENCE: f64 = 0.8;
    const FAILURE_CONFIDENCE: f64 = 0.3;

    /// First occurrence of a trigger
    pub fn new(trigger: impl Into<String>, response: impl Into<String>, success: bool) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trigger: trigger.into(),
            response: response.into(),
            confidence: Self::observed_confidence(success),
            occurrences: 1,
            success_rate: if success { 1.0 } else { 0.0 },
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn observed_confidence(success: bool) -> f64 {
        if success {
            Self::SUCCESS_CONFIDENCE
        } else {
            Self::FAILURE_CONFIDENCE
        }
    }

    /// Fold one more occurrence into the running averages
    pub fn record_occurrence(&mut self, response: impl Into<String>, success: bool) {
        let n = self.occurrences as f64;
        let outcome = if success { 1.0 } else { 0.0 };

        self.confidence =
            ((self.confidence * n + Self::observed_confidence(success)) / (n + 1.0)).clamp(0.0, 1.0);
        self.success_rate = (self.success_rate * n + outcome) / (n + 1.0);
        self.occurrences += 1;
        if success {
            self.response = response.into();
        }
        self.updated_at = chrono::Utc::now();
    }

    /// Ranking weight: success rate times occurrences
    pub fn relevance(&self) -> f64 {
        self.success_rate * self.occurrences as f64
    }
}

/// Stored semantic record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SemanticRecord {
    Concept(SemanticConcept),
    Pattern(Pattern),
}

/// Concept search hit
#[derive(Debug, Clone)]
pub struct ConceptMatch {
    pub concept: SemanticConcept,
    pub score: f32,
}

/// Pattern search hit
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub pattern: Pattern,
    pub score: f32,
}

/// Trigger text of an action entry
pub fn pattern_trigger(action: &LogEntry) -> String {
    let name = action.name.as_deref().unwrap_or(action.kind.as_str());
    let text = action.text();
    if text.is_empty() {
        name.to_string()
    } else {
        format!("{} {}", name, text)
    }
}

/// Semantic memory for concepts and patterns
pub struct SemanticMemory {
    kv: Arc<dyn KeyValueProvider>,
    vector: Arc<dyn VectorProvider>,
    settings: SemanticSettings,
    locks: Arc<ContextLockManager>,
}

impl SemanticMemory {
    /// Create semantic memory
    pub fn new(
        kv: Arc<dyn KeyValueProvider>,
        vector: Arc<dyn VectorProvider>,
        settings: SemanticSettings,
    ) -> Self {
        Self {
            kv,
            vector,
            settings,
            locks: Arc::new(ContextLockManager::new()),
        }
    }

    /// Share the engine's lock table
    pub fn with_locks(mut self, locks: Arc<ContextLockManager>) -> Self {
        self.locks = locks;
        self
    }

    /// Record key
    pub fn record_key(id: &str) -> String {
        format!("semantic:{}", id)
    }

    async fn write(&self, id: &str, record: &SemanticRecord) -> RmemResult<()> {
        let value = serde_json::to_value(record)
            .map_err(|e| RmemError::serialization("semantic_store", e))?;
        self.kv
            .set(&Self::record_key(id), value, SetOptions::new())
            .await
    }

    async fn read(&self, id: &str) -> RmemResult<Option<SemanticRecord>> {
        match self.kv.get(&Self::record_key(id)).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| RmemError::serialization("semantic_get", e)),
            None => Ok(None),
        }
    }

    /// Store a concept and index its content
    pub async fn store_concept(&self, concept: SemanticConcept) -> RmemResult<SemanticConcept> {
        self.write(&concept.id, &SemanticRecord::Concept(concept.clone()))
            .await?;

        self.vector
            .index(vec![VectorDocument::new(&concept.id, &concept.content)
                .with_namespace(CONCEPTS_NAMESPACE)
                .with_metadata("type", "concept")
                .with_metadata("conceptType", concept.concept_type.as_str())
                .with_metadata("confidence", concept.confidence)
                .with_metadata("timestamp", concept.updated_at.timestamp_millis())])
            .await?;

        Ok(concept)
    }

    /// Read a concept
    pub async fn get_concept(&self, id: &str) -> RmemResult<Option<SemanticConcept>> {
        Ok(match self.read(id).await? {
            Some(SemanticRecord::Concept(concept)) => Some(concept),
            _ => None,
        })
    }

    /// Similarity search over concepts
    pub async fn search_concepts(&self, query: &str, limit: usize) -> RmemResult<Vec<ConceptMatch>> {
        let hits = self
            .vector
            .search(
                VectorQuery::text(query)
                    .in_namespace(CONCEPTS_NAMESPACE)
                    .with_limit(limit),
            )
            .await?;

        let mut matches = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Some(concept) = self.get_concept(&hit.id).await? {
                matches.push(ConceptMatch {
                    concept,
                    score: hit.score,
                });
            }
        }
        Ok(matches)
    }

    async fn store_pattern(&self, pattern: &Pattern) -> RmemResult<()> {
        self.write(&pattern.id, &SemanticRecord::Pattern(pattern.clone()))
            .await?;

        self.vector
            .index(vec![VectorDocument::new(&pattern.id, &pattern.trigger)
                .with_namespace(PATTERNS_NAMESPACE)
                .with_metadata("type", "pattern")
                .with_metadata("response", pattern.response.as_str())
                .with_metadata("confidence", pattern.confidence)
                .with_metadata("successRate", pattern.success_rate)
                .with_metadata("occurrences", pattern.occurrences)
                .with_metadata("timestamp", pattern.updated_at.timestamp_millis())])
            .await
    }

    /// Read a pattern
    pub async fn get_pattern(&self, id: &str) -> RmemResult<Option<Pattern>> {
        Ok(match self.read(id).await? {
            Some(SemanticRecord::Pattern(pattern)) => Some(pattern),
            _ => None,
        })
    }

    /// Every stored pattern
    pub async fn list_patterns(&self) -> RmemResult<Vec<Pattern>> {
        let records: Vec<(String, Value)> = self.kv.scan(Some("semantic:*")).try_collect().await?;

        let mut patterns = Vec::new();
        for (key, value) in records {
            match serde_json::from_value::<SemanticRecord>(value) {
                Ok(SemanticRecord::Pattern(pattern)) => patterns.push(pattern),
                Ok(SemanticRecord::Concept(_)) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping unreadable semantic record"),
            }
        }
        Ok(patterns)
    }

    /// Learn from an action and its result.
    ///
    /// A stored pattern whose trigger is similar enough absorbs the
    /// occurrence; otherwise a new pattern is created.
    pub async fn learn_from_action(&self, action: &LogEntry, result: &LogEntry) -> RmemResult<Pattern> {
        let trigger = pattern_trigger(action);
        let response = result.text();
        let success = result.error.is_none();

        self.locks
            .with_lock(PATTERN_LOCK_KEY, || self.fold_pattern(trigger, response, success))
            .await
    }

    async fn fold_pattern(&self, trigger: String, response: String, success: bool) -> RmemResult<Pattern> {
        let nearest = self
            .vector
            .search(
                VectorQuery::text(&trigger)
                    .in_namespace(PATTERNS_NAMESPACE)
                    .with_limit(1)
                    .with_min_score(self.settings.pattern_similarity),
            )
            .await?;

        let existing = match nearest.first() {
            Some(hit) => self.get_pattern(&hit.id).await?,
            None => None,
        };

        let pattern = match existing {
            Some(mut pattern) => {
                pattern.record_occurrence(response, success);
                tracing::debug!(
                    pattern_id = %pattern.id,
                    occurrences = pattern.occurrences,
                    success_rate = pattern.success_rate,
                    "Pattern reinforced"
                );
                pattern
            }
            None => {
                let pattern = Pattern::new(trigger, response, success);
                tracing::debug!(pattern_id = %pattern.id, "Pattern learned");
                pattern
            }
        };

        self.store_pattern(&pattern).await?;
        Ok(pattern)
    }

    /// Similarity search over pattern triggers
    pub async fn search_patterns(&self, query: &str, limit: usize) -> RmemResult<Vec<PatternMatch>> {
        let hits = self
            .vector
            .search(
                VectorQuery::text(query)
                    .in_namespace(PATTERNS_NAMESPACE)
                    .with_limit(limit),
            )
            .await?;

        let mut matches = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Some(pattern) = self.get_pattern(&hit.id).await? {
                matches.push(PatternMatch {
                    pattern,
                    score: hit.score,
                });
            }
        }
        Ok(matches)
    }

    /// Patterns matching `query`, ranked by success rate times occurrences
    pub async fn get_relevant_patterns(&self, query: &str) -> RmemResult<Vec<Pattern>> {
        let max = self.settings.max_relevant_patterns;
        let mut patterns: Vec<Pattern> = self
            .search_patterns(query, max.saturating_mul(5))
            .await?
            .into_iter()
            .map(|m| m.pattern)
            .collect();

        patterns.sort_by(|a, b| {
            b.relevance()
                .total_cmp(&a.relevance())
                .then_with(|| a.id.cmp(&b.id))
        });
        patterns.truncate(max);

        Ok(patterns)
    }

    /// Delete a concept or pattern
    pub async fn delete(&self, id: &str) -> RmemResult<bool> {
        let namespace = match self.read(id).await? {
            Some(SemanticRecord::Concept(_)) => CONCEPTS_NAMESPACE,
            Some(SemanticRecord::Pattern(_)) => PATTERNS_NAMESPACE,
            None => return Ok(false),
        };

        self.vector.delete(&[id.to_string()], Some(namespace)).await?;
        self.kv.delete(&Self::record_key(id)).await
    }
}
