//! Factual memory - verifiable statements
//!
//! Facts live at `fact:<id>` in key-value storage and are indexed into the
//! `facts` vector namespace so they can be searched and cross-checked.
//! Verification compares a fact against its nearest neighbors and moves its
//! confidence up for close matches and down for distant ones.

use crate::config::FactSettings;
use crate::error::{RmemError, RmemResult};
use crate::storage::{
    DocumentPatch, KeyValueProvider, Metadata, SetOptions, VectorDocument, VectorProvider,
    VectorQuery,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Vector namespace of fact statements
pub const FACTS_NAMESPACE: &str = "facts";

/// Outcome of the last verification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    /// When verification ran
    pub verified_at: chrono::DateTime<chrono::Utc>,

    /// Neighbor facts scoring above the supporting threshold
    pub supporting: Vec<String>,

    /// Neighbor facts scoring below the conflicting threshold
    pub conflicting: Vec<String>,

    /// Confidence before verification
    pub previous_confidence: f64,

    /// Confidence after verification
    pub confidence: f64,
}

/// A verifiable statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Unique identifier
    pub id: String,

    /// The statement itself
    pub statement: String,

    /// Confidence score (0.0 to 1.0)
    pub confidence: f64,

    /// Where the fact came from
    pub source: String,

    /// Entity names the fact mentions
    #[serde(default)]
    pub entities: Vec<String>,

    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Context the fact was learned in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// Last verification outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,

    /// When the fact was created
    pub created_at: chrono::DateTime<chrono::Utc>,

    /// When the fact was last updated
    pub updated_at: chrono::DateTime<chrono::Utc>,

    /// Optional metadata
    #[serde(default)]
    pub metadata: Metadata,
}

impl Fact {
    /// Create a new fact with neutral confidence
    pub fn new(statement: impl Into<String>, source: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            statement: statement.into(),
            confidence: 0.5,
            source: source.into(),
            entities: Vec::new(),
            tags: Vec::new(),
            context_id: None,
            verification: None,
            created_at: now,
            updated_at: now,
            metadata: Metadata::new(),
        }
    }

    /// Use an explicit id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set confidence score
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Add an entity name
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entities.push(entity.into());
        self
    }

    /// Add a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Scope to a context
    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether every tag in `tags` is present
    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.tags.contains(t))
    }

    /// Case-insensitive entity membership
    pub fn mentions(&self, entity: &str) -> bool {
        self.entities.iter().any(|e| e.eq_ignore_ascii_case(entity))
    }
}

/// Fact search hit
#[derive(Debug, Clone)]
pub struct FactMatch {
    pub fact: Fact,
    pub score: f32,
}

/// Fact storage and verification
pub struct FactStore {
    kv: Arc<dyn KeyValueProvider>,
    vector: Arc<dyn VectorProvider>,
    settings: FactSettings,
}

impl FactStore {
    /// Create a fact store
    pub fn new(
        kv: Arc<dyn KeyValueProvider>,
        vector: Arc<dyn VectorProvider>,
        settings: FactSettings,
    ) -> Self {
        Self {
            kv,
            vector,
            settings,
        }
    }

    /// Record key
    pub fn fact_key(id: &str) -> String {
        format!("fact:{}", id)
    }

    fn document(fact: &Fact) -> VectorDocument {
        VectorDocument::new(&fact.id, &fact.statement)
            .with_namespace(FACTS_NAMESPACE)
            .with_metadata("type", "fact")
            .with_metadata("factId", fact.id.as_str())
            .with_metadata("confidence", fact.confidence)
            .with_metadata("source", fact.source.as_str())
            .with_metadata("tags", json!(fact.tags))
            .with_metadata("entities", json!(fact.entities))
            .with_metadata("timestamp", fact.updated_at.timestamp_millis())
    }

    async fn write(&self, fact: &Fact) -> RmemResult<()> {
        let value =
            serde_json::to_value(fact).map_err(|e| RmemError::serialization("fact_store", e))?;
        self.kv
            .set(&Self::fact_key(&fact.id), value, SetOptions::new())
            .await
    }

    /// Store (or replace) a fact and index its statement
    pub async fn store(&self, fact: Fact) -> RmemResult<Fact> {
        if fact.statement.trim().is_empty() {
            return Err(RmemError::validation(
                "statement",
                "must not be empty",
                format!("{:?}", fact.statement),
            ));
        }

        let mut fact = fact;
        fact.confidence = fact.confidence.clamp(0.0, 1.0);

        self.write(&fact).await?;
        self.vector.index(vec![Self::document(&fact)]).await?;

        tracing::debug!(fact_id = %fact.id, confidence = fact.confidence, "Fact stored");
        Ok(fact)
    }

    /// Read a fact
    pub async fn get(&self, id: &str) -> RmemResult<Option<Fact>> {
        match self.kv.get(&Self::fact_key(id)).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| RmemError::serialization("fact_get", e)),
            None => Ok(None),
        }
    }

    async fn require(&self, id: &str) -> RmemResult<Fact> {
        self.get(id)
            .await?
            .ok_or_else(|| RmemError::not_found("fact", id))
    }

    /// Replace an existing fact
    pub async fn update(&self, fact: Fact) -> RmemResult<Fact> {
        let existing = self.require(&fact.id).await?;

        let mut fact = fact;
        fact.created_at = existing.created_at;
        fact.updated_at = chrono::Utc::now();
        self.store(fact).await
    }

    /// Delete a fact and its index entry
    pub async fn delete(&self, id: &str) -> RmemResult<bool> {
        self.vector
            .delete(&[id.to_string()], Some(FACTS_NAMESPACE))
            .await?;
        self.kv.delete(&Self::fact_key(id)).await
    }

    /// Every stored fact
    pub async fn all(&self) -> RmemResult<Vec<Fact>> {
        let records: Vec<(String, Value)> = self.kv.scan(Some("fact:*")).try_collect().await?;

        let mut facts = Vec::with_capacity(records.len());
        for (key, value) in records {
            match serde_json::from_value::<Fact>(value) {
                Ok(fact) => facts.push(fact),
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping unreadable fact"),
            }
        }
        Ok(facts)
    }

    /// Facts carrying every tag in `tags`
    pub async fn find_by_tags(&self, tags: &[String]) -> RmemResult<Vec<Fact>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|f| f.has_tags(tags))
            .collect())
    }

    /// Facts mentioning an entity
    pub async fn find_by_entity(&self, entity: &str) -> RmemResult<Vec<Fact>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|f| f.mentions(entity))
            .collect())
    }

    /// Similarity search over statements
    pub async fn search(&self, query: &str, limit: usize) -> RmemResult<Vec<FactMatch>> {
        let hits = self
            .vector
            .search(
                VectorQuery::text(query)
                    .in_namespace(FACTS_NAMESPACE)
                    .with_limit(limit),
            )
            .await?;

        let mut matches = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Some(fact) = self.get(&hit.id).await? {
                matches.push(FactMatch {
                    fact,
                    score: hit.score,
                });
            }
        }
        Ok(matches)
    }

    async fn set_confidence(&self, mut fact: Fact, confidence: f64) -> RmemResult<Fact> {
        fact.confidence = confidence.clamp(0.0, 1.0);
        fact.updated_at = chrono::Utc::now();
        self.write(&fact).await?;

        let mut metadata = Metadata::new();
        metadata.insert("confidence".to_string(), json!(fact.confidence));
        self.vector
            .update(
                &fact.id,
                Some(FACTS_NAMESPACE),
                DocumentPatch {
                    metadata: Some(metadata),
                    ..DocumentPatch::default()
                },
            )
            .await?;

        Ok(fact)
    }

    /// Shift a fact's confidence by `delta`, clamped to `[0, 1]`
    pub async fn update_confidence(&self, id: &str, delta: f64) -> RmemResult<f64> {
        let fact = self.require(id).await?;
        let target = if delta.is_finite() {
            fact.confidence + delta
        } else if delta > 0.0 {
            1.0
        } else {
            0.0
        };

        Ok(self.set_confidence(fact, target).await?.confidence)
    }

    /// Cross-check a fact against its nearest neighbors and recompute its
    /// confidence
    pub async fn verify(&self, id: &str) -> RmemResult<Fact> {
        let fact = self.require(id).await?;

        let neighbors = self
            .vector
            .search(
                VectorQuery::text(&fact.statement)
                    .in_namespace(FACTS_NAMESPACE)
                    .with_limit(self.settings.verification_neighbors + 1),
            )
            .await?;

        let mut supporting = Vec::new();
        let mut conflicting = Vec::new();
        for hit in neighbors.into_iter().filter(|h| h.id != fact.id) {
            if hit.score > self.settings.supporting_threshold {
                supporting.push(hit.id);
            } else if hit.score < self.settings.conflicting_threshold {
                conflicting.push(hit.id);
            }
        }

        let boost = (0.1 * supporting.len() as f64).min(0.3);
        let penalty = (0.2 * conflicting.len() as f64).min(0.5);
        let previous = fact.confidence;
        let confidence = (previous + boost - penalty).clamp(0.0, 1.0);

        tracing::debug!(
            fact_id = %fact.id,
            supporting = supporting.len(),
            conflicting = conflicting.len(),
            previous = previous,
            confidence = confidence,
            "Fact verified"
        );

        let mut fact = fact;
        fact.verification = Some(Verification {
            verified_at: chrono::Utc::now(),
            supporting,
            conflicting,
            previous_confidence: previous,
            confidence,
        });
        self.set_confidence(fact, confidence).await
    }
}
