//! Vector provider contract

use super::HealthReport;
use crate::error::RmemResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Open key/value metadata attached to documents and results
pub type Metadata = HashMap<String, Value>;

/// Indexed content unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorDocument {
    /// Document id (unique within its namespace)
    pub id: String,

    /// Text content
    pub content: String,

    /// Optional precomputed embedding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    /// Metadata used for filtering, grouping and ranking
    #[serde(default)]
    pub metadata: Metadata,

    /// Optional namespace (unscoped when `None`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl VectorDocument {
    /// Create a document in the unscoped namespace
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            embedding: None,
            metadata: Metadata::new(),
            namespace: None,
        }
    }

    /// Place the document in a namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Attach a precomputed embedding
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Replace all metadata
    pub fn with_metadata_map(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Partial update applied by [`VectorProvider::update`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentPatch {
    /// New content
    pub content: Option<String>,

    /// New embedding
    pub embedding: Option<Vec<f32>>,

    /// Metadata entries merged over the existing ones
    pub metadata: Option<Metadata>,
}

/// Similarity query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorQuery {
    /// Free-text query
    pub text: Option<String>,

    /// Precomputed query embedding
    pub embedding: Option<Vec<f32>>,

    /// Namespace to search (unscoped when `None`)
    pub namespace: Option<String>,

    /// Metadata equality filter
    pub filter: Metadata,

    /// Maximum number of results
    pub limit: usize,

    /// Minimum score for a result to be returned
    pub min_score: Option<f32>,

    /// Return document content
    pub include_content: bool,

    /// Return document metadata
    pub include_metadata: bool,
}

impl Default for VectorQuery {
    fn default() -> Self {
        Self {
            text: None,
            embedding: None,
            namespace: None,
            filter: Metadata::new(),
            limit: 10,
            min_score: None,
            include_content: true,
            include_metadata: true,
        }
    }
}

impl VectorQuery {
    /// Free-text query
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Embedding query
    pub fn embedding(embedding: Vec<f32>) -> Self {
        Self {
            embedding: Some(embedding),
            ..Self::default()
        }
    }

    /// Restrict to a namespace
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the result limit
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Set the minimum score
    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    /// Require a metadata field to equal a value
    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }
}

/// Single search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorSearchResult {
    /// Document id
    pub id: String,

    /// Similarity score in `[0, 1]`, higher is more similar
    pub score: f32,

    /// Content, when requested
    pub content: Option<String>,

    /// Metadata, when requested
    pub metadata: Option<Metadata>,

    /// Namespace the document lives in
    pub namespace: Option<String>,
}

/// Vector storage backend.
///
/// `index` upserts by id within a namespace; `search` returns results in
/// descending score order.
#[async_trait::async_trait]
pub trait VectorProvider: Send + Sync {
    /// Provider name used in logs and errors
    fn name(&self) -> &'static str {
        "vector"
    }

    /// Prepare the backend for use
    async fn initialize(&self) -> RmemResult<()>;

    /// Release backend resources
    async fn close(&self) -> RmemResult<()>;

    /// Report backend health
    async fn health(&self) -> RmemResult<HealthReport>;

    /// Insert or replace documents
    async fn index(&self, documents: Vec<VectorDocument>) -> RmemResult<()>;

    /// Similarity search
    async fn search(&self, query: VectorQuery) -> RmemResult<Vec<VectorSearchResult>>;

    /// Partially update a document; fails with not-found if it is missing
    async fn update(&self, id: &str, namespace: Option<&str>, patch: DocumentPatch) -> RmemResult<()>;

    /// Delete documents by id, returning how many existed
    async fn delete(&self, ids: &[String], namespace: Option<&str>) -> RmemResult<usize>;

    /// Number of documents in a namespace, or in all namespaces when `None`
    async fn count(&self, namespace: Option<&str>) -> RmemResult<usize>;
}
