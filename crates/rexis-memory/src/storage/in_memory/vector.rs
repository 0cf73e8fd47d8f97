use super::ReadyFlag;
use crate::embedding::{cosine_similarity, lexical_similarity, EmbeddingProvider};
use crate::error::{RmemError, RmemResult};
use crate::storage::vector::{
    DocumentPatch, VectorDocument, VectorProvider, VectorQuery, VectorSearchResult,
};
use crate::storage::HealthReport;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

const PROVIDER: &str = "vector";

/// Vector provider backed by process-local maps, one per namespace.
///
/// Scoring: cosine similarity when both query and document carry embeddings
/// of equal dimension (or an embedder is attached), token-set Jaccard
/// similarity otherwise. Documents scoring zero are never returned.
#[derive(Default)]
pub struct InMemoryVectorProvider {
    namespaces: RwLock<HashMap<String, HashMap<String, VectorDocument>>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    ready: ReadyFlag,
}

impl InMemoryVectorProvider {
    /// Create an uninitialized provider with lexical scoring
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider that embeds documents and text queries itself
    pub fn with_embedder(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            embedder: Some(embedder),
            ..Self::default()
        }
    }

    fn namespace_key(namespace: Option<&str>) -> String {
        namespace.unwrap_or_default().to_string()
    }

    fn score(
        query_text: Option<&str>,
        query_embedding: Option<&[f32]>,
        doc: &VectorDocument,
    ) -> f32 {
        if let (Some(q), Some(d)) = (query_embedding, doc.embedding.as_deref()) {
            if let Ok(sim) = cosine_similarity(q, d) {
                return sim.clamp(0.0, 1.0);
            }
        }

        match query_text {
            Some(text) => lexical_similarity(text, &doc.content),
            None => 0.0,
        }
    }
}

#[async_trait::async_trait]
impl VectorProvider for InMemoryVectorProvider {
    async fn initialize(&self) -> RmemResult<()> {
        self.ready.set(true);
        tracing::debug!(
            provider = PROVIDER,
            embedder = self.embedder.as_ref().map(|e| e.model_name()).unwrap_or("lexical"),
            "In-memory vector provider initialized"
        );
        Ok(())
    }

    async fn close(&self) -> RmemResult<()> {
        self.ready.set(false);
        Ok(())
    }

    async fn health(&self) -> RmemResult<HealthReport> {
        if !self.ready.is_ready() {
            return Ok(HealthReport::unhealthy("not initialized"));
        }
        let namespaces = self.namespaces.read();
        let documents: usize = namespaces.values().map(|docs| docs.len()).sum();
        Ok(HealthReport::healthy()
            .with_detail("documents", documents)
            .with_detail("namespaces", namespaces.len()))
    }

    async fn index(&self, documents: Vec<VectorDocument>) -> RmemResult<()> {
        self.ready.ensure(PROVIDER)?;

        let mut prepared = Vec::with_capacity(documents.len());
        for mut doc in documents {
            if doc.id.is_empty() {
                return Err(RmemError::validation("id", "must not be empty", "\"\""));
            }
            if doc.embedding.is_none() {
                if let Some(embedder) = &self.embedder {
                    doc.embedding = Some(embedder.embed(&doc.content).await?.vector);
                }
            }
            prepared.push(doc);
        }

        let mut namespaces = self.namespaces.write();
        for doc in prepared {
            namespaces
                .entry(Self::namespace_key(doc.namespace.as_deref()))
                .or_default()
                .insert(doc.id.clone(), doc);
        }

        Ok(())
    }

    async fn search(&self, query: VectorQuery) -> RmemResult<Vec<VectorSearchResult>> {
        self.ready.ensure(PROVIDER)?;

        let query_embedding = match (&query.embedding, &query.text, &self.embedder) {
            (Some(embedding), _, _) => Some(embedding.clone()),
            (None, Some(text), Some(embedder)) => Some(embedder.embed(text).await?.vector),
            _ => None,
        };

        let candidates: Vec<VectorDocument> = {
            let namespaces = self.namespaces.read();
            namespaces
                .get(&Self::namespace_key(query.namespace.as_deref()))
                .map(|docs| docs.values().cloned().collect())
                .unwrap_or_default()
        };

        let min_score = query.min_score.unwrap_or(0.0);
        let mut scored: Vec<(f32, VectorDocument)> = candidates
            .into_iter()
            .filter(|doc| {
                query
                    .filter
                    .iter()
                    .all(|(k, v)| doc.metadata.get(k) == Some(v))
            })
            .map(|doc| {
                let score = Self::score(query.text.as_deref(), query_embedding.as_deref(), &doc);
                (score, doc)
            })
            .filter(|(score, _)| *score > 0.0 && *score >= min_score)
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
        scored.truncate(query.limit);

        Ok(scored
            .into_iter()
            .map(|(score, doc)| VectorSearchResult {
                id: doc.id,
                score,
                content: query.include_content.then_some(doc.content),
                metadata: query.include_metadata.then_some(doc.metadata),
                namespace: doc.namespace,
            })
            .collect())
    }

    async fn update(&self, id: &str, namespace: Option<&str>, patch: DocumentPatch) -> RmemResult<()> {
        self.ready.ensure(PROVIDER)?;

        let reembedded = match (&patch.content, &patch.embedding, &self.embedder) {
            (Some(content), None, Some(embedder)) => Some(embedder.embed(content).await?.vector),
            _ => None,
        };

        let mut namespaces = self.namespaces.write();
        let doc = namespaces
            .get_mut(&Self::namespace_key(namespace))
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| RmemError::not_found("vector document", id))?;

        if let Some(content) = patch.content {
            doc.content = content;
        }
        if let Some(embedding) = patch.embedding.or(reembedded) {
            doc.embedding = Some(embedding);
        }
        if let Some(metadata) = patch.metadata {
            doc.metadata.extend(metadata);
        }

        Ok(())
    }

    async fn delete(&self, ids: &[String], namespace: Option<&str>) -> RmemResult<usize> {
        self.ready.ensure(PROVIDER)?;

        let mut namespaces = self.namespaces.write();
        let Some(docs) = namespaces.get_mut(&Self::namespace_key(namespace)) else {
            return Ok(0);
        };

        Ok(ids.iter().filter(|id| docs.remove(id.as_str()).is_some()).count())
    }

    async fn count(&self, namespace: Option<&str>) -> RmemResult<usize> {
        self.ready.ensure(PROVIDER)?;

        let namespaces = self.namespaces.read();
        Ok(match namespace {
            Some(ns) => namespaces.get(ns).map(|docs| docs.len()).unwrap_or(0),
            None => namespaces.values().map(|docs| docs.len()).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbeddingProvider;
    use crate::error::ErrorKind;
    use serde_json::json;

    async fn ready_provider() -> InMemoryVectorProvider {
        let vector = InMemoryVectorProvider::new();
        vector.initialize().await.unwrap();
        vector
    }

    #[tokio::test]
    async fn test_not_ready() {
        let vector = InMemoryVectorProvider::new();
        let err = vector.search(VectorQuery::text("x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotReady);
    }

    #[tokio::test]
    async fn test_index_and_search_ranked() {
        let vector = ready_provider().await;
        vector
            .index(vec![
                VectorDocument::new("a", "rust async runtime"),
                VectorDocument::new("b", "rust ownership and borrowing"),
                VectorDocument::new("c", "gardening tips"),
            ])
            .await
            .unwrap();

        let results = vector.search(VectorQuery::text("rust async")).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "a");
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn test_upsert_namespaces_and_filter() {
        let vector = ready_provider().await;
        vector
            .index(vec![
                VectorDocument::new("a", "deploy service").with_metadata("env", "prod"),
                VectorDocument::new("b", "deploy service").with_metadata("env", "dev"),
                VectorDocument::new("a", "deploy service").with_namespace("episodes:c1"),
            ])
            .await
            .unwrap();

        // Upsert replaces within the namespace
        vector
            .index(vec![VectorDocument::new("a", "deploy service again").with_metadata("env", "prod")])
            .await
            .unwrap();

        assert_eq!(vector.count(None).await.unwrap(), 3);
        assert_eq!(vector.count(Some("episodes:c1")).await.unwrap(), 1);

        let results = vector
            .search(VectorQuery::text("deploy service").with_filter("env", "prod"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content.as_deref(), Some("deploy service again"));

        let scoped = vector
            .search(VectorQuery::text("deploy").in_namespace("episodes:c1"))
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].namespace.as_deref(), Some("episodes:c1"));
    }

    #[tokio::test]
    async fn test_min_score_limit_and_include_flags() {
        let vector = ready_provider().await;
        vector
            .index(vec![
                VectorDocument::new("exact", "foo bar").with_metadata("k", 1),
                VectorDocument::new("partial", "foo bar baz qux"),
            ])
            .await
            .unwrap();

        let mut query = VectorQuery::text("foo bar").with_min_score(0.9);
        query.include_content = false;
        query.include_metadata = false;

        let results = vector.search(query).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "exact");
        assert!(results[0].content.is_none());
        assert!(results[0].metadata.is_none());

        let limited = vector.search(VectorQuery::text("foo").with_limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let vector = ready_provider().await;
        vector
            .index(vec![VectorDocument::new("a", "old text").with_metadata("v", 1)])
            .await
            .unwrap();

        let mut metadata = crate::storage::Metadata::new();
        metadata.insert("extra".to_string(), json!(true));
        vector
            .update(
                "a",
                None,
                DocumentPatch {
                    content: Some("new text".to_string()),
                    embedding: None,
                    metadata: Some(metadata),
                },
            )
            .await
            .unwrap();

        let results = vector.search(VectorQuery::text("new text")).await.unwrap();
        let meta = results[0].metadata.clone().unwrap();
        assert_eq!(meta.get("v"), Some(&json!(1)));
        assert_eq!(meta.get("extra"), Some(&json!(true)));

        let err = vector
            .update("missing", None, DocumentPatch::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert_eq!(vector.delete(&["a".to_string(), "zzz".to_string()], None).await.unwrap(), 1);
        assert_eq!(vector.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_embedder_backed_search() {
        let vector = InMemoryVectorProvider::with_embedder(Arc::new(HashEmbeddingProvider::new(256)));
        vector.initialize().await.unwrap();
        vector
            .index(vec![
                VectorDocument::new("a", "the cat sat on the mat"),
                VectorDocument::new("b", "stock market report"),
            ])
            .await
            .unwrap();

        let results = vector.search(VectorQuery::text("cat on mat")).await.unwrap();
        assert_eq!(results[0].id, "a");
    }
}
