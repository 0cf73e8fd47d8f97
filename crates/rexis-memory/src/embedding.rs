//! Embeddings and text similarity
//!
//! The engine never generates embeddings on its own; backends may score with
//! precomputed vectors, with an attached [`EmbeddingProvider`], or lexically.

use crate::error::{RmemError, RmemResult};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

/// Dense vector tagged with the model that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub dimensions: usize,
    pub model: String,
}

impl Embedding {
    pub fn new(vector: Vec<f32>, model: impl Into<String>) -> Self {
        Self {
            dimensions: vector.len(),
            vector,
            model: model.into(),
        }
    }

    pub fn cosine_similarity(&self, other: &Embedding) -> RmemResult<f32> {
        cosine_similarity(&self.vector, &other.vector)
    }

    pub fn euclidean_distance(&self, other: &Embedding) -> RmemResult<f32> {
        check_dimensions(&self.vector, &other.vector)?;
        Ok(self
            .vector
            .iter()
            .zip(&other.vector)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt())
    }
}

fn check_dimensions(a: &[f32], b: &[f32]) -> RmemResult<()> {
    if a.len() == b.len() {
        Ok(())
    } else {
        Err(RmemError::validation(
            "embedding_dimensions",
            "dimensions must match",
            format!("{} vs {}", a.len(), b.len()),
        ))
    }
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity of two raw vectors; zero when either is the zero vector
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> RmemResult<f32> {
    check_dimensions(a, b)?;

    let denominator = norm(a) * norm(b);
    if denominator == 0.0 {
        return Ok(0.0);
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    Ok(dot / denominator)
}

/// Lowercased alphanumeric tokens of a text
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Token-set Jaccard similarity in `[0, 1]`
pub fn lexical_similarity(a: &str, b: &str) -> f32 {
    let left: HashSet<String> = tokenize(a).into_iter().collect();
    let right: HashSet<String> = tokenize(b).into_iter().collect();
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let shared = left.intersection(&right).count();
    shared as f32 / (left.len() + right.len() - shared) as f32
}

/// Source of embeddings for vector backends
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> RmemResult<Embedding>;

    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;
}

/// Feature-hashing embedder: every token increments one hashed bucket and the
/// result is L2-normalised. Texts sharing tokens land close to each other; it
/// is not a semantic model.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    dimensions: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        (hasher.finish() % self.dimensions as u64) as usize
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    async fn embed(&self, text: &str) -> RmemResult<Embedding> {
        let mut vector = vec![0.0_f32; self.dimensions];
        for token in tokenize(text) {
            vector[self.bucket(&token)] += 1.0;
        }

        let length = norm(&vector);
        if length > 0.0 {
            for x in vector.iter_mut() {
                *x /= length;
            }
        }

        Ok(Embedding::new(vector, self.model_name()))
    }

    fn model_name(&self) -> &str {
        "hash-embedding"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_cosine_of_parallel_and_orthogonal_vectors() {
        let x = Embedding::new(vec![2.0, 0.0], "unit");
        let x2 = Embedding::new(vec![5.0, 0.0], "unit");
        let y = Embedding::new(vec![0.0, 3.0], "unit");

        assert!((x.cosine_similarity(&x2).unwrap() - 1.0).abs() < 1e-6);
        assert!(x.cosine_similarity(&y).unwrap().abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]).unwrap(), 0.0);
    }

    #[test]
    fn test_mismatched_dimensions_are_rejected() {
        let err = cosine_similarity(&[1.0, 0.0], &[1.0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let a = Embedding::new(vec![1.0], "unit");
        let b = Embedding::new(vec![1.0, 2.0], "unit");
        assert_eq!(a.euclidean_distance(&b).unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0], "unit");
        let b = Embedding::new(vec![3.0, 4.0], "unit");
        assert!((a.euclidean_distance(&b).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_lexical_similarity() {
        assert_eq!(lexical_similarity("foo bar", "Foo, bar!"), 1.0);
        assert!((lexical_similarity("foo bar", "foo bar baz") - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(lexical_similarity("foo", "qux"), 0.0);
        assert_eq!(lexical_similarity("", "qux"), 0.0);
        assert_eq!(tokenize("web_search(rust)"), vec!["web", "search", "rust"]);
    }

    #[tokio::test]
    async fn test_hash_embeddings_ignore_case_and_punctuation() {
        let embedder = HashEmbeddingProvider::new(64);

        let a = embedder.embed("Deploy the API").await.unwrap();
        let b = embedder.embed("deploy, the api!").await.unwrap();
        let c = embedder.embed("quarterly revenue report").await.unwrap();

        assert_eq!(a.dimensions, 64);
        assert_eq!(a.model, "hash-embedding");
        assert!((a.cosine_similarity(&b).unwrap() - 1.0).abs() < 1e-6);
        assert!(a.cosine_similarity(&c).unwrap() < 1.0);
        assert!((norm(&a.vector) - 1.0).abs() < 1e-5);
    }
}
