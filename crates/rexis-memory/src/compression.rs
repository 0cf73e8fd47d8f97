//! Summarization seam for compression
//!
//! The engine never prompts a model directly. Callers hand in a
//! [`LanguageModel`]; the [`Summarizer`] asks it for a summary and falls back
//! to deterministic text whenever no model is attached or the call fails.

use crate::episodic::Episode;
use crate::error::{RmemError, RmemResult};
use crate::working::LogEntry;
use std::sync::Arc;

/// Text-completion collaborator supplied by the caller
#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete a prompt
    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;

    /// Model name used in logs
    fn name(&self) -> &str {
        "language-model"
    }
}

/// Produces summaries for log and episode compression
#[derive(Clone, Default)]
pub struct Summarizer {
    model: Option<Arc<dyn LanguageModel>>,
}

impl Summarizer {
    /// Summarizer backed by a language model
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model: Some(model) }
    }

    /// Summarizer that only produces deterministic text
    pub fn deterministic() -> Self {
        Self::default()
    }

    /// Build from an optional model
    pub fn from_option(model: Option<Arc<dyn LanguageModel>>) -> Self {
        Self { model }
    }

    /// Whether a model is attached
    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    /// Ask the model directly, surfacing failures
    pub async fn ask(&self, operation: &'static str, prompt: &str) -> RmemResult<Option<String>> {
        let Some(model) = &self.model else {
            return Ok(None);
        };

        let response = model
            .complete(prompt)
            .await
            .map_err(|e| RmemError::language_model(operation, e))?;

        let trimmed = response.trim();
        Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
    }

    async fn ask_or(&self, operation: &'static str, prompt: &str, fallback: String) -> String {
        match self.ask(operation, prompt).await {
            Ok(Some(summary)) => summary,
            Ok(None) => fallback,
            Err(e) => {
                tracing::warn!(
                    operation = operation,
                    error = %e,
                    "Summarization failed, using deterministic fallback"
                );
                fallback
            }
        }
    }

    /// Summarize working-memory entries; never fails
    pub async fn summarize_entries(&self, entries: &[LogEntry]) -> String {
        let fallback = format!("Compressed {} entries", entries.len());
        if self.model.is_none() || entries.is_empty() {
            return fallback;
        }

        let mut transcript = String::new();
        for entry in entries {
            match &entry.name {
                Some(name) => transcript.push_str(&format!("{} ({}): {}\n", entry.kind, name, entry.text())),
                None => transcript.push_str(&format!("{}: {}\n", entry.kind, entry.text())),
            }
        }

        let prompt = format!(
            "Summarize these agent log entries in 2-3 sentences, keeping facts and decisions:\n\n{}",
            transcript
        );
        self.ask_or("compress_entries", &prompt, fallback).await
    }

    /// Summarize several episodes into one; never fails
    pub async fn summarize_episodes(&self, episodes: &[Episode]) -> String {
        let joined: Vec<&str> = episodes.iter().map(|e| e.summary.as_str()).collect();
        let fallback = format!(
            "Compressed {} episodes: {}",
            episodes.len(),
            joined.join(" | ")
        );
        if self.model.is_none() || episodes.is_empty() {
            return fallback;
        }

        let prompt = format!(
            "Merge these episode summaries into one short summary:\n\n- {}",
            joined.join("\n- ")
        );
        self.ask_or("compress_episodes", &prompt, fallback).await
    }
}

impl std::fmt::Debug for Summarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Summarizer")
            .field("model", &self.model.as_ref().map(|m| m.name().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episodic::EpisodeType;

    struct EchoModel;

    #[async_trait::async_trait]
    impl LanguageModel for EchoModel {
        async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
            Ok(format!("  summary of {} chars  ", prompt.len()))
        }
    }

    struct BrokenModel;

    #[async_trait::async_trait]
    impl LanguageModel for BrokenModel {
        async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
            anyhow::bail!("model offline")
        }
    }

    #[tokio::test]
    async fn test_deterministic_fallback() {
        let summarizer = Summarizer::deterministic();
        let entries = vec![LogEntry::input("a"), LogEntry::output("b")];
        assert_eq!(summarizer.summarize_entries(&entries).await, "Compressed 2 entries");
    }

    #[tokio::test]
    async fn test_model_summary_is_trimmed() {
        let summarizer = Summarizer::new(Arc::new(EchoModel));
        let summary = summarizer.summarize_entries(&[LogEntry::input("hello")]).await;
        assert!(summary.starts_with("summary of"));
        assert!(!summary.ends_with(' '));
    }

    #[tokio::test]
    async fn test_model_failure_falls_back() {
        let summarizer = Summarizer::new(Arc::new(BrokenModel));
        let entries = vec![LogEntry::input("a"); 3];
        assert_eq!(summarizer.summarize_entries(&entries).await, "Compressed 3 entries");

        let err = summarizer.ask("ping", "x").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::LanguageModel);
    }

    #[tokio::test]
    async fn test_episode_fallback_joins_summaries() {
        let episodes = vec![
            Episode::new("ctx", EpisodeType::Conversation, "asked about rust", vec![]),
            Episode::new("ctx", EpisodeType::Task, "ran the build", vec![]),
        ];
        let summary = Summarizer::deterministic().summarize_episodes(&episodes).await;
        assert_eq!(summary, "Compressed 2 episodes: asked about rust | ran the build");
    }
}
