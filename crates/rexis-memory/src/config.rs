//! Memory engine configuration
//!
//! [`MemorySettings`] holds the tunables and loads from layered sources:
//! built-in defaults, then an optional TOML file, then `RMEM__SECTION__FIELD`
//! environment variables. [`MemoryConfig`] bundles settings with the storage
//! providers and collaborators a [`MemorySystem`](crate::MemorySystem) is
//! built from.

use crate::compression::LanguageModel;
use crate::episodic::EpisodeHooks;
use crate::error::RmemResult;
use crate::middleware::Middleware;
use crate::storage::{
    GraphProvider, InMemoryGraphProvider, InMemoryKvProvider, InMemoryVectorProvider,
    KeyValueProvider, VectorProvider,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "RMEM";

/// Working memory tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkingSettings {
    /// Size ceiling of the FIFO policy built by `FifoOptions::from_settings`
    pub default_max_size: usize,

    /// Recent inputs that policy keeps when it trims
    pub preserve_inputs: usize,

    /// Recent outputs that policy keeps when it trims
    pub preserve_outputs: usize,
}

impl Default for WorkingSettings {
    fn default() -> Self {
        Self {
            default_max_size: 100,
            preserve_inputs: 10,
            preserve_outputs: 10,
        }
    }
}

/// Episodic memory tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpisodicSettings {
    /// Stored episodes kept per context; oldest evicted beyond this
    pub max_episodes_per_context: usize,

    /// Minimum idle time before an input opens a new episode
    pub min_episode_gap_secs: u64,

    /// Also index every log line of an episode
    pub index_logs: bool,
}

impl Default for EpisodicSettings {
    fn default() -> Self {
        Self {
            max_episodes_per_context: 100,
            min_episode_gap_secs: 300,
            index_logs: false,
        }
    }
}

/// Recall tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallSettings {
    /// Result limit when the caller gives none
    pub default_limit: usize,

    /// Drop repeated ids across stores
    pub dedupe: bool,
}

impl Default for RecallSettings {
    fn default() -> Self {
        Self {
            default_limit: 20,
            dedupe: true,
        }
    }
}

/// Fact verification tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactSettings {
    /// Neighbors scoring above this support a fact
    pub supporting_threshold: f32,

    /// Neighbors scoring below this conflict with a fact
    pub conflicting_threshold: f32,

    /// Neighbors inspected by verification
    pub verification_neighbors: usize,
}

impl Default for FactSettings {
    fn default() -> Self {
        Self {
            supporting_threshold: 0.8,
            conflicting_threshold: 0.3,
            verification_neighbors: 10,
        }
    }
}

/// Semantic memory tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticSettings {
    /// Trigger similarity at which a pattern counts as already known
    pub pattern_similarity: f32,

    /// Cap on `get_relevant_patterns`
    pub max_relevant_patterns: usize,
}

impl Default for SemanticSettings {
    fn default() -> Self {
        Self {
            pattern_similarity: 0.8,
            max_relevant_patterns: 10,
        }
    }
}

/// All engine tunables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub working: WorkingSettings,
    pub episodic: EpisodicSettings,
    pub recall: RecallSettings,
    pub facts: FactSettings,
    pub semantic: SemanticSettings,
}

impl MemorySettings {
    fn builder() -> RmemResult<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(config::Config::builder().add_source(config::Config::try_from(&Self::default())?))
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    /// Load defaults, then `path` when given and present, then the environment
    pub fn load(path: Option<&Path>) -> RmemResult<Self> {
        let mut builder = Self::builder()?;
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings: Self = builder
            .add_source(Self::environment())
            .build()?
            .try_deserialize()?;

        tracing::debug!(?settings, "Memory settings loaded");
        Ok(settings)
    }

    /// Parse TOML on top of the defaults (no environment layer)
    pub fn from_toml_str(toml: &str) -> RmemResult<Self> {
        Ok(Self::builder()?
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?)
    }
}

/// Everything a memory system is built from
#[derive(Clone)]
pub struct MemoryConfig {
    /// Key-value backend
    pub kv: Arc<dyn KeyValueProvider>,

    /// Vector backend
    pub vector: Arc<dyn VectorProvider>,

    /// Graph backend
    pub graph: Arc<dyn GraphProvider>,

    /// Tunables
    pub settings: MemorySettings,

    /// Optional summarization model
    pub language_model: Option<Arc<dyn LanguageModel>>,

    /// Middleware chain, in registration order
    pub middlewares: Vec<Arc<dyn Middleware>>,

    /// Episode boundary predicates (defaults derive from settings)
    pub episode_hooks: Option<Arc<dyn EpisodeHooks>>,
}

impl MemoryConfig {
    /// Create a configuration over the given providers
    pub fn new(
        kv: Arc<dyn KeyValueProvider>,
        vector: Arc<dyn VectorProvider>,
        graph: Arc<dyn GraphProvider>,
    ) -> Self {
        Self {
            kv,
            vector,
            graph,
            settings: MemorySettings::default(),
            language_model: None,
            middlewares: Vec::new(),
            episode_hooks: None,
        }
    }

    /// Configuration over the in-memory reference providers
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryKvProvider::new()),
            Arc::new(InMemoryVectorProvider::new()),
            Arc::new(InMemoryGraphProvider::new()),
        )
    }

    /// Set tunables
    pub fn with_settings(mut self, settings: MemorySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Attach a summarization model
    pub fn with_language_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.language_model = Some(model);
        self
    }

    /// Append a middleware
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Replace the episode boundary predicates
    pub fn with_episode_hooks(mut self, hooks: Arc<dyn EpisodeHooks>) -> Self {
        self.episode_hooks = Some(hooks);
        self
    }

    /// Set the per-context episode cap
    pub fn with_max_episodes_per_context(mut self, max: usize) -> Self {
        self.settings.episodic.max_episodes_per_context = max;
        self
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for MemoryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConfig")
            .field("kv", &self.kv.name())
            .field("vector", &self.vector.name())
            .field("graph", &self.graph.name())
            .field("settings", &self.settings)
            .field("language_model", &self.language_model.is_some())
            .field("middlewares", &self.middlewares.len())
            .field("episode_hooks", &self.episode_hooks.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = MemorySettings::default();
        assert_eq!(settings.working.default_max_size, 100);
        assert_eq!(settings.episodic.max_episodes_per_context, 100);
        assert_eq!(settings.episodic.min_episode_gap_secs, 300);
        assert_eq!(settings.recall.default_limit, 20);
        assert_eq!(settings.facts.supporting_threshold, 0.8);
        assert_eq!(settings.semantic.max_relevant_patterns, 10);
    }

    #[test]
    fn test_from_toml_overrides_partially() {
        let settings = MemorySettings::from_toml_str(
            r#"
            [episodic]
            max_episodes_per_context = 5
            index_logs = true

            [recall]
            default_limit = 7

            [working]
            default_max_size = 4
            "#,
        )
        .unwrap();

        assert_eq!(settings.episodic.max_episodes_per_context, 5);
        assert!(settings.episodic.index_logs);
        assert_eq!(settings.episodic.min_episode_gap_secs, 300);
        assert_eq!(settings.recall.default_limit, 7);
        assert!(settings.recall.dedupe);
        assert_eq!(settings.working.default_max_size, 4);
        assert_eq!(settings.working.preserve_inputs, 10);
    }

    #[test]
    fn test_load_from_file_and_missing_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[semantic]\npattern_similarity = 0.9").unwrap();

        let settings = MemorySettings::load(Some(file.path())).unwrap();
        assert!((settings.semantic.pattern_similarity - 0.9).abs() < 1e-6);

        let missing = MemorySettings::load(Some(Path::new("/nonexistent/rmem.toml"))).unwrap();
        assert_eq!(missing.semantic.pattern_similarity, 0.8);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let err = MemorySettings::from_toml_str("[recall]\ndefault_limit = \"many\"").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_config_builder() {
        let config = MemoryConfig::in_memory().with_max_episodes_per_context(3);
        assert_eq!(config.settings.episodic.max_episodes_per_context, 3);
        assert!(config.middlewares.is_empty());
        assert!(format!("{:?}", config).contains("MemoryConfig"));
    }
}
