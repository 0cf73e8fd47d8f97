//! Recall options, unified results and the ranking pipeline
//!
//! The memory system fans a query out to the vector, fact, episode and
//! pattern stores and normalizes every hit into a [`MemoryResult`]. [`rank`]
//! then applies, in order: optional weighting (relevance, salience, recency),
//! per-type boosts, the minimum score, a score-descending sort, id
//! de-duplication, grouping and the limit.

use crate::storage::Metadata;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Store a result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Vector,
    Fact,
    Episode,
    Pattern,
}

impl ResultType {
    /// Every result type
    pub const ALL: [ResultType; 4] = [
        ResultType::Vector,
        ResultType::Fact,
        ResultType::Episode,
        ResultType::Pattern,
    ];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultType::Vector => "vector",
            ResultType::Fact => "fact",
            ResultType::Episode => "episode",
            ResultType::Pattern => "pattern",
        }
    }
}

/// Blend of signals used to re-score results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecallWeighting {
    /// Weight of the store's similarity score
    pub relevance: f64,

    /// Weight of the `salience` (or `importance`) metadata value
    pub salience: f64,

    /// Weight of the age-based recency factor (1.0 when only a half-life
    /// is given)
    pub recency: Option<f64>,

    /// Age at which recency halves; recency is ignored without it
    pub recency_half_life_ms: Option<f64>,
}

impl Default for RecallWeighting {
    fn default() -> Self {
        Self {
            relevance: 1.0,
            salience: 0.0,
            recency: None,
            recency_half_life_ms: None,
        }
    }
}

impl RecallWeighting {
    /// Relevance only
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the relevance weight
    pub fn with_relevance(mut self, weight: f64) -> Self {
        self.relevance = weight.max(0.0);
        self
    }

    /// Set the salience weight
    pub fn with_salience(mut self, weight: f64) -> Self {
        self.salience = weight.max(0.0);
        self
    }

    /// Set the recency weight and half-life
    pub fn with_recency(mut self, weight: f64, half_life_ms: f64) -> Self {
        self.recency = Some(weight.max(0.0));
        self.recency_half_life_ms = Some(half_life_ms);
        self
    }

    /// Set the half-life, keeping the recency weight
    pub fn with_half_life(mut self, half_life_ms: f64) -> Self {
        self.recency_half_life_ms = Some(half_life_ms);
        self
    }

    fn effective_recency_weight(&self) -> f64 {
        match self.recency_half_life_ms {
            Some(h) if h > 0.0 => self.recency.unwrap_or(1.0).max(0.0),
            _ => 0.0,
        }
    }
}

/// Per-result scoring diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub relevance: f64,
    pub salience: f64,
    pub recency: f64,
    pub boost: f64,
    pub final_score: f64,
}

/// One unified recall hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryResult {
    /// Record id within its store
    pub id: String,

    /// Originating store
    #[serde(rename = "type")]
    pub result_type: ResultType,

    /// Text of the hit
    pub content: String,

    /// Similarity score in `[0, 1]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,

    /// Record confidence, where the store keeps one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    /// Store metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// Value of the `group_by` field
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,

    /// Scoring diagnostics when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<ScoreBreakdown>,
}

impl MemoryResult {
    /// Create a scored result
    pub fn new(id: impl Into<String>, result_type: ResultType, content: impl Into<String>, score: f64) -> Self {
        Self {
            id: id.into(),
            result_type,
            content: content.into(),
            score: Some(score.clamp(0.0, 1.0)),
            confidence: None,
            metadata: Metadata::new(),
            group_key: None,
            breakdown: None,
        }
    }

    /// Set confidence
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    /// Replace metadata
    pub fn with_metadata_map(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Add one metadata value
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Ranking value: score, else confidence, else zero
    pub fn rank_score(&self) -> f64 {
        self.score.or(self.confidence).unwrap_or(0.0)
    }

    fn salience(&self) -> f64 {
        self.metadata
            .get("salience")
            .or_else(|| self.metadata.get("importance"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0)
    }

    fn timestamp(&self) -> Option<i64> {
        self.metadata.get("timestamp").and_then(timestamp_millis)
    }
}

/// Parse a timestamp given as epoch milliseconds or RFC 3339 text
pub fn timestamp_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse::<i64>().ok().or_else(|| {
            chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|d| d.timestamp_millis())
        }),
        _ => None,
    }
}

/// Recall parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecallOptions {
    /// Stores to query (all when `None`)
    pub types: Option<Vec<ResultType>>,

    /// Maximum results (settings default when `None`)
    pub limit: Option<usize>,

    /// Drop results ranking below this
    pub min_score: Option<f64>,

    /// Metadata equality filter for the vector store
    pub filter: Metadata,

    /// Vector namespace (unscoped when `None`)
    pub namespace: Option<String>,

    /// Context whose episodes are searched; episodes are skipped without it
    pub context_id: Option<String>,

    /// Per-type score multipliers
    pub boost: HashMap<ResultType, f64>,

    /// Re-scoring blend
    pub weighting: Option<RecallWeighting>,

    /// Keep only the best result per value of this metadata field
    pub group_by: Option<String>,

    /// Drop repeated ids (settings default when `None`)
    pub dedupe: Option<bool>,

    /// Attach a [`ScoreBreakdown`] to every result
    pub explain: bool,
}

impl RecallOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the queried stores
    pub fn with_types(mut self, types: impl IntoIterator<Item = ResultType>) -> Self {
        self.types = Some(types.into_iter().collect());
        self
    }

    /// Set the limit
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the minimum score
    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = Some(min_score);
        self
    }

    /// Add a metadata equality filter
    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }

    /// Search one vector namespace
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Include the episodes of a context
    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Multiply scores of one type
    pub fn with_boost(mut self, result_type: ResultType, factor: f64) -> Self {
        self.boost.insert(result_type, factor);
        self
    }

    /// Re-score with a weighting
    pub fn with_weighting(mut self, weighting: RecallWeighting) -> Self {
        self.weighting = Some(weighting);
        self
    }

    /// Group by a metadata field
    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by = Some(field.into());
        self
    }

    /// Toggle id de-duplication
    pub fn with_dedupe(mut self, dedupe: bool) -> Self {
        self.dedupe = Some(dedupe);
        self
    }

    /// Attach score breakdowns
    pub fn explain(mut self) -> Self {
        self.explain = true;
        self
    }

    /// Whether a store is queried
    pub fn wants(&self, result_type: ResultType) -> bool {
        self.types
            .as_ref()
            .map_or(true, |types| types.contains(&result_type))
    }
}

fn group_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn apply_weighting(result: &mut MemoryResult, weighting: &RecallWeighting, now: i64) -> ScoreBreakdown {
    let relevance = result.rank_score();
    let salience = result.salience();
    let recency = match (weighting.recency_half_life_ms, result.timestamp()) {
        (Some(half_life), Some(ts)) if half_life > 0.0 => {
            let age = (now - ts).max(0) as f64;
            0.5_f64.powf(age / half_life)
        }
        _ => 0.0,
    };

    let w_rel = weighting.relevance.max(0.0);
    let w_sal = weighting.salience.max(0.0);
    let w_rec = weighting.effective_recency_weight();
    let total = w_rel + w_sal + w_rec;

    let blended = if total > 0.0 {
        (w_rel * relevance + w_sal * salience + w_rec * recency) / total
    } else {
        relevance
    };
    result.score = Some(blended.clamp(0.0, 1.0));

    ScoreBreakdown {
        relevance,
        salience,
        recency,
        boost: 1.0,
        final_score: blended,
    }
}

/// Rank merged results.
///
/// `now` is the reference time for recency in epoch milliseconds.
pub fn rank(
    mut results: Vec<MemoryResult>,
    options: &RecallOptions,
    default_limit: usize,
    default_dedupe: bool,
    now: i64,
) -> Vec<MemoryResult> {
    for result in results.iter_mut() {
        let mut breakdown = match &options.weighting {
            Some(weighting) => apply_weighting(result, weighting, now),
            None => ScoreBreakdown {
                relevance: result.rank_score(),
                salience: result.salience(),
                recency: 0.0,
                boost: 1.0,
                final_score: result.rank_score(),
            },
        };

        if let Some(factor) = options.boost.get(&result.result_type) {
            let factor = factor.max(0.0);
            match result.score {
                Some(score) => result.score = Some((score * factor).clamp(0.0, 1.0)),
                None => result.confidence = result.confidence.map(|c| (c * factor).clamp(0.0, 1.0)),
            }
            breakdown.boost = factor;
        }
        breakdown.final_score = result.rank_score();

        if let Some(field) = &options.group_by {
            result.group_key = result.metadata.get(field).map(group_value);
        }
        if options.explain {
            result.breakdown = Some(breakdown);
        }
    }

    if let Some(min_score) = options.min_score {
        results.retain(|r| r.rank_score() >= min_score);
    }

    results.sort_by(|a, b| {
        b.rank_score()
            .total_cmp(&a.rank_score())
            .then_with(|| a.id.cmp(&b.id))
    });

    if options.dedupe.unwrap_or(default_dedupe) {
        let mut seen = HashSet::new();
        results.retain(|r| seen.insert(r.id.clone()));
    }

    if options.group_by.is_some() {
        let mut seen = HashSet::new();
        results.retain(|r| match &r.group_key {
            Some(key) => seen.insert(key.clone()),
            None => true,
        });
    }

    results.truncate(options.limit.unwrap_or(default_limit));
    results
}
