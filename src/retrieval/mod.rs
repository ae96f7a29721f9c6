//! Retrieval over the loaded indices
//!
//! This module implements the retriever kinds a service can be bound to:
//! - Two-layer hierarchical search (summaries, then chunks) with
//!   anti-starvation aggregation, optionally fanned out over several paths
//! - Keyword pre-filter + BM25/vector ensemble with weighted rank fusion
//! - Plain flat-vector search
//!
//! plus the relevance ranker and the raw-source fallback scan.

mod deduplication;
mod ensemble;
mod fallback;
mod flat;
mod fusion;
mod hierarchical;
mod multipath;
mod ranker;

pub use deduplication::{dedupe_by_content_prefix, dedupe_by_id, truncate_preserving_terms};
pub use ensemble::{enrich_context, EnsembleRetriever};
pub use fallback::{preprocess_query, SourceScanner, CONTENT_DIR};
pub use flat::FlatRetriever;
pub use fusion::{reciprocal_rank_fusion, FusionConfig, FusionError};
pub use hierarchical::{highlight_terms, HierarchicalRetriever, LayerOneOutcome};
pub use multipath::{rescore, MultiPathOutcome, MultiPathRetriever, PathSummary, RetrievalMode};
pub use ranker::{RelevanceRanker, ScoreBreakdown};

use crate::document::Fragment;
use crate::embedding::{EmbeddingError, KeywordIndexError, VectorIndexError};
use crate::error::StratumError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Retriever requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetrieverKindChoice {
    #[default]
    Auto,
    Hierarchical,
    KeywordEnsemble,
    FlatVector,
}

impl FromStr for RetrieverKindChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(Self::Auto),
            "hierarchical" => Ok(Self::Hierarchical),
            "keyword_ensemble" | "ensemble" => Ok(Self::KeywordEnsemble),
            "flat_vector" | "flat" => Ok(Self::FlatVector),
            other => Err(format!(
                "Unknown retriever kind '{}' (expected auto, hierarchical, keyword_ensemble or flat_vector)",
                other
            )),
        }
    }
}

/// Retriever a service is actually bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrieverKind {
    Hierarchical,
    KeywordEnsemble,
    FlatVector,
}

impl RetrieverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrieverKind::Hierarchical => "hierarchical",
            RetrieverKind::KeywordEnsemble => "keyword_ensemble",
            RetrieverKind::FlatVector => "flat_vector",
        }
    }
}

impl fmt::Display for RetrieverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weights of the relevance ranker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingWeights {
    pub frequency: f32,
    pub position: f32,
    pub coverage: f32,
    /// Added to the keyword weight of every query entity
    pub entity_bonus: f32,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            frequency: 0.4,
            position: 0.3,
            coverage: 0.3,
            entity_bonus: 4.0,
        }
    }
}

/// Per-query parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub top_k: usize,
    /// Final results scoring below this are dropped
    pub score_threshold: f32,
    pub retriever_kind: RetrieverKindChoice,
    pub ranking: RankingWeights,
    pub keyword_match_threshold: usize,
    /// Chars of context kept around keyword hits; 0 disables enrichment
    pub context_window: usize,
    pub enable_ranking: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            score_threshold: 0.0,
            retriever_kind: RetrieverKindChoice::Auto,
            ranking: RankingWeights::default(),
            keyword_match_threshold: 1,
            context_window: 100,
            enable_ranking: true,
        }
    }
}

/// Fragment with a relevance score, higher is better
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredFragment {
    pub fragment: Fragment,
    pub score: f32,
}

impl ScoredFragment {
    pub fn new(fragment: Fragment, score: f32) -> Self {
        Self { fragment, score }
    }

    pub fn id(&self) -> &str {
        &self.fragment.fragment_id
    }

    pub fn content(&self) -> &str {
        &self.fragment.content
    }
}

/// Sort by descending score; ties keep their input order
pub fn sort_by_score(hits: &mut [ScoredFragment]) {
    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
}

/// Convert a cosine distance into a similarity in [0, 1]
pub fn similarity(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

/// Outcome of one retrieval path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalPathResult {
    pub name: String,
    pub query: String,
    pub hits: Vec<ScoredFragment>,
    pub timed_out: bool,
}

impl RetrievalPathResult {
    pub fn new(name: impl Into<String>, query: impl Into<String>, hits: Vec<ScoredFragment>) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            hits,
            timed_out: false,
        }
    }

    pub fn timed_out(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::new(name, query, Vec::new())
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Failure of a single retrieval run
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Retrieval path exceeded its deadline")]
    DeadlineExceeded,

    #[error(transparent)]
    Stratum(#[from] StratumError),
}

impl From<EmbeddingError> for RetrievalError {
    fn from(err: EmbeddingError) -> Self {
        RetrievalError::Stratum(err.into())
    }
}

impl From<VectorIndexError> for RetrievalError {
    fn from(err: VectorIndexError) -> Self {
        RetrievalError::Stratum(err.into())
    }
}

impl From<KeywordIndexError> for RetrievalError {
    fn from(err: KeywordIndexError) -> Self {
        RetrievalError::Stratum(err.into())
    }
}

/// Cooperative time budget of one retrieval path
///
/// Long-running steps call [`PathDeadline::check`] between units of work.
#[derive(Debug, Clone, Copy)]
pub struct PathDeadline {
    started: Instant,
    budget: Duration,
}

impl PathDeadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    /// Deadline that never expires
    pub fn unbounded() -> Self {
        Self::new(Duration::MAX)
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.budget
    }

    pub fn check(&self) -> Result<(), RetrievalError> {
        if self.expired() {
            Err(RetrievalError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriever_kind_choice_parse() {
        assert_eq!("auto".parse(), Ok(RetrieverKindChoice::Auto));
        assert_eq!("keyword-ensemble".parse(), Ok(RetrieverKindChoice::KeywordEnsemble));
        assert_eq!("FLAT_VECTOR".parse(), Ok(RetrieverKindChoice::FlatVector));
        assert!("bm25".parse::<RetrieverKindChoice>().is_err());
    }

    #[test]
    fn test_search_config_partial_toml() {
        let config: SearchConfig = toml::from_str(
            r#"
            top_k = 8
            retriever_kind = "flat_vector"

            [ranking]
            entity_bonus = 2.0
            "#,
        )
        .unwrap();
        assert_eq!(config.top_k, 8);
        assert_eq!(config.retriever_kind, RetrieverKindChoice::FlatVector);
        assert_eq!(config.ranking.entity_bonus, 2.0);
        assert_eq!(config.ranking.frequency, 0.4);
        assert!(config.enable_ranking);
    }

    #[test]
    fn test_deadline() {
        assert!(PathDeadline::unbounded().check().is_ok());
        let expired = PathDeadline::from_millis(0);
        assert!(expired.expired());
        assert!(matches!(expired.check(), Err(RetrievalError::DeadlineExceeded)));
    }

    #[test]
    fn test_similarity_is_clamped() {
        assert_eq!(similarity(0.25), 0.75);
        assert_eq!(similarity(1.5), 0.0);
        assert_eq!(similarity(-0.1), 1.0);
    }
}
