//! Reciprocal Rank Fusion for combining ranked lists

use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum FusionError {
    #[error("Invalid weight configuration: weights must be non-negative and not both zero")]
    InvalidWeights,

    #[error("Invalid RRF constant: {0}")]
    InvalidConstant(f32),
}

/// Configuration for fusion algorithm
#[derive(Debug, Clone, Copy)]
pub struct FusionConfig {
    /// RRF K constant (typically 60)
    pub rrf_k: f32,

    /// Weight for lexical (BM25) results
    pub lexical_weight: f32,

    /// Weight for vector results
    pub vector_weight: f32,
}

impl FusionConfig {
    pub fn new(rrf_k: f32, lexical_weight: f32, vector_weight: f32) -> Result<Self, FusionError> {
        if lexical_weight < 0.0 || vector_weight < 0.0 || lexical_weight + vector_weight <= 0.0 {
            return Err(FusionError::InvalidWeights);
        }
        if rrf_k.is_nan() || rrf_k < 0.0 {
            return Err(FusionError::InvalidConstant(rrf_k));
        }

        Ok(Self {
            rrf_k,
            lexical_weight,
            vector_weight,
        })
    }

    /// Fused score of an item ranked first in both lists
    fn max_score(&self) -> f32 {
        (self.lexical_weight + self.vector_weight) / (self.rrf_k + 1.0)
    }
}

/// Apply weighted Reciprocal Rank Fusion to two ranked lists of keys
///
/// RRF formula: score(id) = sum over all rankings of: weight / (k + rank)
///
/// Scores are divided by the best achievable score, so an item ranked first
/// by both retrievers scores 1.0. Returns keys sorted by fused score
/// descending; ties keep first-seen order (lexical list first).
pub fn reciprocal_rank_fusion<K>(
    lexical_results: &[K],
    vector_results: &[K],
    config: &FusionConfig,
) -> Vec<(K, f32)>
where
    K: Clone + Eq + Hash,
{
    let mut scores: HashMap<K, f32> = HashMap::new();
    let mut order: Vec<K> = Vec::new();

    let mut accumulate = |results: &[K], weight: f32| {
        for (rank, key) in results.iter().enumerate() {
            let rrf_score = weight / (config.rrf_k + (rank as f32) + 1.0);
            match scores.get_mut(key) {
                Some(score) => *score += rrf_score,
                None => {
                    scores.insert(key.clone(), rrf_score);
                    order.push(key.clone());
                }
            }
        }
    };

    accumulate(lexical_results, config.lexical_weight);
    accumulate(vector_results, config.vector_weight);

    let max = config.max_score();
    let mut results: Vec<(K, f32)> = order
        .into_iter()
        .map(|key| {
            let score = scores.get(&key).copied().unwrap_or(0.0) / max;
            (key, score)
        })
        .collect();
    results.sort_by(|a, b| b.1.total_cmp(&a.1));

    results
}
