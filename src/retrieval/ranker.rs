//! Keyword-based relevance ranking
//!
//! A fragment's score combines how often the weighted query keywords occur,
//! how early they first appear and how much of the keyword weight it covers.

use crate::entities::KeywordExtractor;
use crate::retrieval::{sort_by_score, RankingWeights, ScoredFragment};
use serde::Serialize;
use tracing::debug;

const RANK_KEYWORDS: usize = 15;

/// Components of a ranker score
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub frequency: f32,
    pub position: f32,
    pub coverage: f32,
    pub combined: f32,
}

#[derive(Clone)]
pub struct RelevanceRanker {
    weights: RankingWeights,
    extractor: KeywordExtractor,
}

impl RelevanceRanker {
    pub fn new(weights: RankingWeights, extractor: KeywordExtractor) -> Self {
        Self { weights, extractor }
    }

    pub fn weights(&self) -> &RankingWeights {
        &self.weights
    }

    /// Lowercased query keywords with their weights; entities get the bonus
    pub fn weighted_keywords(&self, query: &str) -> Vec<(String, f32)> {
        let mut weighted: Vec<(String, f32)> = Vec::new();
        let mut add = |term: String, weight: f32| {
            match weighted.iter_mut().find(|(t, _)| *t == term) {
                Some((_, w)) => *w += weight,
                None => weighted.push((term, weight)),
            }
        };

        for keyword in self.extractor.extract_keywords(query, RANK_KEYWORDS, 2) {
            add(keyword.term.to_lowercase(), keyword.weight);
        }

        let entities = self
            .extractor
            .get_person_names(query)
            .into_iter()
            .chain(self.extractor.get_organizations(query))
            .chain(self.extractor.get_locations(query));
        for entity in entities {
            add(entity.to_lowercase(), self.weights.entity_bonus);
        }

        weighted
    }

    pub fn score(&self, content: &str, keywords: &[(String, f32)]) -> f32 {
        self.score_breakdown(content, keywords).combined
    }

    pub fn score_breakdown(&self, content: &str, keywords: &[(String, f32)]) -> ScoreBreakdown {
        let total_weight: f32 = keywords.iter().map(|(_, w)| w).sum();
        if total_weight <= 0.0 {
            return ScoreBreakdown {
                frequency: 0.0,
                position: 0.0,
                coverage: 0.0,
                combined: 0.0,
            };
        }

        let content = content.to_lowercase();
        let len = content.chars().count().max(1) as f32;

        let mut frequency = 0.0;
        let mut position = 0.0;
        let mut covered = 0.0;

        for (term, weight) in keywords {
            if term.is_empty() {
                continue;
            }
            let count = content.matches(term.as_str()).count();
            if count == 0 {
                continue;
            }
            frequency += count as f32 * weight / len;
            if let Some(byte) = content.find(term.as_str()) {
                let first = content[..byte].chars().count() as f32;
                position += (-first / len).exp() * weight;
            }
            covered += weight;
        }

        let frequency = frequency / total_weight;
        let position = position / total_weight;
        let coverage = covered / total_weight;
        let combined = self.weights.frequency * frequency
            + self.weights.position * position
            + self.weights.coverage * coverage;

        ScoreBreakdown {
            frequency,
            position,
            coverage,
            combined,
        }
    }

    /// Sort `hits` by ranker score, replacing each hit's score with it
    pub fn rank(&self, hits: Vec<ScoredFragment>, query: &str) -> Vec<ScoredFragment> {
        if hits.is_empty() {
            return hits;
        }

        let keywords = self.weighted_keywords(query);
        let mut ranked: Vec<ScoredFragment> = hits
            .into_iter()
            .map(|mut hit| {
                hit.score = self.score(hit.content(), &keywords);
                hit
            })
            .collect();
        sort_by_score(&mut ranked);

        if let (Some(first), Some(last)) = (ranked.first(), ranked.last()) {
            debug!(
                "Ranked {} fragments on {} keywords: best={:.4}, worst={:.4}",
                ranked.len(),
                keywords.len(),
                first.score,
                last.score
            );
        }
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::test_support::fragment;
    use crate::entities::Lexicon;
    use std::sync::Arc;

    fn ranker() -> RelevanceRanker {
        let extractor = KeywordExtractor::new(Arc::new(Lexicon::builtin().unwrap()));
        RelevanceRanker::new(RankingWeights::default(), extractor)
    }

    #[test]
    fn test_entities_get_bonus() {
        let keywords = ranker().weighted_keywords("张女士的投诉内容");
        let weight = |term: &str| keywords.iter().find(|(t, _)| t == term).map(|(_, w)| *w);
        assert_eq!(weight("张女士"), Some(3.0 + 4.0));
        assert_eq!(weight("投诉"), Some(2.0));
    }

    #[test]
    fn test_breakdown_components() {
        let ranker = ranker();
        let keywords = vec![("ab".to_string(), 1.0), ("zz".to_string(), 1.0)];
        let b = ranker.score_breakdown("abcd", &keywords);

        assert!((b.frequency - 0.125).abs() < 1e-6);
        assert!((b.position - 0.5).abs() < 1e-6);
        assert!((b.coverage - 0.5).abs() < 1e-6);
        assert!((b.combined - (0.4 * 0.125 + 0.3 * 0.5 + 0.3 * 0.5)).abs() < 1e-6);
    }

    #[test]
    fn test_no_keywords_scores_zero() {
        assert_eq!(ranker().score("anything", &[]), 0.0);
    }

    #[test]
    fn test_rank_orders_by_relevance() {
        let hits = vec![
            ScoredFragment::new(fragment("a.csv", 1, "停车收费问题"), 0.9),
            ScoredFragment::new(fragment("a.csv", 2, "张女士投诉物业，投诉内容为噪音"), 0.1),
            ScoredFragment::new(fragment("a.csv", 3, "关于投诉的规定"), 0.5),
        ];

        let ranked = ranker().rank(hits, "张女士的投诉内容");
        assert_eq!(ranked[0].id(), "a.csv_row_2");
        assert_eq!(ranked[2].id(), "a.csv_row_1");
        assert_eq!(ranked[2].score, 0.0);
    }
}
