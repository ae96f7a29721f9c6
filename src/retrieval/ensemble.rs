//! Keyword pre-filter followed by a BM25 + vector ensemble

use crate::config::RetrievalConfig;
use crate::document::Fragment;
use crate::embedding::{EmbeddingProvider, KeywordIndex, VectorIndex};
use crate::entities::KeywordExtractor;
use crate::error::StratumError;
use crate::retrieval::{
    reciprocal_rank_fusion, FusionConfig, PathDeadline, RelevanceRanker, RetrievalError,
    ScoredFragment, SearchConfig,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

const QUERY_KEYWORDS: usize = 20;
const MAX_FILTER_KEYWORDS: usize = 5;

pub struct EnsembleRetriever {
    extractor: KeywordExtractor,
    provider: Arc<dyn EmbeddingProvider>,
    fusion: FusionConfig,
}

impl EnsembleRetriever {
    pub fn new(
        extractor: KeywordExtractor,
        provider: Arc<dyn EmbeddingProvider>,
        config: &RetrievalConfig,
    ) -> Result<Self, StratumError> {
        let fusion = FusionConfig::new(config.rrf_k, config.lexical_weight, config.vector_weight)
            .map_err(|e| StratumError::InvalidConfigValue {
                path: "retrieval".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            extractor,
            provider,
            fusion,
        })
    }

    /// Query keywords used for filtering and context windows
    pub fn keywords(&self, query: &str) -> Vec<String> {
        let extractor = &self.extractor;
        let mut seen = HashSet::new();
        let keywords: Vec<String> = extractor
            .extract_keywords(query, QUERY_KEYWORDS, 2)
            .into_iter()
            .map(|k| k.term)
            .chain(extractor.get_person_names(query))
            .chain(extractor.get_organizations(query))
            .chain(extractor.get_locations(query))
            .filter(|k| seen.insert(k.clone()))
            .take(MAX_FILTER_KEYWORDS)
            .collect();

        if keywords.is_empty() {
            vec![query.to_string()]
        } else {
            keywords
        }
    }

    pub fn search(
        &self,
        index: &VectorIndex,
        query: &str,
        params: &SearchConfig,
        deadline: &PathDeadline,
    ) -> Result<Vec<ScoredFragment>, RetrievalError> {
        if index.is_empty() || params.top_k == 0 {
            return Ok(Vec::new());
        }

        let keywords = self.keywords(query);
        let slots = filter_slots(index.fragments(), &keywords, params.keyword_match_threshold);
        let limit = params.top_k * 2;
        debug!(
            "Ensemble keywords {:?}: {} of {} fragments pass the filter",
            keywords,
            slots.len(),
            index.len()
        );
        deadline.check()?;

        let fragments = index.fragments();
        let lexical_index = KeywordIndex::build(slots.iter().map(|&slot| {
            (
                slot as u64,
                self.extractor.lexical_tokens(&fragments[slot].content),
            )
        }))?;
        let lexical: Vec<usize> = lexical_index
            .search(&self.extractor.lexical_tokens(query), limit)?
            .into_iter()
            .map(|r| r.id as usize)
            .collect();
        deadline.check()?;

        let query_vector = self.provider.embed_query(query)?;
        let by_id: HashMap<&str, usize> = slots
            .iter()
            .map(|&slot| (fragments[slot].fragment_id.as_str(), slot))
            .collect();
        let vector: Vec<usize> = index
            .search_within(&query_vector, limit, &slots)?
            .into_iter()
            .filter_map(|(fragment, _)| by_id.get(fragment.fragment_id.as_str()).copied())
            .collect();
        deadline.check()?;

        let fused = reciprocal_rank_fusion(&lexical, &vector, &self.fusion);
        let mut hits: Vec<ScoredFragment> = fused
            .into_iter()
            .take(limit)
            .map(|(slot, score)| {
                let fragment = enrich_context(fragments[slot].clone(), &keywords, params.context_window);
                ScoredFragment::new(fragment, score)
            })
            .collect();

        if params.enable_ranking {
            let ranker = RelevanceRanker::new(params.ranking, self.extractor.clone());
            hits = ranker.rank(hits, query);
        }
        hits.truncate(params.top_k);
        Ok(hits)
    }
}

/// Slots of fragments containing at least `threshold` keywords, or every
/// slot when none qualifies
fn filter_slots(fragments: &[Fragment], keywords: &[String], threshold: usize) -> Vec<usize> {
    let lowered: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
    let matching: Vec<usize> = fragments
        .iter()
        .enumerate()
        .filter(|(_, f)| {
            let content = f.content.to_lowercase();
            lowered.iter().filter(|k| content.contains(k.as_str())).count() >= threshold
        })
        .map(|(slot, _)| slot)
        .collect();

    if matching.is_empty() {
        (0..fragments.len()).collect()
    } else {
        matching
    }
}

/// Replace long content with windows of `window` chars around keyword hits
///
/// Nearby hits share a window. Cut points are marked with `...`, windows are
/// joined with `\n...\n`, and the full text moves to `original_content`.
pub fn enrich_context(mut fragment: Fragment, keywords: &[String], window: usize) -> Fragment {
    if window == 0 {
        return fragment;
    }
    let chars: Vec<char> = fragment.content.chars().collect();
    if chars.len() <= window * 3 {
        return fragment;
    }

    let lowered: Vec<char> = chars
        .iter()
        .map(|c| {
            let mut lower = c.to_lowercase();
            match (lower.next(), lower.next()) {
                (Some(l), None) => l,
                _ => *c,
            }
        })
        .collect();

    let mut positions: Vec<(usize, usize)> = Vec::new();
    for keyword in keywords {
        let needle: Vec<char> = keyword.to_lowercase().chars().collect();
        if needle.is_empty() || needle.len() > lowered.len() {
            continue;
        }
        for start in 0..=lowered.len() - needle.len() {
            if lowered[start..start + needle.len()] == needle[..] {
                positions.push((start, start + needle.len()));
            }
        }
    }
    if positions.is_empty() {
        return fragment;
    }
    positions.sort_unstable();

    let mut merged: Vec<(usize, usize)> = Vec::new();
    let (mut current_start, mut current_end) = positions[0];
    for &(start, end) in &positions[1..] {
        if start <= current_end + window * 2 {
            current_end = current_end.max(end);
        } else {
            merged.push((current_start, current_end));
            current_start = start;
            current_end = end;
        }
    }
    merged.push((current_start, current_end));

    let contexts: Vec<String> = merged
        .into_iter()
        .map(|(start, end)| {
            let from = start.saturating_sub(window);
            let to = (end + window).min(chars.len());
            let prefix = if from > 0 { "..." } else { "" };
            let suffix = if to < chars.len() { "..." } else { "" };
            format!("{}{}{}", prefix, chars[from..to].iter().collect::<String>(), suffix)
        })
        .collect();

    let original = std::mem::replace(&mut fragment.content, contexts.join("\n...\n"));
    fragment
        .metadata
        .insert("original_content".into(), Value::from(original));
    fragment
        .metadata
        .insert("context_enriched".into(), Value::from(true));
    fragment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexingConfig;
    use crate::document::test_support::fragment;
    use crate::embedding::HashEmbeddingProvider;
    use crate::entities::Lexicon;

    fn retriever(provider: Arc<dyn EmbeddingProvider>) -> EnsembleRetriever {
        let extractor = KeywordExtractor::new(Arc::new(Lexicon::builtin().unwrap()));
        EnsembleRetriever::new(extractor, provider, &RetrievalConfig::default()).unwrap()
    }

    fn corpus() -> Vec<Fragment> {
        let mut fragments = vec![
            fragment("complaints.csv", 1, "张女士投诉物业噪音扰民，要求尽快处理"),
            fragment("complaints.csv", 2, "李先生反映停车收费不合理"),
            fragment("complaints.csv", 3, "王女士投诉餐厅价格欺诈"),
        ];
        for i in 4..20 {
            fragments.push(fragment("misc.csv", i, &format!("第{}号普通登记记录", i)));
        }
        fragments
    }

    #[test]
    fn test_ensemble_prefers_keyword_matches() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbeddingProvider::new(64));
        let index =
            VectorIndex::build(corpus(), provider.as_ref(), &IndexingConfig::default()).unwrap();
        let params = SearchConfig {
            top_k: 3,
            context_window: 0,
            ..SearchConfig::default()
        };

        let hits = retriever(provider)
            .search(&index, "张女士的投诉内容", &params, &PathDeadline::unbounded())
            .unwrap();

        assert!(!hits.is_empty());
        assert!(hits.len() <= 3);
        assert_eq!(hits[0].id(), "complaints.csv_row_1");
        assert!(hits.iter().all(|h| h.content().contains("投诉")));
    }

    #[test]
    fn test_expired_deadline() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbeddingProvider::new(64));
        let index =
            VectorIndex::build(corpus(), provider.as_ref(), &IndexingConfig::default()).unwrap();
        let result = retriever(provider).search(
            &index,
            "投诉",
            &SearchConfig::default(),
            &PathDeadline::from_millis(0),
        );
        assert!(matches!(result, Err(RetrievalError::DeadlineExceeded)));
    }

    #[test]
    fn test_filter_falls_back_to_all() {
        let fragments = corpus();
        let slots = filter_slots(&fragments, &["停车".to_string()], 1);
        assert_eq!(slots, vec![1]);
        let slots = filter_slots(&fragments, &["不存在".to_string()], 1);
        assert_eq!(slots.len(), fragments.len());
    }

    #[test]
    fn test_enrich_context_windows() {
        let content = format!("{}投诉{}投诉{}", "a".repeat(50), "b".repeat(3), "c".repeat(50));
        let f = fragment("a.txt", 1, &content);
        let enriched = enrich_context(f, &["投诉".to_string()], 10);

        // Both hits share one window
        assert_eq!(
            enriched.content,
            format!("...{}投诉bbb投诉{}...", "a".repeat(10), "c".repeat(10))
        );
        assert_eq!(enriched.metadata["context_enriched"], Value::from(true));
        assert_eq!(enriched.metadata["original_content"], Value::from(content));
    }

    #[test]
    fn test_enrich_context_separate_windows() {
        let content = format!("投诉{}投诉", "x".repeat(40));
        let enriched = enrich_context(fragment("a.txt", 1, &content), &["投诉".to_string()], 5);
        assert_eq!(enriched.content, "投诉xxxxx...\n...\n...xxxxx投诉");
    }

    #[test]
    fn test_enrich_context_skips_short_or_disabled() {
        let f = fragment("a.txt", 1, "短文本投诉");
        assert_eq!(enrich_context(f.clone(), &["投诉".to_string()], 10).content, f.content);
        let long = fragment("a.txt", 2, &"投诉".repeat(100));
        assert_eq!(enrich_context(long.clone(), &["投诉".to_string()], 0), long);
    }
}
