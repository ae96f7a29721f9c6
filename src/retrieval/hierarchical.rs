//! Two-layer search: summaries select groups, chunks are scored within them
//!
//! Layer 1 searches the summary index with the query, its entities and its
//! strong keywords, and selects the groups whose summaries are close enough
//! or mention an entity. Layer 2 searches the chunk index with a wide
//! candidate pool, blends vector similarity with keyword occurrences, boosts
//! chunks of selected groups and aggregates per matched term so that no
//! matched entity is crowded out.

use crate::config::RetrievalConfig;
use crate::document::Fragment;
use crate::embedding::EmbeddingProvider;
use crate::entities::QueryAnalysis;
use crate::hierarchy::HierarchicalIndex;
use crate::retrieval::{
    similarity, sort_by_score, truncate_preserving_terms, EnsembleRetriever, PathDeadline,
    RetrievalError, ScoredFragment, SearchConfig,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

const ENTITIES_PER_CATEGORY: usize = 2;
const ENTITY_SUMMARY_K: usize = 3;
const ENTITY_DISTANCE_FACTOR: f32 = 0.8;
const SUMMARY_KEYWORDS: usize = 3;
const KEYWORD_SUMMARY_K: usize = 2;
/// Keywords above this weight count as strong
const STRONG_KEYWORD_WEIGHT: f32 = 1.0;

const MIN_CANDIDATES: usize = 100;
const CANDIDATE_FACTOR: usize = 10;
const OCCURRENCE_BONUS: f32 = 0.1;
const EARLY_HIT_BONUS: f32 = 0.2;
const EARLY_HIT_CHARS: usize = 100;
const VECTOR_BLEND: f32 = 0.6;
const KEYWORD_BLEND: f32 = 0.4;
const MIN_PER_BUCKET: usize = 3;

/// Summaries found in Layer 1 and the groups they select
#[derive(Debug, Clone, Default)]
pub struct LayerOneOutcome {
    /// Best distance per summary, ascending
    pub summaries: Vec<(Fragment, f32)>,
    pub groups: HashSet<String>,
    pub relaxed: bool,
}

struct Candidate {
    hit: ScoredFragment,
    matched: Vec<usize>,
    in_group: bool,
    similarity: f32,
}

pub struct HierarchicalRetriever {
    provider: Arc<dyn EmbeddingProvider>,
    config: RetrievalConfig,
    fallback: EnsembleRetriever,
}

impl HierarchicalRetriever {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        config: RetrievalConfig,
        fallback: EnsembleRetriever,
    ) -> Self {
        Self {
            provider,
            config,
            fallback,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Run both layers for `query`, falling back to the ensemble over the
    /// chunk index when Layer 1 selects nothing
    pub fn search(
        &self,
        index: &HierarchicalIndex,
        query: &str,
        analysis: &QueryAnalysis,
        params: &SearchConfig,
        deadline: &PathDeadline,
    ) -> Result<Vec<ScoredFragment>, RetrievalError> {
        if params.top_k == 0 || index.chunks.is_empty() {
            return Ok(Vec::new());
        }

        let query_vector = self.provider.embed_query(query)?;
        deadline.check()?;
        let layer_one = self.layer_one(index, &query_vector, analysis, deadline)?;

        if layer_one.groups.is_empty() {
            if self.config.enable_summary_fallback {
                debug!("No summary groups for '{}', using ensemble over chunks", query);
                return self.fallback.search(&index.chunks, query, params, deadline);
            }
            return Ok(Vec::new());
        }

        debug!(
            "Layer 1 for '{}': {} summaries, {} groups{}",
            query,
            layer_one.summaries.len(),
            layer_one.groups.len(),
            if layer_one.relaxed { " (relaxed)" } else { "" }
        );

        self.layer_two(index, &query_vector, analysis, &layer_one.groups, params.top_k, deadline)
    }

    /// Summary search with the query, its entities and strong keywords
    pub fn layer_one(
        &self,
        index: &HierarchicalIndex,
        query_vector: &[f32],
        analysis: &QueryAnalysis,
        deadline: &PathDeadline,
    ) -> Result<LayerOneOutcome, RetrievalError> {
        let mut best: HashMap<String, (Fragment, f32)> = HashMap::new();
        let mut keep = |hits: Vec<(Fragment, f32)>, adjust: &dyn Fn(f32) -> f32| {
            for (fragment, distance) in hits {
                let distance = adjust(distance);
                match best.get_mut(&fragment.fragment_id) {
                    Some(entry) if entry.1 <= distance => {}
                    Some(entry) => entry.1 = distance,
                    None => {
                        best.insert(fragment.fragment_id.clone(), (fragment, distance));
                    }
                }
            }
        };

        let summaries = &index.summaries;
        keep(
            summaries.search(query_vector, self.config.summary_top_k)?,
            &|d| d,
        );

        for (_, items) in analysis.entities.categories() {
            for entity in items.iter().take(ENTITIES_PER_CATEGORY) {
                deadline.check()?;
                let vector = self.provider.embed_query(entity)?;
                keep(
                    summaries.search(&vector, ENTITY_SUMMARY_K)?,
                    &|d| d * ENTITY_DISTANCE_FACTOR,
                );
            }
        }

        for keyword in analysis
            .keywords
            .iter()
            .take(SUMMARY_KEYWORDS)
            .filter(|k| k.weight > STRONG_KEYWORD_WEIGHT)
        {
            deadline.check()?;
            let vector = self.provider.embed_query(&keyword.term)?;
            let weight = keyword.weight;
            keep(summaries.search(&vector, KEYWORD_SUMMARY_K)?, &|d| d / weight);
        }

        let mut ranked: Vec<(Fragment, f32)> = best.into_values().collect();
        ranked.sort_by(|a, b| {
            a.1.total_cmp(&b.1)
                .then_with(|| a.0.fragment_id.cmp(&b.0.fragment_id))
        });
        ranked.truncate(self.config.summary_top_k * 2);

        Ok(self.select_groups(ranked, analysis))
    }

    fn select_groups(
        &self,
        summaries: Vec<(Fragment, f32)>,
        analysis: &QueryAnalysis,
    ) -> LayerOneOutcome {
        let threshold = self.config.summary_score_threshold;
        let mut groups: HashSet<String> = summaries
            .iter()
            .filter(|(_, d)| *d <= threshold)
            .map(|(f, _)| group_id(f))
            .collect();

        if self.config.enable_entity_matching {
            let entities: Vec<String> = analysis
                .entities
                .all()
                .iter()
                .map(|e| e.to_lowercase())
                .collect();
            if !entities.is_empty() {
                for (fragment, _) in &summaries {
                    let content = fragment.content.to_lowercase();
                    if entities.iter().any(|e| content.contains(e.as_str())) {
                        groups.insert(group_id(fragment));
                    }
                }
            }
        }

        let mut relaxed = false;
        if groups.is_empty() && !summaries.is_empty() {
            let relaxed_threshold = threshold * self.config.relaxed_threshold_factor;
            groups = summaries
                .iter()
                .filter(|(_, d)| *d <= relaxed_threshold)
                .map(|(f, _)| group_id(f))
                .collect();
            relaxed = true;
        }

        LayerOneOutcome {
            summaries,
            groups,
            relaxed,
        }
    }

    /// Chunk search with keyword blending, group boost and per-term buckets
    pub fn layer_two(
        &self,
        index: &HierarchicalIndex,
        query_vector: &[f32],
        analysis: &QueryAnalysis,
        groups: &HashSet<String>,
        top_k: usize,
        deadline: &PathDeadline,
    ) -> Result<Vec<ScoredFragment>, RetrievalError> {
        let terms = search_terms(analysis);
        let lowered_terms: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();
        let candidate_k = (top_k * CANDIDATE_FACTOR).max(MIN_CANDIDATES);
        let raw = index.chunks.search(query_vector, candidate_k)?;

        let mut candidates = Vec::with_capacity(raw.len());
        for (fragment, distance) in raw {
            deadline.check()?;
            let content = fragment.content.to_lowercase();
            let s = similarity(distance);

            let mut matched = Vec::new();
            let mut keyword_score = 0.0;
            for (i, term) in lowered_terms.iter().enumerate() {
                if term.is_empty() {
                    continue;
                }
                let occurrences = content.matches(term.as_str()).count();
                if occurrences == 0 {
                    continue;
                }
                matched.push(i);
                keyword_score += occurrences as f32 * OCCURRENCE_BONUS;
                let first_char = content
                    .find(term.as_str())
                    .map(|b| content[..b].chars().count());
                if first_char.is_some_and(|c| c < EARLY_HIT_CHARS) {
                    keyword_score += EARLY_HIT_BONUS;
                }
            }

            let mut score = if matched.is_empty() {
                s
            } else {
                VECTOR_BLEND * s + KEYWORD_BLEND * keyword_score.min(1.0)
            };
            let in_group = index
                .groups
                .group_of(&fragment.fragment_id)
                .is_some_and(|g| groups.contains(g));
            if in_group {
                score += self.config.group_boost;
            }

            candidates.push(Candidate {
                hit: ScoredFragment::new(fragment, score),
                matched,
                in_group,
                similarity: s,
            });
        }

        let selected = self.aggregate(candidates, &terms, top_k);
        Ok(selected
            .into_iter()
            .map(|mut hit| {
                annotate(&mut hit.fragment, &terms);
                hit
            })
            .collect())
    }

    /// Anti-starvation aggregation over term buckets
    fn aggregate(
        &self,
        mut candidates: Vec<Candidate>,
        terms: &[String],
        top_k: usize,
    ) -> Vec<ScoredFragment> {
        candidates.sort_by(|a, b| b.hit.score.total_cmp(&a.hit.score));

        let buckets: Vec<(usize, Vec<usize>)> = (0..terms.len())
            .map(|t| {
                let members = candidates
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.matched.contains(&t))
                    .map(|(i, _)| i)
                    .collect::<Vec<_>>();
                (t, members)
            })
            .filter(|(_, members)| !members.is_empty())
            .collect();

        let mut used = vec![false; candidates.len()];
        let mut order: Vec<usize> = Vec::new();

        if !buckets.is_empty() {
            let per_bucket = (top_k / buckets.len()).max(MIN_PER_BUCKET);
            for (_, members) in &buckets {
                for &i in members.iter().take(per_bucket) {
                    select(i, &mut used, &mut order);
                }
            }
        }

        for (i, c) in candidates.iter().enumerate() {
            if order.len() >= top_k {
                break;
            }
            if !c.matched.is_empty() {
                select(i, &mut used, &mut order);
            }
        }

        for (i, c) in candidates.iter().enumerate() {
            if order.len() >= top_k {
                break;
            }
            if c.in_group && c.similarity >= self.config.chunk_score_threshold {
                select(i, &mut used, &mut order);
            }
        }

        let bucket_terms: Vec<String> = buckets.iter().map(|(t, _)| terms[*t].clone()).collect();
        let mut slots: Vec<Option<Candidate>> = candidates.into_iter().map(Some).collect();
        let hits: Vec<ScoredFragment> = order
            .into_iter()
            .filter_map(|i| slots[i].take().map(|c| c.hit))
            .collect();

        let mut kept = truncate_preserving_terms(hits, &bucket_terms, top_k);
        sort_by_score(&mut kept);
        kept
    }
}

fn select(i: usize, used: &mut [bool], order: &mut Vec<usize>) {
    if !used[i] {
        used[i] = true;
        order.push(i);
    }
}

fn group_id(summary: &Fragment) -> String {
    summary
        .metadata
        .get("group_id")
        .and_then(Value::as_str)
        .unwrap_or(&summary.fragment_id)
        .to_string()
}

/// Entities followed by strong keywords, deduplicated
fn search_terms(analysis: &QueryAnalysis) -> Vec<String> {
    let mut terms = analysis.entities.all();
    for keyword in analysis.strong_keywords() {
        if !terms.contains(&keyword.term) {
            terms.push(keyword.term.clone());
        }
    }
    terms.retain(|t| !t.trim().is_empty());
    terms
}

fn annotate(fragment: &mut Fragment, terms: &[String]) {
    let highlighted = highlight_terms(&fragment.content, terms);
    fragment
        .metadata
        .insert("search_terms".into(), Value::from(terms.to_vec()));
    fragment
        .metadata
        .insert("highlighted_content".into(), Value::from(highlighted));
}

/// Wrap every occurrence of any term in `**`; overlapping hits share markers
pub fn highlight_terms(content: &str, terms: &[String]) -> String {
    let mut marked = vec![false; content.len()];
    for term in terms.iter().filter(|t| !t.is_empty()) {
        for (start, m) in content.match_indices(term.as_str()) {
            marked[start..start + m.len()].iter_mut().for_each(|b| *b = true);
        }
    }

    let mut out = String::with_capacity(content.len() + 8);
    let mut inside = false;
    for (i, c) in content.char_indices() {
        if marked[i] != inside {
            out.push_str("**");
            inside = marked[i];
        }
        out.push(c);
    }
    if inside {
        out.push_str("**");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HierarchyConfig, IndexingConfig};
    use crate::document::test_support::fragment;
    use crate::embedding::HashEmbeddingProvider;
    use crate::entities::{KeywordExtractor, Lexicon, RuleAnalyzer};
    use crate::hierarchy::HierarchicalIndexBuilder;

    struct Fixture {
        index: HierarchicalIndex,
        retriever: HierarchicalRetriever,
        rules: RuleAnalyzer,
    }

    fn fixture(fragments: Vec<Fragment>) -> Fixture {
        let extractor = KeywordExtractor::new(Arc::new(Lexicon::builtin().unwrap()));
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbeddingProvider::new(64));
        let index = HierarchicalIndexBuilder::new(
            &extractor,
            &HierarchyConfig::default(),
            &IndexingConfig::default(),
        )
        .build("kb", fragments, provider.as_ref())
        .unwrap();
        let config = RetrievalConfig::default();
        let fallback =
            EnsembleRetriever::new(extractor.clone(), provider.clone(), &config).unwrap();
        Fixture {
            index,
            retriever: HierarchicalRetriever::new(provider, config, fallback),
            rules: RuleAnalyzer::new(extractor),
        }
    }

    fn search(f: &Fixture, query: &str, top_k: usize) -> Vec<ScoredFragment> {
        let analysis = f.rules.analyze_query(query);
        let params = SearchConfig {
            top_k,
            ..SearchConfig::default()
        };
        f.retriever
            .search(&f.index, query, &analysis, &params, &PathDeadline::unbounded())
            .unwrap()
    }

    #[test]
    fn test_entity_matches_are_found_and_annotated() {
        let f = fixture(vec![
            fragment("complaints.csv", 1, "张女士投诉物业噪音扰民"),
            fragment("complaints.csv", 2, "李先生反映停车收费不合理"),
            fragment("notice.txt", 1, "关于开展安全检查的通知"),
        ]);

        let hits = search(&f, "张女士的投诉内容", 3);
        assert_eq!(hits[0].id(), "complaints.csv_row_1");

        let metadata = &hits[0].fragment.metadata;
        assert_eq!(
            metadata["highlighted_content"],
            Value::from("**张女士投诉**物业噪音扰民")
        );
        let terms = metadata["search_terms"].as_array().unwrap();
        assert!(terms.contains(&Value::from("张女士")));
    }

    #[test]
    fn test_every_matched_entity_is_represented() {
        let mut fragments = Vec::new();
        for i in 0..12 {
            fragments.push(fragment("zhang.csv", i, &format!("张女士第{}次投诉物业噪音", i)));
        }
        fragments.push(fragment("li.csv", 1, "李先生投诉停车收费"));
        let f = fixture(fragments);

        let hits = search(&f, "张女士和李先生的投诉", 2);
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().any(|h| h.content().contains("张女士")));
        assert!(hits.iter().any(|h| h.content().contains("李先生")));
    }

    #[test]
    fn test_results_are_bounded_and_sorted() {
        let fragments = (0..30)
            .map(|i| fragment("log.csv", i, &format!("第{}条投诉记录", i)))
            .collect();
        let f = fixture(fragments);

        let hits = search(&f, "投诉记录", 5);
        assert_eq!(hits.len(), 5);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_highlight_terms() {
        let terms = vec!["女士".to_string(), "张女士".to_string(), "投诉".to_string()];
        assert_eq!(
            highlight_terms("张女士的投诉", &terms),
            "**张女士**的**投诉**"
        );
        assert_eq!(highlight_terms("无匹配", &terms), "无匹配");
    }
}
