//! Multi-path retrieval: the original query plus entity, sub-query and
//! synonym paths, fused and rescored
//!
//! Simple queries run a single two-layer search. Queries that are complex,
//! name a person or ask about complaints fan out into several paths, each
//! under its own deadline. A failed or expired path contributes nothing.

use crate::entities::{Lexicon, QueryAnalysis};
use crate::hierarchy::HierarchicalIndex;
use crate::query::{DecomposedQuery, QueryDecomposer};
use crate::retrieval::{
    dedupe_by_content_prefix, dedupe_by_id, sort_by_score, truncate_preserving_terms,
    HierarchicalRetriever, PathDeadline, RetrievalError, RetrievalPathResult, ScoredFragment,
    SearchConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

const PERSON_VARIANTS: &[&str] = &["投诉", "相关", "反映", ""];
const LENGTH_PENALTY_CHARS: f32 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    SingleHierarchical,
    MultiPath,
}

impl RetrievalMode {
    /// MultiPath for complex queries, queries naming a person and complaint queries
    pub fn for_analysis(analysis: &QueryAnalysis, complexity_threshold: f32) -> Self {
        if analysis.complexity_score >= complexity_threshold
            || !analysis.entities.persons.is_empty()
            || analysis.query_intent.is_complaint()
        {
            RetrievalMode::MultiPath
        } else {
            RetrievalMode::SingleHierarchical
        }
    }
}

/// What one path contributed, for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathSummary {
    pub name: String,
    pub query: String,
    pub hits: usize,
    pub timed_out: bool,
}

impl From<&RetrievalPathResult> for PathSummary {
    fn from(result: &RetrievalPathResult) -> Self {
        Self {
            name: result.name.clone(),
            query: result.query.clone(),
            hits: result.hits.len(),
            timed_out: result.timed_out,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultiPathOutcome {
    pub mode: RetrievalMode,
    pub hits: Vec<ScoredFragment>,
    pub paths: Vec<PathSummary>,
}

pub struct MultiPathRetriever {
    decomposer: Arc<QueryDecomposer>,
    hierarchical: HierarchicalRetriever,
}

impl MultiPathRetriever {
    pub fn new(decomposer: Arc<QueryDecomposer>, hierarchical: HierarchicalRetriever) -> Self {
        Self {
            decomposer,
            hierarchical,
        }
    }

    pub fn decomposer(&self) -> &QueryDecomposer {
        &self.decomposer
    }

    pub fn search(
        &self,
        index: &HierarchicalIndex,
        query: &str,
        params: &SearchConfig,
    ) -> MultiPathOutcome {
        let config = self.hierarchical.config();
        let analysis = self.decomposer.analyze(query);
        let mode = RetrievalMode::for_analysis(&analysis, config.complexity_threshold);

        if mode == RetrievalMode::SingleHierarchical {
            let main = self.run_path(index, "main", query, &analysis, params);
            return MultiPathOutcome {
                mode,
                paths: vec![PathSummary::from(&main)],
                hits: main.hits,
            };
        }

        let decomposed = self.decomposer.decompose_analyzed(query, analysis);
        let paths = self.run_paths(index, &decomposed, params);

        let entities = decomposed.analysis.entities.all();
        let fused = fuse(&paths, &entities, params.top_k);
        let hits = rescore(
            fused,
            &decomposed.analysis,
            query,
            self.decomposer.rules().extractor().lexicon(),
            params.top_k,
        );

        debug!(
            "Multi-path search for '{}': {} paths, {} fused hits",
            query,
            paths.len(),
            hits.len()
        );

        MultiPathOutcome {
            mode,
            hits,
            paths: paths.iter().map(PathSummary::from).collect(),
        }
    }

    fn run_paths(
        &self,
        index: &HierarchicalIndex,
        decomposed: &DecomposedQuery,
        params: &SearchConfig,
    ) -> Vec<RetrievalPathResult> {
        let config = self.hierarchical.config();
        let query = decomposed.query.as_str();
        let entities = &decomposed.analysis.entities;
        let mut paths = vec![self.run_path(index, "main", query, &decomposed.analysis, params)];

        for person in entities.persons.iter().take(config.max_entity_paths) {
            let name = format!("entity:{}", person);
            let mut last = None;
            for variant in PERSON_VARIANTS {
                let path_query = format!("{}{}", person, variant);
                let result = self.run_rule_path(index, &name, &path_query, params);
                let found = !result.is_empty();
                last = Some(result);
                if found {
                    break;
                }
            }
            paths.extend(last);
        }

        if let Some(org) = entities.organizations.first() {
            paths.push(self.run_rule_path(index, &format!("entity:{}", org), org, params));
        }

        let sub_queries = decomposed
            .sub_queries
            .iter()
            .filter(|q| q.as_str() != query)
            .take(config.max_sub_query_paths);
        for (n, sub_query) in sub_queries.enumerate() {
            let name = format!("sub_query:{}", n + 1);
            paths.push(self.run_rule_path(index, &name, sub_query, params));
        }

        let synonyms = decomposed
            .expansions
            .iter()
            .map(|e| e.apply(query))
            .filter(|q| q != query)
            .take(config.max_synonym_paths);
        for (n, synonym_query) in synonyms.enumerate() {
            let name = format!("synonym:{}", n + 1);
            paths.push(self.run_rule_path(index, &name, &synonym_query, params));
        }

        paths
    }

    /// Secondary paths are analysed by the rules only
    fn run_rule_path(
        &self,
        index: &HierarchicalIndex,
        name: &str,
        query: &str,
        params: &SearchConfig,
    ) -> RetrievalPathResult {
        let analysis = self.decomposer.rules().analyze_query(query);
        self.run_path(index, name, query, &analysis, params)
    }

    fn run_path(
        &self,
        index: &HierarchicalIndex,
        name: &str,
        query: &str,
        analysis: &QueryAnalysis,
        params: &SearchConfig,
    ) -> RetrievalPathResult {
        let deadline = PathDeadline::from_millis(self.hierarchical.config().path_timeout_ms);
        match self.hierarchical.search(index, query, analysis, params, &deadline) {
            Ok(hits) => {
                debug!(
                    "Path {} ('{}'): {} hits in {:?}",
                    name,
                    query,
                    hits.len(),
                    deadline.elapsed()
                );
                RetrievalPathResult::new(name, query, hits)
            }
            Err(RetrievalError::DeadlineExceeded) => {
                warn!("Path {} ('{}') timed out after {:?}", name, query, deadline.elapsed());
                RetrievalPathResult::timed_out(name, query)
            }
            Err(e) => {
                warn!("Path {} ('{}') failed: {}", name, query, e);
                RetrievalPathResult::new(name, query, Vec::new())
            }
        }
    }
}

/// Merge path results in path order
///
/// Duplicates by id and by content prefix are dropped. Once `top_k` hits are
/// kept, only hits mentioning one of `entities` are accepted.
fn fuse(paths: &[RetrievalPathResult], entities: &[String], top_k: usize) -> Vec<ScoredFragment> {
    let all: Vec<ScoredFragment> = paths.iter().flat_map(|p| p.hits.iter().cloned()).collect();
    let unique = dedupe_by_content_prefix(dedupe_by_id(all));

    let mut kept = Vec::new();
    for hit in unique {
        if kept.len() < top_k || entities.iter().any(|e| hit.content().contains(e.as_str())) {
            kept.push(hit);
        }
    }
    kept
}

/// Replace scores with a query-aware relevance score and keep the best `top_k`
///
/// The score weighs query-term overlap, entity coverage, intent keywords and
/// provenance, minus a small penalty for long fragments. Every entity that
/// appears in some hit keeps at least one hit when slots allow.
pub fn rescore(
    hits: Vec<ScoredFragment>,
    analysis: &QueryAnalysis,
    query: &str,
    lexicon: &Lexicon,
    top_k: usize,
) -> Vec<ScoredFragment> {
    let mut terms: Vec<String> = analysis
        .keywords
        .iter()
        .map(|k| k.term.to_lowercase())
        .collect();
    if terms.is_empty() {
        terms = query.split_whitespace().map(|w| w.to_lowercase()).collect();
    }
    let entities = analysis.entities.all();
    let intent_words: &[String] = lexicon
        .words
        .intent_keywords
        .get(analysis.query_intent.as_str())
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let ratio = |present: usize, total: usize| {
        if total == 0 {
            0.0
        } else {
            present as f32 / total as f32
        }
    };

    let mut scored: Vec<ScoredFragment> = hits
        .into_iter()
        .map(|mut hit| {
            let content = hit.content().to_lowercase();
            let term_hits = terms.iter().filter(|t| content.contains(t.as_str())).count();
            let entity_hits = entities
                .iter()
                .filter(|e| content.contains(e.to_lowercase().as_str()))
                .count();
            let intent_hits = intent_words
                .iter()
                .filter(|w| content.contains(w.as_str()))
                .count();

            let mut score = ratio(term_hits, terms.len()) * 0.4
                + ratio(entity_hits, entities.len()) * 0.35
                + entity_hits as f32 * 0.1
                + ratio(intent_hits, intent_words.len()) * 0.15;
            if hit.fragment.source().is_some() {
                score += 0.05;
            }
            if !hit.fragment.fragment_id.is_empty() {
                score += 0.05;
            }
            let length = hit.fragment.char_len() as f32;
            score -= (length / LENGTH_PENALTY_CHARS).min(1.0) * 0.05;

            hit.score = score.max(0.0);
            hit
        })
        .collect();

    sort_by_score(&mut scored);
    truncate_preserving_terms(scored, &entities, top_k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HierarchyConfig, IndexingConfig, RetrievalConfig};
    use crate::document::test_support::fragment;
    use crate::document::Fragment;
    use crate::embedding::{EmbeddingProvider, HashEmbeddingProvider};
    use crate::entities::{KeywordExtractor, RuleAnalyzer};
    use crate::hierarchy::HierarchicalIndexBuilder;
    use crate::retrieval::EnsembleRetriever;
    use serde_json::Map;

    fn extractor() -> KeywordExtractor {
        KeywordExtractor::new(Arc::new(Lexicon::builtin().unwrap()))
    }

    fn setup(
        fragments: Vec<Fragment>,
        config: RetrievalConfig,
    ) -> (HierarchicalIndex, MultiPathRetriever) {
        let extractor = extractor();
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbeddingProvider::new(64));
        let index = HierarchicalIndexBuilder::new(
            &extractor,
            &HierarchyConfig::default(),
            &IndexingConfig::default(),
        )
        .build("kb", fragments, provider.as_ref())
        .unwrap();
        let fallback =
            EnsembleRetriever::new(extractor.clone(), provider.clone(), &config).unwrap();
        let hierarchical = HierarchicalRetriever::new(provider, config, fallback);
        let decomposer = Arc::new(QueryDecomposer::new(RuleAnalyzer::new(extractor)));
        (index, MultiPathRetriever::new(decomposer, hierarchical))
    }

    fn corpus() -> Vec<Fragment> {
        vec![
            fragment("complaints.csv", 1, "张女士投诉物业噪音扰民"),
            fragment("complaints.csv", 2, "张女士反映小区绿化被破坏"),
            fragment("complaints.csv", 3, "李先生投诉停车收费不合理"),
            fragment("notice.txt", 1, "关于食堂卫生检查的通知"),
            fragment("rules.txt", 1, "投诉处理规定：受理后十五日内答复"),
        ]
    }

    #[test]
    fn test_mode_selection() {
        let rules = RuleAnalyzer::new(extractor());
        let threshold = RetrievalConfig::default().complexity_threshold;

        let person = rules.analyze_query("张女士的投诉内容");
        assert_eq!(RetrievalMode::for_analysis(&person, threshold), RetrievalMode::MultiPath);

        let simple = rules.analyze_query("通知");
        assert_eq!(
            RetrievalMode::for_analysis(&simple, threshold),
            RetrievalMode::SingleHierarchical
        );
    }

    #[test]
    fn test_multipath_runs_paths_in_order() {
        let (index, retriever) = setup(corpus(), RetrievalConfig::default());
        let params = SearchConfig {
            top_k: 3,
            ..SearchConfig::default()
        };

        let outcome = retriever.search(&index, "张女士的投诉内容", &params);
        assert_eq!(outcome.mode, RetrievalMode::MultiPath);

        let names: Vec<&str> = outcome.paths.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names[0], "main");
        assert_eq!(names[1], "entity:张女士");
        assert!(names.iter().any(|n| n.starts_with("sub_query:")));
        assert!(names.iter().filter(|n| n.starts_with("sub_query:")).count() <= 3);
        assert!(names.iter().filter(|n| n.starts_with("synonym:")).count() <= 2);

        assert!(!outcome.hits.is_empty());
        assert!(outcome.hits.len() <= 3);
        assert!(outcome.hits[0].content().contains("张女士"));
        assert!(outcome.hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_single_mode_uses_main_path_only() {
        let (index, retriever) = setup(corpus(), RetrievalConfig::default());
        let outcome = retriever.search(&index, "通知", &SearchConfig::default());
        assert_eq!(outcome.mode, RetrievalMode::SingleHierarchical);
        assert_eq!(outcome.paths.len(), 1);
        assert_eq!(outcome.paths[0].name, "main");
    }

    #[test]
    fn test_expired_paths_are_marked_not_fatal() {
        let config = RetrievalConfig {
            path_timeout_ms: 0,
            ..RetrievalConfig::default()
        };
        let (index, retriever) = setup(corpus(), config);

        let outcome = retriever.search(&index, "张女士的投诉内容", &SearchConfig::default());
        assert!(outcome.hits.is_empty());
        assert!(outcome.paths.iter().all(|p| p.timed_out && p.hits == 0));
    }

    #[test]
    fn test_fuse_dedupes_and_admits_entities_past_top_k() {
        let a = ScoredFragment::new(fragment("a.csv", 1, "张女士投诉噪音"), 0.9);
        let b = ScoredFragment::new(fragment("a.csv", 2, "停车收费"), 0.8);
        let c = ScoredFragment::new(fragment("a.csv", 3, "食堂卫生"), 0.7);
        let d = ScoredFragment::new(fragment("a.csv", 4, "李先生反映绿化"), 0.6);
        let copy = ScoredFragment::new(fragment("b.csv", 9, "张女士投诉噪音"), 0.5);

        let paths = vec![
            RetrievalPathResult::new("main", "q", vec![a.clone(), b, c]),
            RetrievalPathResult::new("entity:李先生", "q", vec![a, copy, d]),
        ];
        let fused = fuse(&paths, &["李先生".to_string()], 2);
        let ids: Vec<&str> = fused.iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec!["a.csv_row_1", "a.csv_row_2", "a.csv_row_4"]);
    }

    #[test]
    fn test_rescore_prefers_entity_matches() {
        let lexicon = Lexicon::builtin().unwrap();
        let analysis = RuleAnalyzer::new(extractor()).analyze_query("张女士的投诉内容");
        let hits = vec![
            ScoredFragment::new(fragment("a.csv", 1, "投诉处理规定"), 0.9),
            ScoredFragment::new(fragment("a.csv", 2, "张女士投诉物业噪音"), 0.1),
        ];

        let rescored = rescore(hits, &analysis, "张女士的投诉内容", &lexicon, 1);
        assert_eq!(rescored.len(), 1);
        assert_eq!(rescored[0].id(), "a.csv_row_2");
        assert!(rescored[0].score > 0.5);
    }

    #[test]
    fn test_rescore_never_goes_negative() {
        let lexicon = Lexicon::builtin().unwrap();
        let analysis = RuleAnalyzer::new(extractor()).analyze_query("张女士的投诉内容");
        let bare = Fragment::with_id("", "食堂".repeat(800), Map::new());

        let rescored = rescore(
            vec![ScoredFragment::new(bare, 0.9)],
            &analysis,
            "张女士的投诉内容",
            &lexicon,
            5,
        );
        assert_eq!(rescored.len(), 1);
        assert_eq!(rescored[0].score, 0.0);
    }
}
