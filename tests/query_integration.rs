//! Query analysis and decomposition through the public API

use std::sync::Arc;
use stratum::config::RetrievalConfig;
use stratum::entities::{AnalysisSource, KeywordExtractor, Lexicon, QueryIntent, RuleAnalyzer};
use stratum::query::QueryDecomposer;
use stratum::retrieval::RetrievalMode;

fn decomposer() -> QueryDecomposer {
    let extractor = KeywordExtractor::new(Arc::new(Lexicon::builtin().unwrap()));
    QueryDecomposer::new(RuleAnalyzer::new(extractor))
}

#[test]
fn test_person_complaint_query_engages_multi_path() {
    let decomposer = decomposer();
    let analysis = decomposer.analyze("张女士的投诉内容");

    assert_eq!(analysis.entities.persons, vec!["张女士"]);
    assert_eq!(analysis.query_intent, QueryIntent::ComplaintContent);
    assert_eq!(analysis.query_intent.as_str(), "complaint_content");
    assert!(analysis.complexity_score > 0.3);
    assert_eq!(analysis.source, AnalysisSource::Rules);

    let threshold = RetrievalConfig::default().complexity_threshold;
    assert_eq!(
        RetrievalMode::for_analysis(&analysis, threshold),
        RetrievalMode::MultiPath
    );
}

#[test]
fn test_plain_query_stays_single_path() {
    let analysis = decomposer().analyze("绿化");
    assert!(analysis.entities.persons.is_empty());
    assert_eq!(analysis.query_intent, QueryIntent::General);
    assert_eq!(
        RetrievalMode::for_analysis(&analysis, 0.9),
        RetrievalMode::SingleHierarchical
    );
}

#[test]
fn test_decomposition_yields_person_sub_queries() {
    let decomposed = decomposer().decompose("张女士的投诉内容");

    assert!(decomposed.sub_queries.iter().any(|q| q.starts_with("张女士")));
    assert!(decomposed.sub_queries.len() <= stratum::query::MAX_SUB_QUERIES);
    assert!(!decomposed.expansions.is_empty());
}
