//! End-to-end searches through the retrieval engine
//!
//! Every knowledge base is built with the hashing embedder, so no model
//! download is needed.

use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use stratum::config::{Config, ModelConfig, ProviderKind};
use stratum::document::{Fragment, SOURCE_KEY};
use stratum::embedding::{HashEmbeddingProvider, VectorIndex};
use stratum::hierarchy::{flat_index_dir, HierarchicalIndex, RebuildAction, RebuildStatus};
use stratum::retrieval::{RetrievalMode, RetrieverKind, RetrieverKindChoice, SearchConfig};
use stratum::service::{RetrievalEngine, REGISTRY_FILE};
use stratum::StratumError;
use tempfile::TempDir;

fn fragment(source: &str, row: usize, content: &str) -> Fragment {
    let mut metadata = Map::new();
    metadata.insert(SOURCE_KEY.into(), Value::from(source));
    metadata.insert("row".into(), Value::from(row));
    Fragment::new(content, metadata)
}

fn config(temp: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.kb_dir = temp.path().join("kbs");
    config.storage.registry_dir = temp.path().to_path_buf();
    config.embedding.default = ModelConfig {
        provider: ProviderKind::Hashing,
        model: "hash-64".into(),
        dimension: 64,
        ..ModelConfig::default()
    };
    config
}

/// Register `(id, name)` pairs in `knowledge_bases.json`
fn register(temp: &TempDir, kbs: &[(&str, &str)]) {
    let entries: Vec<Value> = kbs
        .iter()
        .map(|(id, name)| json!({ "id": id, "name": name }))
        .collect();
    std::fs::write(
        temp.path().join(REGISTRY_FILE),
        serde_json::to_vec(&Value::from(entries)).unwrap(),
    )
    .unwrap();
}

fn write_flat(root: &Path, fragments: Vec<Fragment>, config: &Config) {
    let index = if fragments.is_empty() {
        VectorIndex::new(64, &config.indexing)
    } else {
        VectorIndex::build(fragments, &HashEmbeddingProvider::new(64), &config.indexing).unwrap()
    };
    index.save(&flat_index_dir(root)).unwrap();
}

fn complaints() -> Vec<Fragment> {
    let mut fragments = Vec::new();
    for i in 0..12 {
        fragments.push(fragment("zhang.csv", i, &format!("张女士第{}次投诉物业噪音扰民", i)));
    }
    fragments.push(fragment("li.csv", 1, "李先生投诉停车收费不合理"));
    fragments.push(fragment("misc.csv", 1, "小区绿化养护计划"));
    fragments
}

fn engine_with(temp: &TempDir, fragments: Vec<Fragment>, tweak: impl FnOnce(&mut Config)) -> RetrievalEngine {
    let mut config = config(temp);
    tweak(&mut config);
    register(temp, &[("kb1", "complaints")]);
    write_flat(&config.storage.kb_dir().join("complaints"), fragments, &config);
    RetrievalEngine::new(config).unwrap()
}

fn kb1() -> Vec<String> {
    vec!["kb1".to_string()]
}

fn ids(hits: &[stratum::retrieval::ScoredFragment]) -> HashSet<String> {
    hits.iter().map(|h| h.id().to_string()).collect()
}

#[tokio::test]
async fn test_flat_only_kb_uses_keyword_ensemble() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(&temp, complaints(), |c| c.retrieval.ensemble_doc_threshold = 0);

    let outcome = engine
        .search("物业噪音", &kb1(), 3, &SearchConfig::default())
        .await
        .unwrap();

    assert_eq!(outcome.retriever, Some(RetrieverKind::KeywordEnsemble));
    assert!(!outcome.hits.is_empty());
    assert!(outcome.hits.len() <= 3);
    assert!(outcome.hits.iter().any(|h| h.content().contains("噪音")));
    assert!(outcome.reason.is_none());
}

#[tokio::test]
async fn test_empty_kb_returns_reason_not_error() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(&temp, Vec::new(), |_| {});

    let rebuild = engine.rebuild_hierarchical_index("kb1").await;
    assert_eq!(rebuild.action, RebuildAction::RebuildFailed);

    let outcome = engine
        .search("投诉", &kb1(), 5, &SearchConfig::default())
        .await
        .unwrap();
    assert!(outcome.hits.is_empty());
    assert!(outcome.reason.is_some());
}

#[tokio::test]
async fn test_person_and_intent_query_runs_multiple_paths() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(&temp, complaints(), |c| {
        c.retrieval.summary_score_threshold = 0.0;
        c.retrieval.chunk_score_threshold = 0.0;
    });
    assert!(engine.rebuild_hierarchical_index("kb1").await.success);

    let outcome = engine
        .search("张女士的投诉内容", &kb1(), 5, &SearchConfig::default())
        .await
        .unwrap();

    assert_eq!(outcome.retriever, Some(RetrieverKind::Hierarchical));
    assert_eq!(outcome.mode, Some(RetrievalMode::MultiPath));
    assert_eq!(outcome.paths[0].name, "main");
    assert!(outcome.paths.iter().any(|p| p.name.starts_with("entity:")));
    assert!(outcome.hits.iter().any(|h| h.content().contains("张女士")));
}

#[tokio::test]
async fn test_every_matched_entity_survives_truncation() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(&temp, complaints(), |c| {
        c.retrieval.summary_score_threshold = 0.0;
        c.retrieval.chunk_score_threshold = 0.0;
    });
    assert!(engine.rebuild_hierarchical_index("kb1").await.success);

    let outcome = engine
        .search("张女士和李先生的投诉内容", &kb1(), 2, &SearchConfig::default())
        .await
        .unwrap();

    assert_eq!(outcome.hits.len(), 2);
    assert!(outcome.hits.iter().any(|h| h.content().contains("张女士")));
    assert!(outcome.hits.iter().any(|h| h.content().contains("李先生")));
}

#[tokio::test]
async fn test_lower_threshold_returns_superset() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(&temp, complaints(), |_| {});

    let mut previous: Option<HashSet<String>> = None;
    for threshold in [0.6, 0.3, 0.1, 0.0] {
        let params = SearchConfig {
            score_threshold: threshold,
            retriever_kind: RetrieverKindChoice::FlatVector,
            ..SearchConfig::default()
        };
        let outcome = engine.search("物业噪音投诉", &kb1(), 5, &params).await.unwrap();
        assert!(outcome.hits.iter().all(|h| h.score >= threshold));

        let current = ids(&outcome.hits);
        if let Some(previous) = &previous {
            assert!(previous.is_subset(&current), "threshold {} lost hits", threshold);
        }
        previous = Some(current);
    }
}

#[tokio::test]
async fn test_identical_requests_share_cached_service() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(&temp, complaints(), |_| {});
    let params = SearchConfig::default();

    let first = engine.search("停车收费", &kb1(), 3, &params).await.unwrap();
    let second = engine.search("物业噪音", &kb1(), 3, &params).await.unwrap();
    assert_eq!(first.retriever, second.retriever);

    let stats = engine.cache_stats();
    assert_eq!(stats.len, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);

    engine.search("物业噪音", &kb1(), 4, &params).await.unwrap();
    assert_eq!(engine.cache_stats().len, 2);
}

#[tokio::test]
async fn test_rebuild_invalidates_cached_services() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(&temp, complaints(), |_| {});

    let before = engine
        .search("物业噪音", &kb1(), 3, &SearchConfig::default())
        .await
        .unwrap();
    assert_eq!(before.retriever, Some(RetrieverKind::FlatVector));
    assert_eq!(engine.cache_stats().len, 1);

    let job = engine.spawn_rebuild("kb1", false).unwrap();
    let result = loop {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let RebuildStatus::Finished { job_id, result, .. } = engine.rebuild_status("kb1") {
            assert_eq!(job_id, job);
            break result;
        }
    };
    assert_eq!(result.action, RebuildAction::Rebuilt);
    assert_eq!(engine.cache_stats().len, 0);

    let after = engine
        .search("物业噪音", &kb1(), 3, &SearchConfig::default())
        .await
        .unwrap();
    assert_eq!(after.retriever, Some(RetrieverKind::Hierarchical));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_load_racing_a_rebuild_never_caches_the_old_index() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(&temp, complaints(), |_| {});
    let params = SearchConfig::default();
    let kbs = kb1();

    let (searched, rebuilt) = tokio::join!(
        engine.search("物业噪音", &kbs, 3, &params),
        engine.rebuild_hierarchical_index("kb1"),
    );
    assert!(searched.is_ok());
    assert_eq!(rebuilt.action, RebuildAction::Rebuilt);

    let after = engine.search("物业噪音", &kbs, 3, &params).await.unwrap();
    assert_eq!(after.retriever, Some(RetrieverKind::Hierarchical));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_misses_load_once() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(&temp, complaints(), |_| {});
    let params = SearchConfig::default();
    let kbs = kb1();

    let (a, b, c) = tokio::join!(
        engine.search("停车收费", &kbs, 3, &params),
        engine.search("物业噪音", &kbs, 3, &params),
        engine.search("绿化", &kbs, 3, &params),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(engine.cache_stats().len, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rebuilds_of_one_kb_are_serialised() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(&temp, complaints(), |_| {});

    let background = engine.spawn_rebuild("kb1", true).unwrap();
    let (first, second, third) = tokio::join!(
        engine.force_rebuild("kb1"),
        engine.force_rebuild("kb1"),
        engine.rebuild_hierarchical_index("kb1"),
    );
    assert_eq!(first.action, RebuildAction::Rebuilt);
    assert_eq!(second.action, RebuildAction::Rebuilt);
    assert!(third.success);

    let result = loop {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let RebuildStatus::Finished { job_id, result, .. } = engine.rebuild_status("kb1") {
            assert_eq!(job_id, background);
            break result;
        }
    };
    assert!(result.success);

    let root = temp.path().join("kbs").join("complaints");
    let index = HierarchicalIndex::load(&root, &engine.config().indexing).unwrap();
    assert_eq!(index.chunks.len(), complaints().len());
}

#[tokio::test]
async fn test_multiple_kbs_are_searched_together() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    register(&temp, &[("kb1", "complaints"), ("kb2", "parking")]);
    write_flat(
        &config.storage.kb_dir().join("complaints"),
        vec![fragment("zhang.csv", 1, "张女士投诉物业噪音扰民")],
        &config,
    );
    write_flat(
        &config.storage.kb_dir().join("parking"),
        vec![fragment("li.csv", 1, "李先生投诉停车收费不合理")],
        &config,
    );
    let engine = RetrievalEngine::new(config).unwrap();

    let kbs = vec!["kb1".to_string(), "kb2".to_string(), "unknown".to_string()];
    let params = SearchConfig {
        retriever_kind: RetrieverKindChoice::FlatVector,
        ..SearchConfig::default()
    };
    let outcome = engine.search("投诉", &kbs, 5, &params).await.unwrap();

    let found = ids(&outcome.hits);
    assert!(found.contains("kb1:zhang.csv_row_1"));
    assert!(found.contains("kb2:li.csv_row_1"));
}

#[tokio::test]
async fn test_same_stem_sources_are_distinct_hits() {
    let temp = TempDir::new().unwrap();
    let fragments = vec![
        fragment("2023/report.csv", 1, "张女士投诉物业噪音扰民"),
        fragment("2024/report.csv", 1, "张女士投诉夜间施工噪音"),
        fragment("notes.txt", 1, "小区绿化养护计划"),
    ];
    let engine = engine_with(&temp, fragments, |c| {
        c.retrieval.summary_score_threshold = 0.0;
        c.retrieval.chunk_score_threshold = 0.0;
    });
    assert!(engine.rebuild_hierarchical_index("kb1").await.success);

    let outcome = engine
        .search("张女士的投诉内容", &kb1(), 5, &SearchConfig::default())
        .await
        .unwrap();

    assert_eq!(outcome.retriever, Some(RetrieverKind::Hierarchical));
    let found = ids(&outcome.hits);
    assert!(found.contains("2023/report.csv_row_1"));
    assert!(found.contains("2024/report.csv_row_1"));
}

#[tokio::test]
async fn test_equal_sources_in_two_kbs_are_both_found() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    register(&temp, &[("kb1", "north"), ("kb2", "south")]);
    for (name, content) in [("north", "张女士投诉物业噪音扰民"), ("south", "张女士投诉电梯故障")] {
        write_flat(
            &config.storage.kb_dir().join(name),
            vec![fragment("report.csv", 1, content)],
            &config,
        );
    }
    let engine = RetrievalEngine::new(config).unwrap();

    let kbs = vec!["kb1".to_string(), "kb2".to_string()];
    let params = SearchConfig {
        retriever_kind: RetrieverKindChoice::FlatVector,
        ..SearchConfig::default()
    };
    let outcome = engine.search("张女士投诉", &kbs, 5, &params).await.unwrap();

    assert_eq!(outcome.hits.len(), 2);
    let found = ids(&outcome.hits);
    assert!(found.contains("kb1:report.csv_row_1"));
    assert!(found.contains("kb2:report.csv_row_1"));
}

#[tokio::test]
async fn test_missing_indices_fall_back_to_source_scan() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    register(&temp, &[("kb1", "complaints")]);
    let content = config.storage.kb_dir().join("complaints").join("content");
    std::fs::create_dir_all(&content).unwrap();
    std::fs::write(
        content.join("complaints.csv"),
        "提供方姓名,具体问题\n张女士,物业噪音扰民\n李先生,停车收费\n",
    )
    .unwrap();
    let engine = RetrievalEngine::new(config).unwrap();

    let outcome = engine
        .search("张女士", &kb1(), 5, &SearchConfig::default())
        .await
        .unwrap();

    assert!(outcome.used_source_fallback);
    assert!(outcome.reason.is_none());
    assert_eq!(outcome.hits[0].id(), "complaints.csv_row_1");
}

#[tokio::test]
async fn test_invalid_inputs() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(&temp, complaints(), |_| {});

    let empty = engine.search("", &kb1(), 5, &SearchConfig::default()).await;
    assert!(matches!(empty, Err(StratumError::InvalidQuery(_))));

    let zero = engine
        .search("投诉", &kb1(), 0, &SearchConfig::default())
        .await
        .unwrap();
    assert!(zero.hits.is_empty());
    assert!(zero.reason.is_some());

    let unknown = engine
        .search("投诉", &["nope".to_string()], 5, &SearchConfig::default())
        .await
        .unwrap();
    assert!(unknown.hits.is_empty());
    assert!(unknown.reason.is_some());
}
