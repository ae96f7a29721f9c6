//! Retrieval engine: knowledge-base resolution, retriever services, rebuilds
//!
//! A [`RetrieverService`] bundles the indices of one set of knowledge bases
//! with the retriever chosen for them. Services are resolved and loaded once,
//! cached by [`ServiceCache`] and shared immutably. Loading, searching and
//! rebuilding run on the blocking pool.

mod cache;
mod registry;

pub use cache::{CacheKey, CacheStats, ServiceCache};
pub use registry::{KnowledgeBase, Registry, REGISTRY_FILE};

use crate::config::{Config, RetrievalConfig};
use crate::document::scoped_id;
use crate::embedding::{resolve_provider, EmbeddingProvider, VectorIndex};
use crate::entities::{AiQueryAnalyzer, KeywordExtractor, Lexicon, QueryAnalyzer, RuleAnalyzer};
use crate::error::{Result, StratumError};
use crate::hierarchy::{
    flat_index_dir, rebuild_knowledge_base, HierarchicalIndex, RebuildResult, RebuildStatus,
    RebuildTracker,
};
use crate::query::QueryDecomposer;
use crate::retrieval::{
    sort_by_score, EnsembleRetriever, FlatRetriever, HierarchicalRetriever, MultiPathRetriever,
    PathDeadline, PathSummary, RankingWeights, RetrievalError, RetrievalMode, RetrieverKind,
    RetrieverKindChoice, ScoredFragment, SearchConfig, SourceScanner,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type RetrieverServiceCache = ServiceCache<RetrieverService>;

/// Result of one search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub query: String,
    pub hits: Vec<ScoredFragment>,
    /// Set when `hits` is empty
    pub reason: Option<String>,
    pub retriever: Option<RetrieverKind>,
    pub mode: Option<RetrievalMode>,
    pub paths: Vec<PathSummary>,
    pub used_source_fallback: bool,
}

impl SearchOutcome {
    fn empty(query: &str, reason: impl Into<String>) -> Self {
        Self {
            query: query.to_string(),
            hits: Vec::new(),
            reason: Some(reason.into()),
            retriever: None,
            mode: None,
            paths: Vec::new(),
            used_source_fallback: false,
        }
    }
}

/// Parameters a service is specialised for; part of its cache key
#[derive(Debug, Clone, PartialEq, Serialize)]
struct ServiceParams {
    top_k: usize,
    score_threshold: f32,
    summary_top_k: usize,
    summary_score_threshold: f32,
    chunk_score_threshold: f32,
    keyword_match_threshold: usize,
    context_window: usize,
    enable_ranking: bool,
    ranking: RankingWeights,
}

impl ServiceParams {
    fn new(params: &SearchConfig, retrieval: &RetrievalConfig) -> Self {
        Self {
            top_k: params.top_k,
            score_threshold: params.score_threshold,
            summary_top_k: retrieval.summary_top_k,
            summary_score_threshold: retrieval.summary_score_threshold,
            chunk_score_threshold: retrieval.chunk_score_threshold,
            keyword_match_threshold: params.keyword_match_threshold,
            context_window: params.context_window,
            enable_ranking: params.enable_ranking,
            ranking: params.ranking,
        }
    }
}

enum Backend {
    Hierarchical {
        index: HierarchicalIndex,
        retriever: MultiPathRetriever,
    },
    Ensemble {
        index: VectorIndex,
        retriever: EnsembleRetriever,
    },
    Flat {
        index: VectorIndex,
        retriever: FlatRetriever,
    },
}

/// Hits of one service search with diagnostics
struct ServiceHits {
    hits: Vec<ScoredFragment>,
    mode: Option<RetrievalMode>,
    paths: Vec<PathSummary>,
}

/// Loaded indices of a set of knowledge bases bound to one retriever
pub struct RetrieverService {
    kb_ids: Vec<String>,
    kind: RetrieverKind,
    params: SearchConfig,
    path_timeout_ms: u64,
    backend: Backend,
}

/// Everything a service load needs, owned so it can move to the blocking pool
struct ServiceLoader {
    kbs: Vec<(String, PathBuf)>,
    choice: RetrieverKindChoice,
    params: SearchConfig,
    config: Arc<Config>,
    provider: Arc<dyn EmbeddingProvider>,
    extractor: KeywordExtractor,
    decomposer: Arc<QueryDecomposer>,
}

impl ServiceLoader {
    fn load(self) -> Result<RetrieverService> {
        let retrieval = self.config.retrieval.clone();
        let wants_hierarchy = matches!(
            self.choice,
            RetrieverKindChoice::Auto | RetrieverKindChoice::Hierarchical
        );

        if wants_hierarchy {
            match self.load_hierarchical() {
                Some(index) => {
                    self.check_dimension(index.dimension())?;
                    let fallback = self.ensemble()?;
                    let hierarchical =
                        HierarchicalRetriever::new(self.provider.clone(), retrieval, fallback);
                    let retriever = MultiPathRetriever::new(self.decomposer.clone(), hierarchical);
                    return Ok(self.service(
                        RetrieverKind::Hierarchical,
                        Backend::Hierarchical { index, retriever },
                    ));
                }
                None if self.choice == RetrieverKindChoice::Hierarchical => {
                    warn!("Hierarchical index unavailable, using keyword ensemble");
                }
                None => {}
            }
        }

        let index = self.load_flat()?;
        self.check_dimension(index.dimension())?;
        let kind = match self.choice {
            RetrieverKindChoice::FlatVector => RetrieverKind::FlatVector,
            RetrieverKindChoice::KeywordEnsemble | RetrieverKindChoice::Hierarchical => {
                RetrieverKind::KeywordEnsemble
            }
            RetrieverKindChoice::Auto if index.len() > retrieval.ensemble_doc_threshold => {
                RetrieverKind::KeywordEnsemble
            }
            RetrieverKindChoice::Auto => RetrieverKind::FlatVector,
        };

        let backend = match kind {
            RetrieverKind::FlatVector => Backend::Flat {
                index,
                retriever: FlatRetriever::new(self.provider.clone()),
            },
            _ => Backend::Ensemble {
                index,
                retriever: self.ensemble()?,
            },
        };
        Ok(self.service(kind, backend))
    }

    fn service(&self, kind: RetrieverKind, backend: Backend) -> RetrieverService {
        info!(
            "Loaded {} retriever for {:?}",
            kind,
            self.kbs.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>()
        );
        RetrieverService {
            kb_ids: self.kbs.iter().map(|(id, _)| id.clone()).collect(),
            kind,
            params: self.params.clone(),
            path_timeout_ms: self.config.retrieval.path_timeout_ms,
            backend,
        }
    }

    fn ensemble(&self) -> Result<EnsembleRetriever> {
        EnsembleRetriever::new(
            self.extractor.clone(),
            self.provider.clone(),
            &self.config.retrieval,
        )
    }

    fn check_dimension(&self, index_dimension: usize) -> Result<()> {
        if index_dimension != self.provider.dimension() {
            return Err(StratumError::provider_unavailable(
                "embedding",
                format!(
                    "provider dimension {} does not match index dimension {}",
                    self.provider.dimension(),
                    index_dimension
                ),
            ));
        }
        Ok(())
    }

    /// Merged hierarchical index, only when every knowledge base has one
    fn load_hierarchical(&self) -> Option<HierarchicalIndex> {
        let mut merged: Option<HierarchicalIndex> = None;
        for (id, root) in &self.kbs {
            if !HierarchicalIndex::exists(root) {
                debug!("No hierarchical index for '{}'", id);
                return None;
            }
            let index = match HierarchicalIndex::load(root, &self.config.indexing) {
                Ok(index) if self.kbs.len() > 1 => index.scoped(id),
                Ok(index) => index,
                Err(e) => {
                    warn!("Cannot load hierarchical index of '{}': {}", id, e);
                    return None;
                }
            };
            merged = match merged {
                None => Some(index),
                Some(acc) => match acc.merge(index) {
                    Ok(acc) => Some(acc),
                    Err(e) => {
                        warn!("Cannot merge hierarchical index of '{}': {}", id, e);
                        return None;
                    }
                },
            };
        }
        merged
    }

    /// Merged flat index; knowledge bases that fail to load are skipped
    fn load_flat(&self) -> Result<VectorIndex> {
        let mut merged: Option<VectorIndex> = None;
        let mut last_error = None;

        for (id, root) in &self.kbs {
            let index = match VectorIndex::load_with_backup(&flat_index_dir(root), &self.config.indexing)
            {
                Ok(index) if self.kbs.len() > 1 => index.scoped(id),
                Ok(index) => index,
                Err(e) => {
                    warn!("Skipping knowledge base '{}': {}", id, e);
                    last_error = Some(StratumError::from(e));
                    continue;
                }
            };
            merged = Some(match merged {
                None => index,
                Some(acc) if acc.dimension() != index.dimension() => {
                    warn!(
                        "Skipping knowledge base '{}': dimension {} differs from {}",
                        id,
                        index.dimension(),
                        acc.dimension()
                    );
                    acc
                }
                Some(acc) => acc.merge(index)?,
            });
        }

        match (merged, last_error) {
            (Some(index), _) => Ok(index),
            (None, Some(e)) => Err(e),
            (None, None) => Err(StratumError::EmptyCorpus {
                kb: self
                    .kbs
                    .iter()
                    .map(|(id, _)| id.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            }),
        }
    }
}

impl RetrieverService {
    pub fn kind(&self) -> RetrieverKind {
        self.kind
    }

    pub fn kb_ids(&self) -> &[String] {
        &self.kb_ids
    }

    pub fn fragment_count(&self) -> usize {
        match &self.backend {
            Backend::Hierarchical { index, .. } => index.chunks.len(),
            Backend::Ensemble { index, .. } | Backend::Flat { index, .. } => index.len(),
        }
    }

    fn search(&self, query: &str) -> ServiceHits {
        let params = &self.params;
        let deadline = || PathDeadline::from_millis(self.path_timeout_ms);
        let single = |result: std::result::Result<Vec<ScoredFragment>, RetrievalError>| {
            let hits = match result {
                Ok(hits) => hits,
                Err(e) => {
                    warn!("{} search for '{}' failed: {}", self.kind, query, e);
                    Vec::new()
                }
            };
            ServiceHits {
                hits,
                mode: None,
                paths: Vec::new(),
            }
        };

        match &self.backend {
            Backend::Hierarchical { index, retriever } => {
                let outcome = retriever.search(index, query, params);
                ServiceHits {
                    hits: outcome.hits,
                    mode: Some(outcome.mode),
                    paths: outcome.paths,
                }
            }
            Backend::Ensemble { index, retriever } => {
                single(retriever.search(index, query, params, &deadline()))
            }
            Backend::Flat { index, retriever } => {
                single(retriever.search(index, query, params, &deadline()))
            }
        }
    }
}

/// Entry point for searches and rebuilds over registered knowledge bases
pub struct RetrievalEngine {
    config: Arc<Config>,
    registry: Registry,
    extractor: KeywordExtractor,
    decomposer: Arc<QueryDecomposer>,
    scanner: Arc<SourceScanner>,
    providers: Mutex<HashMap<Option<String>, Arc<dyn EmbeddingProvider>>>,
    cache: Arc<RetrieverServiceCache>,
    rebuilds: RebuildTracker,
}

impl RetrievalEngine {
    /// Engine over the registry named by `config.storage`
    pub fn new(config: Config) -> Result<Self> {
        let registry = Registry::load(&config.storage.registry_dir(), &config.storage.kb_dir())?;
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: Config, registry: Registry) -> Result<Self> {
        let lexicon = Arc::new(Lexicon::from_config(&config.lexicon)?);
        let extractor = KeywordExtractor::new(lexicon.clone());

        let mut decomposer = QueryDecomposer::new(RuleAnalyzer::new(extractor.clone()));
        if config.analyzer.enabled {
            match AiQueryAnalyzer::new(&config.analyzer, lexicon) {
                Ok(ai) => {
                    let ai: Arc<dyn QueryAnalyzer> = Arc::new(ai);
                    decomposer = decomposer.with_ai(ai);
                }
                Err(e) => warn!("AI analyzer unavailable, using rules only: {}", e),
            }
        }

        Ok(Self {
            scanner: Arc::new(SourceScanner::new(config.fallback.clone(), extractor.clone())),
            cache: Arc::new(ServiceCache::new(config.cache.capacity)),
            config: Arc::new(config),
            registry,
            extractor,
            decomposer: Arc::new(decomposer),
            providers: Mutex::new(HashMap::new()),
            rebuilds: RebuildTracker::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn provider(&self, model_id: Option<&str>) -> Result<Arc<dyn EmbeddingProvider>> {
        let key = model_id.map(str::to_string);
        if let Some(provider) = self
            .providers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Ok(provider.clone());
        }

        let provider = resolve_provider(&self.config.embedding, model_id)?;
        self.providers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, provider.clone());
        Ok(provider)
    }

    /// Known knowledge bases among `kb_ids`; unknown ids are skipped
    fn resolve_kbs(&self, kb_ids: &[String]) -> Vec<&KnowledgeBase> {
        let mut kbs: Vec<&KnowledgeBase> = Vec::new();
        for id in kb_ids {
            match self.registry.get(id) {
                Some(kb) if !kbs.iter().any(|k| k.id == kb.id) => kbs.push(kb),
                Some(_) => {}
                None => warn!("{}, skipping", StratumError::KnowledgeBaseNotFound { id: id.clone() }),
            }
        }
        kbs
    }

    /// Search `kb_ids` for `query`
    ///
    /// Only an empty query is an error. Retrieval failures produce an empty
    /// outcome with a `reason`.
    pub async fn search(
        &self,
        query: &str,
        kb_ids: &[String],
        top_k: usize,
        params: &SearchConfig,
    ) -> Result<SearchOutcome> {
        let query = query.trim();
        if query.is_empty() {
            return Err(StratumError::InvalidQuery("query is empty".to_string()));
        }
        let params = SearchConfig {
            top_k,
            ..params.clone()
        };
        if top_k == 0 {
            return Ok(SearchOutcome::empty(query, "top_k is 0"));
        }

        let kbs = self.resolve_kbs(kb_ids);
        if kbs.is_empty() {
            return Ok(SearchOutcome::empty(query, "no known knowledge base requested"));
        }
        let roots: Vec<(String, PathBuf)> = kbs
            .iter()
            .map(|kb| (kb.id.clone(), self.registry.kb_root(kb)))
            .collect();

        let (mut hits, reason, retriever, mode, paths) =
            match self.service(&kbs, &roots, &params).await {
                Ok(service) => {
                    let kind = service.kind();
                    let query_owned = query.to_string();
                    let found = tokio::task::spawn_blocking(move || service.search(&query_owned))
                        .await
                        .map_err(|e| StratumError::Other(anyhow::anyhow!("search task failed: {}", e)))?;
                    (found.hits, None, Some(kind), found.mode, found.paths)
                }
                Err(e) => {
                    warn!("No retriever for {:?}: {}", kb_ids, e);
                    (Vec::new(), Some(e.to_string()), None, None, Vec::new())
                }
            };

        let mut used_source_fallback = false;
        if hits.is_empty() && self.scanner.enabled() {
            hits = self.scan_sources(query, &roots, top_k).await;
            used_source_fallback = !hits.is_empty();
        }

        hits.retain(|h| h.score >= params.score_threshold);
        let reason = if hits.is_empty() {
            Some(reason.unwrap_or_else(|| {
                StratumError::NoResults {
                    query: query.to_string(),
                }
                .to_string()
            }))
        } else {
            None
        };

        info!(
            "Search '{}' over {:?}: {} hits via {}",
            query,
            roots.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            hits.len(),
            if used_source_fallback {
                "source_fallback"
            } else {
                retriever.map(|k| k.as_str()).unwrap_or("none")
            }
        );

        Ok(SearchOutcome {
            query: query.to_string(),
            hits,
            reason,
            retriever,
            mode,
            paths,
            used_source_fallback,
        })
    }

    async fn service(
        &self,
        kbs: &[&KnowledgeBase],
        roots: &[(String, PathBuf)],
        params: &SearchConfig,
    ) -> Result<Arc<RetrieverService>> {
        let model_id = kbs.first().and_then(|kb| kb.embedding_model_id.as_deref());
        if kbs.iter().any(|kb| kb.embedding_model_id.as_deref() != model_id) {
            warn!("Knowledge bases use different embedding models, using '{:?}'", model_id);
        }
        let provider = self.provider(model_id)?;

        let ids: Vec<String> = roots.iter().map(|(id, _)| id.clone()).collect();
        let key = CacheKey::new(
            &ids,
            params.retriever_kind,
            &provider.identity(),
            &ServiceParams::new(params, &self.config.retrieval),
        )?;
        if let Some(service) = self.cache.get(&key) {
            debug!("Cache hit for {:?}", key.kb_ids());
            return Ok(service);
        }

        let load_lock = self.cache.load_lock(&key);
        let _loading = load_lock.lock().await;
        if let Some(service) = self.cache.peek(&key) {
            debug!("Service for {:?} loaded by a concurrent request", key.kb_ids());
            return Ok(service);
        }
        let generation = self.cache.generation(&key);

        let loader = ServiceLoader {
            kbs: roots.to_vec(),
            choice: params.retriever_kind,
            params: params.clone(),
            config: self.config.clone(),
            provider,
            extractor: self.extractor.clone(),
            decomposer: self.decomposer.clone(),
        };
        let service = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|e| StratumError::Other(anyhow::anyhow!("load task failed: {}", e)))??;
        Ok(self.cache.insert_if_current(key, Arc::new(service), generation))
    }

    async fn scan_sources(
        &self,
        query: &str,
        roots: &[(String, PathBuf)],
        top_k: usize,
    ) -> Vec<ScoredFragment> {
        let scanner = self.scanner.clone();
        let roots = roots.to_vec();
        let query = query.to_string();
        let scanned = tokio::task::spawn_blocking(move || {
            let mut hits = Vec::new();
            let scoped = roots.len() > 1;
            for (id, root) in &roots {
                match scanner.scan(root, &query, top_k) {
                    Ok(found) if scoped => hits.extend(found.into_iter().map(|mut hit| {
                        hit.fragment.fragment_id = scoped_id(id, &hit.fragment.fragment_id);
                        hit
                    })),
                    Ok(found) => hits.extend(found),
                    Err(e) => warn!("Source scan of '{}' failed: {}", id, e),
                }
            }
            sort_by_score(&mut hits);
            hits.truncate(top_k);
            hits
        })
        .await;

        scanned.unwrap_or_else(|e| {
            warn!("Source scan task failed: {}", e);
            Vec::new()
        })
    }

    fn rebuild_job(&self, kb_id: &str, force: bool) -> std::result::Result<RebuildJob, RebuildResult> {
        let kb = self.registry.get(kb_id).ok_or_else(|| {
            RebuildResult::error(StratumError::KnowledgeBaseNotFound { id: kb_id.to_string() }.to_string())
        })?;
        let provider = self
            .provider(kb.embedding_model_id.as_deref())
            .map_err(|e| RebuildResult::error(e.to_string()))?;

        Ok(RebuildJob {
            lock: self.rebuilds.kb_lock(&kb.id),
            kb_id: kb.id.clone(),
            kb_name: kb.name.clone(),
            kb_root: self.registry.kb_root(kb),
            provider,
            extractor: self.extractor.clone(),
            config: self.config.clone(),
            cache: self.cache.clone(),
            force,
        })
    }

    /// Rebuild the hierarchical index of `kb_id` when its trigger fires
    pub async fn rebuild_hierarchical_index(&self, kb_id: &str) -> RebuildResult {
        self.rebuild(kb_id, false).await
    }

    /// Rebuild regardless of the trigger
    pub async fn force_rebuild(&self, kb_id: &str) -> RebuildResult {
        self.rebuild(kb_id, true).await
    }

    async fn rebuild(&self, kb_id: &str, force: bool) -> RebuildResult {
        let job = match self.rebuild_job(kb_id, force) {
            Ok(job) => job,
            Err(result) => return result,
        };
        tokio::task::spawn_blocking(move || job.run())
            .await
            .unwrap_or_else(|e| RebuildResult::error(format!("rebuild task failed: {}", e)))
    }

    /// Start a rebuild in the background; poll it with [`Self::rebuild_status`]
    pub fn spawn_rebuild(&self, kb_id: &str, force: bool) -> Result<Uuid> {
        let job = self.rebuild_job(kb_id, force).map_err(|result| {
            StratumError::Other(anyhow::anyhow!("cannot rebuild '{}': {}", kb_id, result.message))
        })?;
        self.rebuilds.spawn(kb_id, move || job.run())
    }

    pub fn rebuild_status(&self, kb_id: &str) -> RebuildStatus {
        self.rebuilds.status(kb_id)
    }
}

struct RebuildJob {
    /// Serialises rebuilds of one knowledge base
    lock: Arc<Mutex<()>>,
    kb_id: String,
    kb_name: String,
    kb_root: PathBuf,
    provider: Arc<dyn EmbeddingProvider>,
    extractor: KeywordExtractor,
    config: Arc<Config>,
    cache: Arc<RetrieverServiceCache>,
    force: bool,
}

impl RebuildJob {
    fn run(self) -> RebuildResult {
        let _rebuilding = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let result = rebuild_knowledge_base(
            &self.kb_root,
            &self.kb_name,
            self.provider.as_ref(),
            &self.extractor,
            &self.config,
            self.force,
        );
        if result.action == crate::hierarchy::RebuildAction::Rebuilt {
            self.cache.invalidate_kb(&self.kb_id);
        }
        result
    }
}
