//! Configuration management for Stratum
//!
//! Loads the TOML configuration, applies environment overrides and profiles,
//! and validates every section before handing it to the engine.

use crate::error::{Result, StratumError};
use crate::retrieval::{RetrieverKindChoice, SearchConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

mod validator;

pub use validator::ConfigValidator;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub hierarchy: HierarchyConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rebuild: RebuildConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub lexicon: LexiconConfig,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverrides>,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Where knowledge bases and the registry live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Parent directory of every `<kb_root>`
    pub kb_dir: PathBuf,
    /// Directory holding `knowledge_bases.json`
    pub registry_dir: PathBuf,
}

impl StorageConfig {
    pub fn kb_dir(&self) -> PathBuf {
        expand_tilde(&self.kb_dir)
    }

    pub fn registry_dir(&self) -> PathBuf {
        expand_tilde(&self.registry_dir)
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kb_dir: PathBuf::from("~/.stratum/knowledge_base"),
            registry_dir: PathBuf::from("~/.stratum"),
        }
    }
}

/// Embedding backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local ONNX inference through fastembed
    FastEmbed,
    /// OpenAI-compatible `/embeddings` endpoint
    Http,
    /// Deterministic feature hashing, no model required
    Hashing,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FastEmbed => "fastembed",
            Self::Http => "http",
            Self::Hashing => "hashing",
        }
    }
}

/// A single embedding model definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub dimension: usize,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::FastEmbed,
            model: "all-MiniLM-L6-v2".to_string(),
            dimension: 384,
            api_base: None,
            api_key_env: None,
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider used when a knowledge base names no model, and as fallback
    pub default: ModelConfig,
    /// Batch size for document embedding
    pub batch_size: usize,
    /// Named models referenced by `embedding_model_id` in the registry
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            default: ModelConfig::default(),
            batch_size: 32,
            models: HashMap::new(),
        }
    }
}

/// Optional AI query analyzer (OpenAI-compatible chat endpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    pub enabled: bool,
    pub api_base: String,
    pub api_key_env: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_ms: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.1,
            timeout_ms: 15_000,
        }
    }
}

/// Vector index backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackendChoice {
    Auto,
    Exact,
    Hnsw,
}

/// Vector index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    pub backend: IndexBackendChoice,
    /// Below this many vectors `auto` uses exact search
    pub exact_search_limit: usize,
    pub hnsw_ef_construction: usize,
    pub hnsw_m: usize,
    pub hnsw_ef_search: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            backend: IndexBackendChoice::Auto,
            exact_search_limit: 5000,
            hnsw_ef_construction: 200,
            hnsw_m: 16,
            hnsw_ef_search: 64,
        }
    }
}

/// Labels of structured record fields used by the summary builder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordFieldsConfig {
    pub person: Vec<String>,
    pub organization: Vec<String>,
    pub category: Vec<String>,
    pub location: Vec<String>,
    pub content: Vec<String>,
}

impl Default for RecordFieldsConfig {
    fn default() -> Self {
        Self {
            person: vec!["提供方姓名".to_string()],
            organization: vec!["企业名称".to_string()],
            category: vec!["问题类别".to_string()],
            location: vec!["事发地".to_string()],
            content: vec!["具体问题".to_string()],
        }
    }
}

/// Hierarchical index construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchyConfig {
    pub filename_similarity: f32,
    pub content_similarity: f32,
    pub topic_similarity: f32,
    pub content_sample_chars: usize,
    pub topic_keywords: usize,
    pub verbatim_summary_chars: usize,
    pub summary_budget_chars: usize,
    pub version_tokens: Vec<String>,
    pub signal_words: Vec<String>,
    #[serde(default)]
    pub record_fields: RecordFieldsConfig,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        let words = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            filename_similarity: 0.8,
            content_similarity: 0.7,
            topic_similarity: 0.5,
            content_sample_chars: 200,
            topic_keywords: 10,
            verbatim_summary_chars: 500,
            summary_budget_chars: 400,
            version_tokens: words(&[
                "前件作废",
                "以此件为准",
                "修订版",
                "最新版",
                "更新版",
                "v1",
                "v2",
                "v3",
                "第一版",
                "第二版",
                "第三版",
                "初稿",
                "终稿",
                "正式版",
            ]),
            signal_words: words(&["通报", "通知", "事件", "情况", "要求", "措施", "处理"]),
            record_fields: RecordFieldsConfig::default(),
        }
    }
}

/// Retrieval pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub summary_top_k: usize,
    pub summary_score_threshold: f32,
    pub chunk_score_threshold: f32,
    pub relaxed_threshold_factor: f32,
    pub complexity_threshold: f32,
    pub group_boost: f32,
    pub enable_summary_fallback: bool,
    pub enable_entity_matching: bool,
    pub path_timeout_ms: u64,
    pub max_entity_paths: usize,
    pub max_sub_query_paths: usize,
    pub max_synonym_paths: usize,
    /// Flat indices above this size get the keyword ensemble under `auto`
    pub ensemble_doc_threshold: usize,
    pub rrf_k: f32,
    pub lexical_weight: f32,
    pub vector_weight: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            summary_top_k: 10,
            summary_score_threshold: 0.4,
            chunk_score_threshold: 0.3,
            relaxed_threshold_factor: 1.5,
            complexity_threshold: 0.3,
            group_boost: 0.15,
            enable_summary_fallback: true,
            enable_entity_matching: true,
            path_timeout_ms: 5000,
            max_entity_paths: 2,
            max_sub_query_paths: 3,
            max_synonym_paths: 2,
            ensemble_doc_threshold: 50,
            rrf_k: 60.0,
            lexical_weight: 0.5,
            vector_weight: 0.5,
        }
    }
}

/// Retriever service cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 10 }
    }
}

/// Rebuild policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildConfig {
    /// Absolute fragment-count change that forces a rebuild
    pub min_change: usize,
    /// Relative fragment-count change that forces a rebuild
    pub change_ratio: f32,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            min_change: 10,
            change_ratio: 0.1,
        }
    }
}

/// Raw-source scan used when every retrieval path is empty
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub extensions: Vec<String>,
    pub name_fields: Vec<String>,
    pub content_fields: Vec<String>,
    pub name_weight: f32,
    pub content_weight: f32,
    pub other_weight: f32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        let words = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            enabled: true,
            extensions: words(&["csv", "tsv", "txt", "md"]),
            name_fields: words(&["提供方姓名", "姓名", "投诉人"]),
            content_fields: words(&["具体问题", "诉求内容", "内容"]),
            name_weight: 3.0,
            content_weight: 2.0,
            other_weight: 1.0,
        }
    }
}

/// Optional lexicon override file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LexiconConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Profile-specific configuration overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analyzer_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retriever_kind: Option<RetrieverKindChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StratumError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| StratumError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();

        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| StratumError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Load configuration with a specific profile applied
    pub fn load_with_profile(path: &Path, profile: &str) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_profile(profile)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Apply a profile's overrides to the configuration
    pub fn apply_profile(&mut self, profile: &str) -> Result<()> {
        let overrides = self
            .profiles
            .get(profile)
            .cloned()
            .ok_or_else(|| StratumError::Config(format!("Unknown profile: {}", profile)))?;

        if let Some(model_id) = &overrides.embedding_model {
            let model = self.embedding.models.get(model_id).cloned().ok_or_else(|| {
                StratumError::InvalidConfigValue {
                    path: format!("profiles.{}.embedding_model", profile),
                    message: format!("No model named '{}' in [embedding.models]", model_id),
                }
            })?;
            self.embedding.default = model;
        }
        if let Some(enabled) = overrides.analyzer_enabled {
            self.analyzer.enabled = enabled;
        }
        if let Some(kind) = overrides.retriever_kind {
            self.search.retriever_kind = kind;
        }
        if let Some(top_k) = overrides.top_k {
            self.search.top_k = top_k;
        }
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: STRATUM_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(config_key) = key.strip_prefix("STRATUM_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "STORAGE__KB_DIR" => self.storage.kb_dir = PathBuf::from(value),
            "STORAGE__REGISTRY_DIR" => self.storage.registry_dir = PathBuf::from(value),
            "EMBEDDING__MODEL" => self.embedding.default.model = value.to_string(),
            "EMBEDDING__API_BASE" => self.embedding.default.api_base = Some(value.to_string()),
            "ANALYZER__ENABLED" => self.analyzer.enabled = parse_env(path, value)?,
            "ANALYZER__MODEL" => self.analyzer.model = value.to_string(),
            "CACHE__CAPACITY" => self.cache.capacity = parse_env(path, value)?,
            "SEARCH__TOP_K" => self.search.top_k = parse_env(path, value)?,
            "SEARCH__SCORE_THRESHOLD" => self.search.score_threshold = parse_env(path, value)?,
            "SEARCH__RETRIEVER_KIND" => {
                self.search.retriever_kind =
                    value
                        .parse()
                        .map_err(|message: String| StratumError::InvalidConfigValue {
                            path: path.to_string(),
                            message,
                        })?
            }
            "RETRIEVAL__PATH_TIMEOUT_MS" => {
                self.retrieval.path_timeout_ms = parse_env(path, value)?
            }
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| StratumError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("stratum").join("config.toml"))
    }
}

fn parse_env<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| StratumError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Cannot parse '{}'", value),
    })
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta: MetaConfig {
                schema_version: "1.0.0".to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            analyzer: AnalyzerConfig::default(),
            indexing: IndexingConfig::default(),
            hierarchy: HierarchyConfig::default(),
            retrieval: RetrievalConfig::default(),
            search: SearchConfig::default(),
            cache: CacheConfig::default(),
            rebuild: RebuildConfig::default(),
            fallback: FallbackConfig::default(),
            lexicon: LexiconConfig::default(),
            profiles: HashMap::new(),
        }
    }
}
