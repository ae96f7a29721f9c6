use crate::config::{Config, ModelConfig, ProviderKind};
use crate::error::{Result, StratumError, ValidationError};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_storage(config, &mut errors);
        Self::validate_embedding(config, &mut errors);
        Self::validate_analyzer(config, &mut errors);
        Self::validate_indexing(config, &mut errors);
        Self::validate_hierarchy(config, &mut errors);
        Self::validate_retrieval(config, &mut errors);
        Self::validate_search(config, &mut errors);
        Self::validate_cache(config, &mut errors);
        Self::validate_rebuild(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(StratumError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != "1.0.0" {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_storage(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.storage.kb_dir.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.kb_dir",
                "Knowledge base directory cannot be empty",
            ));
        }

        if config.storage.registry_dir.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.registry_dir",
                "Registry directory cannot be empty",
            ));
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.embedding.batch_size == 0 {
            errors.push(ValidationError::new(
                "embedding.batch_size",
                "Batch size must be greater than 0",
            ));
        }

        Self::validate_model("embedding.default", &config.embedding.default, errors);
        for (name, model) in &config.embedding.models {
            Self::validate_model(&format!("embedding.models.{}", name), model, errors);
        }
    }

    fn validate_model(path: &str, model: &ModelConfig, errors: &mut Vec<ValidationError>) {
        if model.model.is_empty() {
            errors.push(ValidationError::new(
                format!("{}.model", path),
                "Model name cannot be empty",
            ));
        }

        if model.dimension == 0 {
            errors.push(ValidationError::new(
                format!("{}.dimension", path),
                "Vector dimension must be greater than 0",
            ));
        }

        if model.provider == ProviderKind::Http
            && model.api_base.as_deref().map_or(true, str::is_empty)
        {
            errors.push(ValidationError::new(
                format!("{}.api_base", path),
                "HTTP provider requires api_base",
            ));
        }

        if model.timeout_ms == 0 {
            errors.push(ValidationError::new(
                format!("{}.timeout_ms", path),
                "Timeout must be greater than 0",
            ));
        }
    }

    fn validate_analyzer(config: &Config, errors: &mut Vec<ValidationError>) {
        let analyzer = &config.analyzer;

        if analyzer.enabled && analyzer.api_base.is_empty() {
            errors.push(ValidationError::new(
                "analyzer.api_base",
                "API base cannot be empty when the analyzer is enabled",
            ));
        }

        // A missing key is not fatal: the rule analyzer takes over at runtime
        if analyzer.enabled && std::env::var(&analyzer.api_key_env).is_err() {
            tracing::warn!(
                "Analyzer enabled but {} is not set; rule analysis will be used",
                analyzer.api_key_env
            );
        }

        if !(0.0..=2.0).contains(&analyzer.temperature) {
            errors.push(ValidationError::new(
                "analyzer.temperature",
                format!(
                    "Temperature must be between 0.0 and 2.0, got {}",
                    analyzer.temperature
                ),
            ));
        }
    }

    fn validate_indexing(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.indexing.hnsw_ef_construction == 0 {
            errors.push(ValidationError::new(
                "indexing.hnsw_ef_construction",
                "HNSW ef_construction must be greater than 0",
            ));
        }

        if config.indexing.hnsw_m == 0 {
            errors.push(ValidationError::new(
                "indexing.hnsw_m",
                "HNSW M must be greater than 0",
            ));
        }

        if config.indexing.hnsw_ef_search == 0 {
            errors.push(ValidationError::new(
                "indexing.hnsw_ef_search",
                "HNSW ef_search must be greater than 0",
            ));
        }
    }

    fn validate_hierarchy(config: &Config, errors: &mut Vec<ValidationError>) {
        let hierarchy = &config.hierarchy;
        for (key, value) in [
            ("filename_similarity", hierarchy.filename_similarity),
            ("content_similarity", hierarchy.content_similarity),
            ("topic_similarity", hierarchy.topic_similarity),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                errors.push(ValidationError::new(
                    format!("hierarchy.{}", key),
                    format!("Similarity threshold must be in (0, 1], got {}", value),
                ));
            }
        }

        if hierarchy.summary_budget_chars > hierarchy.verbatim_summary_chars {
            errors.push(ValidationError::new(
                "hierarchy.summary_budget_chars",
                "Summary budget cannot exceed verbatim_summary_chars",
            ));
        }
    }

    fn validate_retrieval(config: &Config, errors: &mut Vec<ValidationError>) {
        let retrieval = &config.retrieval;

        if retrieval.summary_top_k == 0 {
            errors.push(ValidationError::new(
                "retrieval.summary_top_k",
                "summary_top_k must be greater than 0",
            ));
        }

        if retrieval.summary_score_threshold < 0.0 || retrieval.chunk_score_threshold < 0.0 {
            errors.push(ValidationError::new(
                "retrieval",
                "Distance thresholds cannot be negative",
            ));
        }

        if retrieval.relaxed_threshold_factor < 1.0 {
            errors.push(ValidationError::new(
                "retrieval.relaxed_threshold_factor",
                "Relaxed threshold factor must be at least 1.0",
            ));
        }

        if retrieval.path_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "retrieval.path_timeout_ms",
                "Path timeout must be greater than 0",
            ));
        }

        if retrieval.rrf_k <= 0.0 {
            errors.push(ValidationError::new(
                "retrieval.rrf_k",
                "RRF k must be positive",
            ));
        }

        if retrieval.lexical_weight < 0.0
            || retrieval.vector_weight < 0.0
            || retrieval.lexical_weight + retrieval.vector_weight <= 0.0
        {
            errors.push(ValidationError::new(
                "retrieval.lexical_weight",
                "Ensemble weights must be non-negative and not both zero",
            ));
        }
    }

    fn validate_search(config: &Config, errors: &mut Vec<ValidationError>) {
        let search = &config.search;

        if search.top_k == 0 {
            errors.push(ValidationError::new(
                "search.top_k",
                "top_k must be greater than 0",
            ));
        }

        if search.score_threshold < 0.0 {
            errors.push(ValidationError::new(
                "search.score_threshold",
                "Score threshold cannot be negative",
            ));
        }

        let ranking = &search.ranking;
        if ranking.frequency < 0.0 || ranking.position < 0.0 || ranking.coverage < 0.0 {
            errors.push(ValidationError::new(
                "search.ranking",
                "Ranking weights cannot be negative",
            ));
        }
    }

    fn validate_cache(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.cache.capacity == 0 {
            errors.push(ValidationError::new(
                "cache.capacity",
                "Cache capacity must be greater than 0",
            ));
        }
    }

    fn validate_rebuild(config: &Config, errors: &mut Vec<ValidationError>) {
        if !(0.0..=1.0).contains(&config.rebuild.change_ratio) {
            errors.push(ValidationError::new(
                "rebuild.change_ratio",
                "Change ratio must be between 0.0 and 1.0",
            ));
        }
    }
}
