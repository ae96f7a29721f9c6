//! Embedding & Indexing
//!
//! Architecture:
//! - EmbeddingProvider trait for abstraction over local and remote models
//! - FastEmbedProvider, HttpEmbeddingProvider and HashEmbeddingProvider
//! - VectorIndex (exact or HNSW) for similarity search with on-disk snapshots
//! - KeywordIndex (ephemeral tantivy) for BM25 keyword search

mod keyword_index;
mod provider;
mod remote;
mod vector_index;

pub use keyword_index::{KeywordIndex, KeywordIndexError, KeywordSearchResult};
pub use provider::{
    EmbeddingError, EmbeddingProvider, FastEmbedProvider, HashEmbeddingProvider, ProviderIdentity,
};
pub(crate) use remote::block_on;
pub use remote::HttpEmbeddingProvider;
pub(crate) use vector_index::{backup_path, write_with_backup};
pub use vector_index::{VectorIndex, VectorIndexError, DOCSTORE_FILE, INDEX_FILE};

use crate::config::{EmbeddingConfig, ModelConfig, ProviderKind};
use std::sync::Arc;

/// Instantiate the provider described by `model`
pub fn create_provider(
    model: &ModelConfig,
    batch_size: usize,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    let provider: Arc<dyn EmbeddingProvider> = match model.provider {
        ProviderKind::FastEmbed => Arc::new(FastEmbedProvider::new(&model.model, batch_size)?),
        ProviderKind::Http => Arc::new(HttpEmbeddingProvider::new(model, batch_size)?),
        ProviderKind::Hashing => Arc::new(HashEmbeddingProvider::new(model.dimension)),
    };
    Ok(provider)
}

/// Resolve the provider for a knowledge base's `embedding_model_id`
///
/// An unknown id or a provider that fails to start falls back to the default
/// model, but only when its dimension matches the requested one; vectors of a
/// different width could not be compared with the stored index.
pub fn resolve_provider(
    config: &EmbeddingConfig,
    model_id: Option<&str>,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    let requested = model_id.and_then(|id| {
        let model = config.models.get(id);
        if model.is_none() {
            tracing::warn!("Unknown embedding model '{}', using default", id);
        }
        model
    });

    let Some(model) = requested else {
        return create_provider(&config.default, config.batch_size);
    };

    match create_provider(model, config.batch_size) {
        Ok(provider) => Ok(provider),
        Err(e) if config.default.dimension == model.dimension && config.default != *model => {
            tracing::warn!(
                "Embedding provider '{}' unavailable ({}), falling back to default '{}'",
                model.model,
                e,
                config.default.model
            );
            create_provider(&config.default, config.batch_size)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashing(dimension: usize) -> ModelConfig {
        ModelConfig {
            provider: ProviderKind::Hashing,
            model: format!("hash-{}", dimension),
            dimension,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_resolve_named_model() {
        let mut config = EmbeddingConfig {
            default: hashing(64),
            ..EmbeddingConfig::default()
        };
        config.models.insert("wide".into(), hashing(128));

        let provider = resolve_provider(&config, Some("wide")).unwrap();
        assert_eq!(provider.dimension(), 128);

        let provider = resolve_provider(&config, Some("missing")).unwrap();
        assert_eq!(provider.dimension(), 64);
    }

    #[test]
    fn test_failed_provider_falls_back_on_matching_dimension() {
        let mut config = EmbeddingConfig {
            default: hashing(64),
            ..EmbeddingConfig::default()
        };
        config.models.insert(
            "remote".into(),
            ModelConfig {
                provider: ProviderKind::Http,
                model: "text-embedding-3-small".into(),
                dimension: 64,
                api_base: None,
                ..ModelConfig::default()
            },
        );

        let provider = resolve_provider(&config, Some("remote")).unwrap();
        assert_eq!(provider.identity().provider, "hashing");
    }

    #[test]
    fn test_no_fallback_across_dimensions() {
        let mut config = EmbeddingConfig {
            default: hashing(64),
            ..EmbeddingConfig::default()
        };
        config.models.insert(
            "remote".into(),
            ModelConfig {
                provider: ProviderKind::Http,
                dimension: 1536,
                api_base: None,
                ..ModelConfig::default()
            },
        );

        assert!(resolve_provider(&config, Some("remote")).is_err());
    }
}
