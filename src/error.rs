use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Stratum
#[derive(Error, Debug)]
pub enum StratumError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// Index files are missing, unreadable or inconsistent
    #[error("Index at {path} is corrupt: {reason}")]
    IndexCorrupt { path: PathBuf, reason: String },

    /// A build was attempted on zero fragments
    #[error("Knowledge base '{kb}' has no fragments to index")]
    EmptyCorpus { kb: String },

    /// Embedding or analysis provider failed
    #[error("Provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    /// Every retrieval path came back empty
    #[error("No results for query: {query}")]
    NoResults { query: String },

    /// Knowledge base id is not present in the registry
    #[error("Knowledge base not found: {id}")]
    KnowledgeBaseNotFound { id: String },

    /// Query rejected before retrieval
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StratumError {
    pub fn index_corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::IndexCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn provider_unavailable(provider: impl Into<String>, reason: impl ToString) -> Self {
        Self::ProviderUnavailable {
            provider: provider.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors that the search path recovers from locally
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::IndexCorrupt { .. } | Self::ProviderUnavailable { .. } | Self::NoResults { .. }
        )
    }
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for Stratum operations
pub type Result<T> = std::result::Result<T, StratumError>;
