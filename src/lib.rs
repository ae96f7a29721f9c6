//! Stratum - Hierarchical Multi-Path Retrieval
//!
//! Answers natural-language queries over per-knowledge-base document indices.
//! Queries are analyzed for entities and intent, fanned out over several
//! retrieval paths against a two-layer (summary, chunk) index, fused and
//! re-scored. Knowledge bases without a hierarchical index fall back to a
//! keyword/vector ensemble or plain vector search, and finally to a scan of
//! the raw source files.

pub mod cli;
pub mod config;
pub mod document;
pub mod embedding;
pub mod entities;
pub mod error;
pub mod hierarchy;
pub mod query;
pub mod retrieval;
pub mod service;

pub use error::{Result, StratumError};
