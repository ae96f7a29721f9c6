//! Entity extraction and query analysis
//!
//! This module provides:
//! - `Lexicon`: word lists and compiled patterns, built-in or loaded from TOML
//! - Dictionary segmentation with POS-style tags
//! - `KeywordExtractor` for persons, organisations, locations, times and topics
//! - Rule-based and AI-backed query analyzers

mod analyzer;
mod extractor;
mod lexicon;
mod tokenizer;

pub use analyzer::{
    analyze_with_fallback, classify_intent, complexity_score, parse_ai_analysis, AiQueryAnalyzer,
    AnalysisSource, AnalyzerError, QueryAnalysis, QueryAnalyzer, QueryIntent, RuleAnalyzer,
};
pub use extractor::{Entities, Keyword, KeywordExtractor};
pub use lexicon::{Lexicon, LexiconFile, Pos, PriorRule, PriorRuleConfig};
pub use tokenizer::{han_bigrams, is_han, segment, Token};
