//! Query decomposition into sub-queries and expansions

mod decomposer;

pub use decomposer::{
    retrieval_strategies, strategy_for_intent, DecomposedQuery, Expansion, QueryDecomposer,
    MAX_EXPANSIONS, MAX_SUB_QUERIES, STRATEGY_SIMPLE,
};
