//! Query decomposition: strategy, sub-queries and semantic expansions

use crate::entities::{
    analyze_with_fallback, Entities, Lexicon, QueryAnalysis, QueryAnalyzer, QueryIntent,
    RuleAnalyzer,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub const MAX_SUB_QUERIES: usize = 8;
pub const MAX_EXPANSIONS: usize = 5;
/// Sub-queries of this many chars or fewer are dropped
const MIN_SUB_QUERY_CHARS: usize = 2;
const ENTITY_STRATEGY_THRESHOLD: usize = 3;
const SEMANTIC_STRATEGY_CHARS: usize = 15;

pub const STRATEGY_SIMPLE: &str = "simple";

/// Decomposition strategy implied by an intent, before prior rules apply
pub fn strategy_for_intent(intent: QueryIntent) -> &'static str {
    match intent {
        QueryIntent::ComplaintContent => "person_complaint_content",
        QueryIntent::ComplaintHandling => "process_oriented",
        QueryIntent::PersonRelated => "person_complaint_general",
        QueryIntent::EventRelated => "cause_analysis",
        QueryIntent::ComplaintGeneral | QueryIntent::General => STRATEGY_SIMPLE,
    }
}

/// Alternative phrasing, with the query term it stands in for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expansion {
    pub text: String,
    pub replaces: Option<String>,
}

impl Expansion {
    /// Query text for a synonym path
    pub fn apply(&self, query: &str) -> String {
        match &self.replaces {
            Some(term) if query.contains(term.as_str()) => query.replacen(term.as_str(), &self.text, 1),
            _ => self.text.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposedQuery {
    pub query: String,
    pub analysis: QueryAnalysis,
    pub strategy: String,
    pub sub_queries: Vec<String>,
    pub expansions: Vec<Expansion>,
    pub retrieval_strategies: Vec<String>,
}

pub struct QueryDecomposer {
    rules: RuleAnalyzer,
    ai: Option<Arc<dyn QueryAnalyzer>>,
}

impl QueryDecomposer {
    pub fn new(rules: RuleAnalyzer) -> Self {
        Self { rules, ai: None }
    }

    /// Consult `ai` before the rules; its failures fall back to the rules
    pub fn with_ai(mut self, ai: Arc<dyn QueryAnalyzer>) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn rules(&self) -> &RuleAnalyzer {
        &self.rules
    }

    fn lexicon(&self) -> &Lexicon {
        self.rules.extractor().lexicon()
    }

    pub fn analyze(&self, query: &str) -> QueryAnalysis {
        analyze_with_fallback(&self.rules, self.ai.as_deref(), query)
    }

    pub fn decompose(&self, query: &str) -> DecomposedQuery {
        self.decompose_analyzed(query, self.analyze(query))
    }

    /// Decompose a query whose analysis is already known
    pub fn decompose_analyzed(&self, query: &str, analysis: QueryAnalysis) -> DecomposedQuery {
        let strategy = self.strategy(query, analysis.query_intent);
        let sub_queries = self.sub_queries(query, &strategy, &analysis.entities);
        let expansions = self.expansions(&analysis);
        let retrieval_strategies = retrieval_strategies(query, &analysis.entities);

        debug!(
            "Decomposed '{}': intent={}, strategy={}, {} sub-queries, {} expansions",
            query,
            analysis.query_intent,
            strategy,
            sub_queries.len(),
            expansions.len()
        );

        DecomposedQuery {
            query: query.to_string(),
            analysis,
            strategy,
            sub_queries,
            expansions,
            retrieval_strategies,
        }
    }

    /// Intent strategy, overridden by the first matching prior rule
    fn strategy(&self, query: &str, intent: QueryIntent) -> String {
        match self.lexicon().match_prior_rule(query) {
            Some(rule) if rule.strategy != STRATEGY_SIMPLE => rule.strategy.clone(),
            _ => strategy_for_intent(intent).to_string(),
        }
    }

    fn sub_queries(&self, query: &str, strategy: &str, entities: &Entities) -> Vec<String> {
        if strategy == STRATEGY_SIMPLE {
            return vec![query.to_string()];
        }

        let mut candidates = self.strategy_sub_queries(query, strategy);
        candidates.extend(entity_sub_queries(entities));
        candidates.extend(self.recombined_sub_queries(query));

        let mut seen = HashSet::new();
        candidates
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| q.chars().count() > MIN_SUB_QUERY_CHARS)
            .filter(|q| seen.insert(q.clone()))
            .take(MAX_SUB_QUERIES)
            .collect()
    }

    /// Templates of the first prior rule declaring `strategy`
    fn strategy_sub_queries(&self, query: &str, strategy: &str) -> Vec<String> {
        let Some(rule) = self
            .lexicon()
            .prior_rules
            .iter()
            .find(|r| r.strategy == strategy)
        else {
            return Vec::new();
        };

        match topic_of(query) {
            Some(topic) => rule
                .sub_queries
                .iter()
                .map(|t| t.replace("{topic}", topic))
                .collect(),
            None => rule
                .keywords
                .iter()
                .filter(|k| query.contains(k.as_str()))
                .cloned()
                .collect(),
        }
    }

    /// Action × object pairs present in the query, in both orders
    fn recombined_sub_queries(&self, query: &str) -> Vec<String> {
        let words = &self.lexicon().words;
        let mut out = Vec::new();
        for action in words.action_words.iter().filter(|a| query.contains(a.as_str())) {
            for object in words.object_words.iter().filter(|o| query.contains(o.as_str())) {
                out.push(format!("{}{}", object, action));
                out.push(format!("{}{}", action, object));
            }
        }
        out
    }

    fn expansions(&self, analysis: &QueryAnalysis) -> Vec<Expansion> {
        let lexicon = self.lexicon();
        let mut out: Vec<Expansion> = Vec::new();
        let mut push = |text: &str, replaces: Option<&str>| {
            let text = text.trim();
            if !text.is_empty() && !out.iter().any(|e| e.text == text) {
                out.push(Expansion {
                    text: text.to_string(),
                    replaces: replaces.map(str::to_string),
                });
            }
        };

        for text in &analysis.semantic_expansions {
            push(text, None);
        }
        if let Some(intent_terms) = lexicon.words.intent_expansions.get(analysis.query_intent.as_str()) {
            for text in intent_terms {
                push(text, None);
            }
        }
        for person in &analysis.entities.persons {
            push(&format!("{}相关", person), None);
            push(&format!("关于{}", person), None);
        }
        for keyword in &analysis.keywords {
            for synonym in lexicon.synonyms_of(&keyword.term) {
                push(synonym, Some(&keyword.term));
            }
        }

        out.truncate(MAX_EXPANSIONS);
        out
    }
}

/// Text between `关于` and the next `的`
fn topic_of(query: &str) -> Option<&str> {
    let start = query.find("关于")? + "关于".len();
    let rest = &query[start..];
    rest.char_indices()
        .skip(1)
        .find(|(_, c)| *c == '的')
        .map(|(end, _)| &rest[..end])
}

fn entity_sub_queries(entities: &Entities) -> Vec<String> {
    let mut out = Vec::new();
    for p in &entities.persons {
        out.push(format!("{}相关信息", p));
        out.push(format!("{}投诉", p));
    }
    for o in &entities.organizations {
        out.push(format!("{}处理情况", o));
        out.push(format!("{}检查", o));
    }
    for l in &entities.locations {
        out.push(format!("{}事件", l));
        out.push(format!("{}安全", l));
    }
    for t in &entities.times {
        out.push(format!("{}发生", t));
        out.push(format!("{}处理", t));
    }
    for t in &entities.topics {
        out.push(format!("{}事件", t));
        out.push(format!("{}处理", t));
        out.push(format!("{}规定", t));
    }
    out
}

/// Retrieval strategies reported for observability
pub fn retrieval_strategies(query: &str, entities: &Entities) -> Vec<String> {
    let mut strategies = Vec::new();
    if entities.count() > ENTITY_STRATEGY_THRESHOLD {
        strategies.push("entity_based");
    }
    if query.chars().count() > SEMANTIC_STRATEGY_CHARS {
        strategies.push("semantic_based");
    }
    if !entities.topics.is_empty() {
        strategies.push("topic_based");
    }
    if !entities.times.is_empty() {
        strategies.push("time_based");
    }
    if strategies.is_empty() {
        strategies.push("semantic_based");
    }
    strategies.into_iter().map(str::to_string).collect()
}
