//! Query analysis: entities, intent, keywords and complexity
//!
//! `RuleAnalyzer` is deterministic and always available. `AiQueryAnalyzer`
//! asks an OpenAI-compatible chat endpoint for the same structure and is
//! only trusted when its answer passes the schema checks in
//! [`parse_ai_analysis`].

use super::extractor::{Entities, Keyword, KeywordExtractor};
use super::lexicon::{Lexicon, Pos};
use crate::config::AnalyzerConfig;
use crate::error::StratumError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Keywords kept per query
const QUERY_KEYWORDS: usize = 20;
const RULE_CONFIDENCE: f32 = 0.6;
const DEFAULT_AI_COMPLEXITY: f32 = 0.3;
const DEFAULT_AI_CONFIDENCE: f32 = 0.8;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("Analyzer not configured: {0}")]
    Unavailable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Parse(String),

    #[error("Response violates schema: {0}")]
    Schema(String),
}

impl From<AnalyzerError> for StratumError {
    fn from(err: AnalyzerError) -> Self {
        StratumError::provider_unavailable("analyzer", err.to_string())
    }
}

/// What the query asks about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    ComplaintContent,
    ComplaintHandling,
    ComplaintGeneral,
    PersonRelated,
    EventRelated,
    General,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryIntent::ComplaintContent => "complaint_content",
            QueryIntent::ComplaintHandling => "complaint_handling",
            QueryIntent::ComplaintGeneral => "complaint_general",
            QueryIntent::PersonRelated => "person_related",
            QueryIntent::EventRelated => "event_related",
            QueryIntent::General => "general",
        }
    }

    pub fn is_complaint(&self) -> bool {
        matches!(
            self,
            QueryIntent::ComplaintContent
                | QueryIntent::ComplaintHandling
                | QueryIntent::ComplaintGeneral
        )
    }
}

impl fmt::Display for QueryIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryIntent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "complaint_content" => Ok(QueryIntent::ComplaintContent),
            "complaint_handling" => Ok(QueryIntent::ComplaintHandling),
            "complaint_general" => Ok(QueryIntent::ComplaintGeneral),
            "person_related" => Ok(QueryIntent::PersonRelated),
            "event_related" => Ok(QueryIntent::EventRelated),
            "general" => Ok(QueryIntent::General),
            other => Err(format!("unknown query intent '{}'", other)),
        }
    }
}

/// Which analyzer produced a `QueryAnalysis`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisSource {
    Rules,
    Ai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub entities: Entities,
    pub keywords: Vec<Keyword>,
    pub query_intent: QueryIntent,
    pub semantic_expansions: Vec<String>,
    pub complexity_score: f32,
    pub confidence: f32,
    pub source: AnalysisSource,
}

impl QueryAnalysis {
    /// Fold an AI analysis into this rule analysis
    ///
    /// The AI answer decides intent and scores; entities and keywords are
    /// the union of both, AI entries first.
    pub fn with_ai(self, ai: QueryAnalysis) -> QueryAnalysis {
        let mut entities = ai.entities;
        entities.merge(&self.entities);

        let mut keywords = ai.keywords;
        for keyword in self.keywords {
            if !keywords.iter().any(|k| k.term == keyword.term) {
                keywords.push(keyword);
            }
        }

        QueryAnalysis {
            entities,
            keywords,
            query_intent: ai.query_intent,
            semantic_expansions: ai.semantic_expansions,
            complexity_score: ai.complexity_score,
            confidence: ai.confidence,
            source: AnalysisSource::Ai,
        }
    }

    /// Keywords whose weight marks them as significant
    pub fn strong_keywords(&self) -> impl Iterator<Item = &Keyword> {
        self.keywords.iter().filter(|k| k.weight > 1.0)
    }
}

pub trait QueryAnalyzer: Send + Sync {
    fn analyze(&self, query: &str) -> Result<QueryAnalysis, AnalyzerError>;

    fn name(&self) -> &'static str;
}

/// `0.2 × named entities + 0.1 × keywords`, clamped to [0, 1]
pub fn complexity_score(entities: &Entities, keyword_count: usize) -> f32 {
    (0.2 * entities.named_count() as f32 + 0.1 * keyword_count as f32).clamp(0.0, 1.0)
}

/// Classify intent from the lexicon's trigger words
pub fn classify_intent(lexicon: &Lexicon, query: &str, entities: &Entities) -> QueryIntent {
    let has = |words: &[String]| words.iter().any(|w| query.contains(w.as_str()));
    let words = &lexicon.words;

    if has(&words.complaint_words) {
        if has(&words.content_words) {
            QueryIntent::ComplaintContent
        } else if has(&words.handling_words) {
            QueryIntent::ComplaintHandling
        } else {
            QueryIntent::ComplaintGeneral
        }
    } else if !entities.persons.is_empty() {
        QueryIntent::PersonRelated
    } else if has(&words.event_words) {
        QueryIntent::EventRelated
    } else {
        QueryIntent::General
    }
}

/// Deterministic analyzer over the lexicon
#[derive(Clone)]
pub struct RuleAnalyzer {
    extractor: KeywordExtractor,
}

impl RuleAnalyzer {
    pub fn new(extractor: KeywordExtractor) -> Self {
        Self { extractor }
    }

    pub fn extractor(&self) -> &KeywordExtractor {
        &self.extractor
    }

    /// Infallible form of [`QueryAnalyzer::analyze`]
    pub fn analyze_query(&self, query: &str) -> QueryAnalysis {
        let entities = self.extractor.extract_entities(query);
        let keywords = self.extractor.extract_keywords(query, QUERY_KEYWORDS, 2);
        let query_intent = classify_intent(self.extractor.lexicon(), query, &entities);
        let complexity_score = complexity_score(&entities, keywords.len());

        QueryAnalysis {
            entities,
            keywords,
            query_intent,
            semantic_expansions: Vec::new(),
            complexity_score,
            confidence: RULE_CONFIDENCE,
            source: AnalysisSource::Rules,
        }
    }
}

impl QueryAnalyzer for RuleAnalyzer {
    fn analyze(&self, query: &str) -> Result<QueryAnalysis, AnalyzerError> {
        Ok(self.analyze_query(query))
    }

    fn name(&self) -> &'static str {
        "rules"
    }
}

const SYSTEM_PROMPT: &str = r#"You analyse search queries over Chinese complaint and incident records.
Return exactly one JSON object and nothing else:
{
  "entities": {"persons": [], "organizations": [], "locations": [], "times": [], "topics": []},
  "query_intent": "complaint_content | complaint_handling | complaint_general | person_related | event_related | general",
  "keywords": [],
  "semantic_expansions": [],
  "complexity_score": 0.0,
  "confidence": 0.0
}
Person names keep their honorific (钟女士, 李先生). Give the 3-5 most important keywords.
Scores are between 0 and 1."#;

/// Analyzer backed by an OpenAI-compatible chat completion endpoint
pub struct AiQueryAnalyzer {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    lexicon: std::sync::Arc<Lexicon>,
}

impl AiQueryAnalyzer {
    pub fn new(
        config: &AnalyzerConfig,
        lexicon: std::sync::Arc<Lexicon>,
    ) -> Result<Self, AnalyzerError> {
        if config.api_base.trim().is_empty() {
            return Err(AnalyzerError::Unavailable("api_base is empty".into()));
        }

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| AnalyzerError::Unavailable(e.to_string()))?;

        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.is_empty());

        Ok(Self {
            client,
            endpoint: format!(
                "{}/chat/completions",
                config.api_base.trim_end_matches('/')
            ),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
            lexicon,
        })
    }

    async fn complete(&self, query: &str) -> Result<String, AnalyzerError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": format!("Query: {}", query)},
            ],
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AnalyzerError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalyzerError::Http {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AnalyzerError::Parse(e.to_string()))?;

        json.pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| AnalyzerError::Parse("missing choices[0].message.content".into()))
    }
}

impl QueryAnalyzer for AiQueryAnalyzer {
    fn analyze(&self, query: &str) -> Result<QueryAnalysis, AnalyzerError> {
        let content = crate::embedding::block_on(self.complete(query))
            .map_err(|e| AnalyzerError::Transport(format!("runtime error: {e}")))??;
        debug!("AI analysis response: {}", content);
        parse_ai_analysis(&content, &self.lexicon)
    }

    fn name(&self) -> &'static str {
        "ai"
    }
}

#[derive(Debug, Deserialize)]
struct AiAnalysisPayload {
    #[serde(default)]
    entities: Entities,
    query_intent: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    semantic_expansions: Vec<String>,
    complexity_score: Option<f32>,
    confidence: Option<f32>,
}

fn checked_score(name: &str, value: Option<f32>, default: f32) -> Result<f32, AnalyzerError> {
    match value {
        None => Ok(default),
        Some(v) if !v.is_finite() || v < 0.0 => {
            Err(AnalyzerError::Schema(format!("{} out of range: {}", name, v)))
        }
        Some(v) => Ok(v.min(1.0)),
    }
}

/// Validate a model answer against the analysis schema
///
/// Accepts a bare object, a fenced code block, or an object embedded in
/// surrounding prose.
pub fn parse_ai_analysis(content: &str, lexicon: &Lexicon) -> Result<QueryAnalysis, AnalyzerError> {
    let trimmed = content.trim();
    let json = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => return Err(AnalyzerError::Parse("no JSON object in response".into())),
    };

    let payload: AiAnalysisPayload =
        serde_json::from_str(json).map_err(|e| AnalyzerError::Parse(e.to_string()))?;

    let query_intent = payload
        .query_intent
        .parse::<QueryIntent>()
        .map_err(AnalyzerError::Schema)?;
    let complexity_score = checked_score(
        "complexity_score",
        payload.complexity_score,
        DEFAULT_AI_COMPLEXITY,
    )?;
    let confidence = checked_score("confidence", payload.confidence, DEFAULT_AI_CONFIDENCE)?;

    let mut entities = Entities::default();
    entities.merge(&payload.entities);

    let mut keywords: Vec<Keyword> = Vec::new();
    for term in payload.keywords {
        let term = term.trim().to_string();
        if term.is_empty() || keywords.iter().any(|k| k.term == term) {
            continue;
        }
        let pos = lexicon.dictionary.get(&term).copied().unwrap_or(Pos::N);
        keywords.push(Keyword {
            weight: pos.prior(),
            term,
            pos,
        });
    }

    Ok(QueryAnalysis {
        entities,
        keywords,
        query_intent,
        semantic_expansions: payload
            .semantic_expansions
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        complexity_score,
        confidence,
        source: AnalysisSource::Ai,
    })
}

/// Rule analysis, upgraded by the AI analyzer when one is configured and
/// answers within the schema
pub fn analyze_with_fallback(
    rules: &RuleAnalyzer,
    ai: Option<&dyn QueryAnalyzer>,
    query: &str,
) -> QueryAnalysis {
    let rule_analysis = rules.analyze_query(query);
    let Some(ai) = ai else {
        return rule_analysis;
    };

    match ai.analyze(query) {
        Ok(ai_analysis) => rule_analysis.with_ai(ai_analysis),
        Err(e) => {
            warn!("{} analyzer failed, using rules: {}", ai.name(), e);
            rule_analysis
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn lexicon() -> Arc<Lexicon> {
        Arc::new(Lexicon::builtin().unwrap())
    }

    fn rules() -> RuleAnalyzer {
        RuleAnalyzer::new(KeywordExtractor::new(lexicon()))
    }

    #[test]
    fn test_rule_analysis_of_complaint_query() {
        let analysis = rules().analyze_query("张女士的投诉内容");
        assert_eq!(analysis.entities.persons, vec!["张女士"]);
        assert_eq!(analysis.entities.topics, vec!["投诉"]);
        assert_eq!(analysis.query_intent, QueryIntent::ComplaintContent);
        assert_eq!(analysis.keywords.len(), 3);
        assert!((analysis.complexity_score - 0.5).abs() < 1e-6);
        assert_eq!(analysis.confidence, 0.6);
        assert_eq!(analysis.source, AnalysisSource::Rules);
    }

    #[test]
    fn test_intent_rules() {
        let r = rules();
        assert_eq!(
            r.analyze_query("投诉的处理结果").query_intent,
            QueryIntent::ComplaintHandling
        );
        assert_eq!(
            r.analyze_query("有人举报噪音").query_intent,
            QueryIntent::ComplaintGeneral
        );
        assert_eq!(
            r.analyze_query("李先生的电话").query_intent,
            QueryIntent::PersonRelated
        );
        assert_eq!(
            r.analyze_query("火灾事件经过").query_intent,
            QueryIntent::EventRelated
        );
        assert_eq!(
            r.analyze_query("Q1 sales report").query_intent,
            QueryIntent::General
        );
    }

    #[test]
    fn test_complexity_is_clamped() {
        let entities = Entities {
            persons: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            organizations: vec!["e".into(), "f".into()],
            ..Entities::default()
        };
        assert_eq!(complexity_score(&entities, 5), 1.0);
        assert_eq!(complexity_score(&Entities::default(), 0), 0.0);
    }

    #[test]
    fn test_parse_ai_analysis_defaults_and_fences() {
        let lexicon = lexicon();
        let content = "```json\n{\"entities\": {\"persons\": [\"钟女士\"]}, \"query_intent\": \"complaint_content\", \"keywords\": [\"投诉\", \"投诉\", \"物业\"]}\n```";
        let analysis = parse_ai_analysis(content, &lexicon).unwrap();
        assert_eq!(analysis.entities.persons, vec!["钟女士"]);
        assert_eq!(analysis.keywords.len(), 2);
        assert_eq!(analysis.complexity_score, 0.3);
        assert_eq!(analysis.confidence, 0.8);
    }

    #[test]
    fn test_parse_ai_analysis_rejects_bad_schema() {
        let lexicon = lexicon();
        assert!(matches!(
            parse_ai_analysis(r#"{"query_intent": "shopping"}"#, &lexicon),
            Err(AnalyzerError::Schema(_))
        ));
        assert!(matches!(
            parse_ai_analysis(
                r#"{"query_intent": "general", "confidence": -0.5}"#,
                &lexicon
            ),
            Err(AnalyzerError::Schema(_))
        ));
        assert!(matches!(
            parse_ai_analysis("I cannot help with that", &lexicon),
            Err(AnalyzerError::Parse(_))
        ));

        let clamped = parse_ai_analysis(
            r#"{"query_intent": "general", "complexity_score": 1.7}"#,
            &lexicon,
        )
        .unwrap();
        assert_eq!(clamped.complexity_score, 1.0);
    }

    struct FailingAnalyzer;

    impl QueryAnalyzer for FailingAnalyzer {
        fn analyze(&self, _query: &str) -> Result<QueryAnalysis, AnalyzerError> {
            Err(AnalyzerError::Transport("connection refused".into()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    struct FixedAnalyzer(QueryAnalysis);

    impl QueryAnalyzer for FixedAnalyzer {
        fn analyze(&self, _query: &str) -> Result<QueryAnalysis, AnalyzerError> {
            Ok(self.0.clone())
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    #[test]
    fn test_failed_ai_falls_back_to_rules() {
        let analysis = analyze_with_fallback(&rules(), Some(&FailingAnalyzer), "张女士的投诉内容");
        assert_eq!(analysis.source, AnalysisSource::Rules);
        assert_eq!(analysis.confidence, 0.6);
    }

    #[test]
    fn test_ai_analysis_merges_entities() {
        let lexicon = lexicon();
        let ai = parse_ai_analysis(
            r#"{"entities": {"organizations": ["恒通物业"]}, "query_intent": "complaint_handling", "confidence": 0.9}"#,
            &lexicon,
        )
        .unwrap();
        let analysis = analyze_with_fallback(&rules(), Some(&FixedAnalyzer(ai)), "张女士的投诉内容");
        assert_eq!(analysis.source, AnalysisSource::Ai);
        assert_eq!(analysis.query_intent, QueryIntent::ComplaintHandling);
        assert_eq!(analysis.entities.organizations, vec!["恒通物业"]);
        assert_eq!(analysis.entities.persons, vec!["张女士"]);
        assert_eq!(analysis.confidence, 0.9);
    }

    #[test]
    fn test_unreachable_endpoint_is_an_error() {
        let config = AnalyzerConfig {
            enabled: true,
            api_base: "http://127.0.0.1:9".into(),
            timeout_ms: 200,
            ..AnalyzerConfig::default()
        };
        let analyzer = AiQueryAnalyzer::new(&config, lexicon()).unwrap();
        assert!(analyzer.analyze("张女士的投诉内容").is_err());
    }
}
