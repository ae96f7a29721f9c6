//! Entity and keyword extraction over the lexicon
//!
//! Entities are found with the lexicon's compiled patterns first; the text
//! between entity spans is then segmented by the dictionary tokenizer.

use super::lexicon::{Lexicon, Pos};
use super::tokenizer::{self, is_han, Token};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Suffixes stripped from role-marker captures ("张三投诉" -> "张三")
const NAME_TRAILERS: [&str; 8] = ["的", "投诉", "反映", "举报", "申诉", "相关", "处理", "情况"];

/// Weighted keyword
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    pub term: String,
    pub pos: Pos,
    pub weight: f32,
}

/// Entities by category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entities {
    #[serde(default)]
    pub persons: Vec<String>,
    #[serde(default)]
    pub organizations: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub times: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
}

impl Entities {
    pub fn count(&self) -> usize {
        self.persons.len()
            + self.organizations.len()
            + self.locations.len()
            + self.times.len()
            + self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Persons, organisations and locations
    pub fn named_count(&self) -> usize {
        self.persons.len() + self.organizations.len() + self.locations.len()
    }

    /// Categories in a fixed order
    pub fn categories(&self) -> [(&'static str, &[String]); 5] {
        [
            ("persons", &self.persons),
            ("organizations", &self.organizations),
            ("locations", &self.locations),
            ("times", &self.times),
            ("topics", &self.topics),
        ]
    }

    /// Every entity, deduplicated in category order
    pub fn all(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.categories()
            .iter()
            .flat_map(|(_, items)| items.iter())
            .filter(|e| seen.insert(e.as_str()))
            .cloned()
            .collect()
    }

    /// Append entries from `other` that are not already present
    pub fn merge(&mut self, other: &Entities) {
        fn extend(into: &mut Vec<String>, from: &[String]) {
            for item in from {
                let item = item.trim();
                if !item.is_empty() && !into.iter().any(|e| e == item) {
                    into.push(item.to_string());
                }
            }
        }
        extend(&mut self.persons, &other.persons);
        extend(&mut self.organizations, &other.organizations);
        extend(&mut self.locations, &other.locations);
        extend(&mut self.times, &other.times);
        extend(&mut self.topics, &other.topics);
    }
}

struct Span {
    start: usize,
    end: usize,
    text: String,
    pos: Pos,
}

/// Keyword and entity extractor
#[derive(Clone)]
pub struct KeywordExtractor {
    lexicon: Arc<Lexicon>,
}

impl KeywordExtractor {
    pub fn new(lexicon: Arc<Lexicon>) -> Self {
        Self { lexicon }
    }

    pub fn lexicon(&self) -> &Lexicon {
        &self.lexicon
    }

    /// Person names, returned with their honorific when one was present
    pub fn get_person_names(&self, text: &str) -> Vec<String> {
        dedupe(self.person_spans(text).into_iter().map(|s| s.text))
    }

    pub fn get_organizations(&self, text: &str) -> Vec<String> {
        dedupe(self.organization_spans(text).into_iter().map(|s| s.text))
    }

    pub fn get_locations(&self, text: &str) -> Vec<String> {
        dedupe(self.location_spans(text).into_iter().map(|s| s.text))
    }

    pub fn get_times(&self, text: &str) -> Vec<String> {
        dedupe(self.time_spans(text).into_iter().map(|s| s.text))
    }

    /// Topic words present in the text, in lexicon order
    pub fn get_topics(&self, text: &str) -> Vec<String> {
        self.lexicon
            .words
            .topic_words
            .iter()
            .filter(|w| text.contains(w.as_str()))
            .cloned()
            .collect()
    }

    pub fn extract_entities(&self, text: &str) -> Entities {
        Entities {
            persons: self.get_person_names(text),
            organizations: self.get_organizations(text),
            locations: self.get_locations(text),
            times: self.get_times(text),
            topics: self.get_topics(text),
        }
    }

    /// Entity-aware segmentation
    pub fn tokenize(&self, text: &str) -> Vec<Token> {
        // Categories claim text in priority order; a span overlapping an
        // already accepted one is dropped
        let mut accepted: Vec<Span> = Vec::new();
        let candidates = self
            .person_spans(text)
            .into_iter()
            .chain(self.time_spans(text))
            .chain(self.organization_spans(text))
            .chain(self.location_spans(text));
        for candidate in candidates {
            let overlaps = accepted
                .iter()
                .any(|s| candidate.start < s.end && s.start < candidate.end);
            if !overlaps {
                accepted.push(candidate);
            }
        }
        accepted.sort_by_key(|s| s.start);

        let mut tokens = Vec::new();
        let mut cursor = 0;
        for span in accepted {
            tokens.extend(tokenizer::segment(&self.lexicon, &text[cursor..span.start]));
            tokens.push(Token {
                text: span.text,
                pos: span.pos,
            });
            cursor = span.end;
        }
        tokens.extend(tokenizer::segment(&self.lexicon, &text[cursor..]));
        tokens
    }

    /// Weighted keywords: term frequency times the POS prior
    ///
    /// Sorted by weight, ties broken by first occurrence.
    pub fn extract_keywords(&self, text: &str, top_k: usize, min_len: usize) -> Vec<Keyword> {
        let mut order: Vec<(String, Pos)> = Vec::new();
        let mut counts: AHashMap<(String, Pos), usize> = AHashMap::new();

        for token in self.tokenize(text) {
            if token.text.chars().count() < min_len {
                continue;
            }
            let key = (token.text, token.pos);
            let count = counts.entry(key.clone()).or_insert(0);
            if *count == 0 {
                order.push(key);
            }
            *count += 1;
        }

        let mut keywords: Vec<Keyword> = order
            .into_iter()
            .map(|key| {
                let count = counts.get(&key).copied().unwrap_or(1);
                Keyword {
                    weight: count as f32 * key.1.prior(),
                    term: key.0,
                    pos: key.1,
                }
            })
            .collect();

        // Stable sort keeps first-occurrence order among equal weights
        keywords.sort_by(|a, b| b.weight.total_cmp(&a.weight));
        keywords.truncate(top_k);
        keywords
    }

    /// Terms indexed for BM25: tokens plus Han bigrams
    pub fn lexical_tokens(&self, text: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .tokenize(text)
            .into_iter()
            .map(|t| t.text.to_lowercase())
            .collect();
        out.extend(tokenizer::han_bigrams(text));
        out
    }

    fn person_spans(&self, text: &str) -> Vec<Span> {
        let lexicon = &self.lexicon;
        let mut spans = Vec::new();

        for m in lexicon.surname_name.find_iter(text) {
            if self.is_valid_titled_name(m.as_str(), 1) {
                spans.push(span(m.start(), m.end(), m.as_str(), Pos::Nr));
            }
        }

        for m in lexicon.titled_name.find_iter(text) {
            let matched = m.as_str();
            let Some(honorific_len) = longest_suffix(matched, &lexicon.words.honorifics) else {
                continue;
            };
            let offset = self.name_start(&matched[..matched.len() - honorific_len]);
            let trimmed = &matched[offset..];
            if self.is_valid_titled_name(trimmed, 2) {
                spans.push(span(m.start() + offset, m.end(), trimmed, Pos::Nr));
            }
        }

        for caps in lexicon.role_name.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                let name = strip_trailers(m.as_str());
                if self.is_valid_name(name) {
                    spans.push(span(m.start(), m.start() + name.len(), name, Pos::Nr));
                }
            }
        }

        spans
    }

    fn organization_spans(&self, text: &str) -> Vec<Span> {
        self.suffixed_spans(text, &self.lexicon.organization, &self.lexicon.words.organization_suffixes, Pos::Nt)
    }

    fn location_spans(&self, text: &str) -> Vec<Span> {
        self.suffixed_spans(text, &self.lexicon.location, &self.lexicon.words.location_suffixes, Pos::Ns)
    }

    fn suffixed_spans(
        &self,
        text: &str,
        regex: &regex::Regex,
        suffixes: &[String],
        pos: Pos,
    ) -> Vec<Span> {
        regex
            .find_iter(text)
            .filter_map(|m| {
                let matched = m.as_str();
                if pos == Pos::Ns && self.lexicon.words.known_places.iter().any(|p| p == matched) {
                    return Some(span(m.start(), m.end(), matched, pos));
                }
                let suffix_len = longest_suffix(matched, suffixes)?;
                let prefix = &matched[..matched.len() - suffix_len];
                let offset = self.name_start(prefix);
                // A bare suffix ("公司", "小区") is not an entity
                (offset < prefix.len())
                    .then(|| span(m.start() + offset, m.end(), &matched[offset..], pos))
            })
            .collect()
    }

    fn time_spans(&self, text: &str) -> Vec<Span> {
        let mut spans: Vec<Span> = self
            .lexicon
            .absolute_time
            .find_iter(text)
            .map(|m| span(m.start(), m.end(), m.as_str(), Pos::T))
            .collect();

        for word in &self.lexicon.words.relative_times {
            for (start, matched) in text.match_indices(word.as_str()) {
                spans.push(span(start, start + matched.len(), matched, Pos::T));
            }
        }
        spans.sort_by_key(|s| s.start);
        spans
    }

    /// Byte offset where a name begins inside `prefix`: just past the last
    /// noise word, stop word or honorific it contains
    fn name_start(&self, prefix: &str) -> usize {
        let words = &self.lexicon.words;
        words
            .leading_noise
            .iter()
            .chain(words.stop_words.iter())
            .chain(words.honorifics.iter())
            .filter(|w| !w.is_empty())
            .filter_map(|w| prefix.rfind(w.as_str()).map(|i| i + w.len()))
            .max()
            .unwrap_or(0)
    }

    /// Validate `<given name><honorific>`, where the given part has at least
    /// `min_base` characters
    fn is_valid_titled_name(&self, name: &str, min_base: usize) -> bool {
        let Some(honorific_len) = longest_suffix(name, &self.lexicon.words.honorifics) else {
            return false;
        };
        let base = &name[..name.len() - honorific_len];

        let base_len = base.chars().count();
        base_len >= min_base
            && base_len <= 4
            && base.chars().all(is_han)
            && !self.lexicon.words.invalid_names.iter().any(|w| w == base)
            && !self.lexicon.dictionary.contains_key(base)
            && !base.chars().any(|c| {
                let mut buf = [0u8; 4];
                self.lexicon.is_stop_word(c.encode_utf8(&mut buf))
            })
    }

    /// Validate a bare 2-4 character name
    fn is_valid_name(&self, name: &str) -> bool {
        let len = name.chars().count();
        (2..=4).contains(&len)
            && name.chars().all(is_han)
            && !self.lexicon.words.invalid_names.iter().any(|w| w == name)
            && !self.lexicon.is_stop_word(name)
    }
}

fn span(start: usize, end: usize, text: &str, pos: Pos) -> Span {
    Span {
        start,
        end,
        text: text.to_string(),
        pos,
    }
}

/// Byte length of the longest entry of `suffixes` that `text` ends with
fn longest_suffix(text: &str, suffixes: &[String]) -> Option<usize> {
    suffixes
        .iter()
        .filter(|s| !s.is_empty() && text.ends_with(s.as_str()))
        .map(String::len)
        .max()
}

fn strip_trailers(name: &str) -> &str {
    let mut name = name;
    while let Some(stripped) = NAME_TRAILERS.iter().find_map(|t| name.strip_suffix(*t)) {
        name = stripped;
    }
    name
}

fn dedupe(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items.filter(|i| seen.insert(i.clone())).collect()
}
