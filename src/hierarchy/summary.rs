//! Summary text for merged groups
//!
//! Short groups are summarised verbatim. Longer ones prefer a structured
//! digest of labelled record fields, then a selection of signal lines, and
//! finally plain truncation.

use crate::config::{HierarchyConfig, RecordFieldsConfig};
use crate::document::{MergedGroup, SummaryDocument};
use crate::entities::KeywordExtractor;

const MAX_LISTED: usize = 3;
const EXCERPT_CHARS: usize = 200;
const MIN_EXCERPT_CHARS: usize = 10;
const LONG_LINE_CHARS: usize = 20;

pub struct SummaryBuilder<'a> {
    config: &'a HierarchyConfig,
    extractor: &'a KeywordExtractor,
}

impl<'a> SummaryBuilder<'a> {
    pub fn new(config: &'a HierarchyConfig, extractor: &'a KeywordExtractor) -> Self {
        Self { config, extractor }
    }

    pub fn summarize(&self, group: &MergedGroup) -> SummaryDocument {
        let combined = group.combined_content();
        let content = self.summary_text(&combined, group);
        let keywords = self
            .extractor
            .extract_keywords(&combined, self.config.topic_keywords, 2)
            .into_iter()
            .map(|k| k.term)
            .collect();

        SummaryDocument {
            group_id: group.id.clone(),
            content,
            fragment_count: group.fragment_count(),
            sources: group.sources(),
            keywords,
            fragment_ids: group.fragment_ids(),
        }
    }

    fn summary_text(&self, combined: &str, group: &MergedGroup) -> String {
        if combined.chars().count() <= self.config.verbatim_summary_chars {
            return combined.to_string();
        }

        if let Some(structured) =
            structured_summary(combined, &self.config.record_fields, group.fragment_count())
        {
            return structured;
        }

        let lines = self.signal_lines(combined);
        if !lines.is_empty() {
            let mut summary = lines.join("\n");
            if group.members.len() > 1 {
                summary.push_str(&merged_sources_note(&group.sources()));
            }
            return summary;
        }

        truncate_chars(combined, self.config.summary_budget_chars)
    }

    /// Lines carrying a signal word or long enough to be descriptive, until
    /// the budget is exceeded
    fn signal_lines<'c>(&self, combined: &'c str) -> Vec<&'c str> {
        let mut selected = Vec::new();
        let mut length = 0;

        for line in combined.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let signal = self
                .config
                .signal_words
                .iter()
                .any(|w| line.contains(w.as_str()));
            if !signal && line.chars().count() <= LONG_LINE_CHARS {
                continue;
            }

            length += line.chars().count() + usize::from(!selected.is_empty());
            selected.push(line);
            if length > self.config.summary_budget_chars {
                break;
            }
        }

        selected
    }
}

/// Value of a `label: value` line when the label is one of `labels`
fn labelled_value<'l>(line: &'l str, labels: &[String]) -> Option<&'l str> {
    let (label, value) = line.split_once([':', '：'])?;
    let label = label.trim();
    labels
        .iter()
        .any(|l| l == label)
        .then(|| value.trim())
        .filter(|v| !v.is_empty())
}

fn push_unique(values: &mut Vec<String>, value: &str) {
    if !values.iter().any(|v| v == value) {
        values.push(value.to_string());
    }
}

/// Digest of labelled record fields, or `None` when no field is present
pub fn structured_summary(
    combined: &str,
    fields: &RecordFieldsConfig,
    record_count: usize,
) -> Option<String> {
    let mut persons = Vec::new();
    let mut organizations = Vec::new();
    let mut categories = Vec::new();
    let mut locations = Vec::new();
    let mut excerpt: Option<String> = None;

    for line in combined.lines().map(str::trim) {
        if let Some(v) = labelled_value(line, &fields.person) {
            push_unique(&mut persons, v);
        } else if let Some(v) = labelled_value(line, &fields.organization) {
            push_unique(&mut organizations, v);
        } else if let Some(v) = labelled_value(line, &fields.category) {
            push_unique(&mut categories, v);
        } else if let Some(v) = labelled_value(line, &fields.location) {
            push_unique(&mut locations, v);
        } else if let Some(v) = labelled_value(line, &fields.content) {
            if excerpt.is_none() && v.chars().count() > MIN_EXCERPT_CHARS {
                excerpt = Some(truncate_chars(v, EXCERPT_CHARS));
            }
        }
    }

    let mut parts = Vec::new();
    if !persons.is_empty() {
        parts.push(format!("相关人员: {}", persons.join(", ")));
    }
    if !organizations.is_empty() {
        parts.push(format!("涉及单位: {}", first_n(&organizations)));
    }
    if !categories.is_empty() {
        parts.push(format!("问题类型: {}", first_n(&categories)));
    }
    if !locations.is_empty() {
        parts.push(format!("事发地区: {}", locations.join(", ")));
    }
    if let Some(excerpt) = excerpt {
        parts.push(format!("内容示例: {}", excerpt));
    }

    if parts.is_empty() {
        return None;
    }
    parts.push(format!("记录数量: {}", record_count));
    Some(parts.join("\n"))
}

fn first_n(values: &[String]) -> String {
    values
        .iter()
        .take(MAX_LISTED)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ")
}

fn merged_sources_note(sources: &[String]) -> String {
    let names: Vec<&str> = sources
        .iter()
        .map(|s| s.rsplit(['/', '\\']).next().unwrap_or(s))
        .collect();
    let more = if names.len() > MAX_LISTED { "等" } else { "" };
    format!(
        "\n\n[合并文档: {}{}]",
        names.iter().take(MAX_LISTED).copied().collect::<Vec<_>>().join(", "),
        more
    )
}

/// First `max` chars, with `...` appended when anything was cut
pub fn truncate_chars(text: &str, max: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
