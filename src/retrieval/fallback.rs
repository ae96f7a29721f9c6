//! Raw-source scan used when every index path comes back empty
//!
//! Reads the original files under `<kb_root>/content` and scores each record
//! by the weighted fields its query terms hit. Delimited files yield one
//! record per data row keyed by the header; text files yield one record per
//! blank-line separated block, where `label: value` lines become fields.

use crate::config::FallbackConfig;
use crate::document::{Fragment, SOURCE_KEY};
use crate::entities::KeywordExtractor;
use crate::error::Result;
use crate::retrieval::{sort_by_score, ScoredFragment};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const CONTENT_DIR: &str = "content";
const STOP_FRAGMENTS: &[&str] = &["是什么", "多少次", "的", "了"];
const TEXT_FIELD: &str = "text";

/// Split a query into scan terms
///
/// The query is cut on punctuation and whitespace, stop fragments are
/// removed, and extracted keywords and entities are appended.
pub fn preprocess_query(query: &str, extractor: &KeywordExtractor) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |term: &str| {
        let term = term.trim();
        if term.chars().count() >= 2 && seen.insert(term.to_string()) {
            terms.push(term.to_string());
        }
    };

    for piece in query.split(|c: char| c.is_whitespace() || is_punctuation(c)) {
        let mut piece = piece.to_string();
        for stop in STOP_FRAGMENTS {
            piece = piece.replace(stop, " ");
        }
        piece.split_whitespace().for_each(&mut push);
    }

    for keyword in extractor.extract_keywords(query, 10, 2) {
        push(&keyword.term);
    }
    for entity in extractor.extract_entities(query).all() {
        push(&entity);
    }

    terms
}

fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation() || "，。！？、；：“”‘’（）《》【】…".contains(c)
}

/// One record read from a source file
#[derive(Debug, Clone, PartialEq)]
struct SourceRecord {
    position: usize,
    fields: Vec<(String, String)>,
}

impl SourceRecord {
    fn content(&self) -> String {
        self.fields
            .iter()
            .map(|(label, value)| {
                if label == TEXT_FIELD {
                    value.clone()
                } else {
                    format!("{}: {}", label, value)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub struct SourceScanner {
    config: FallbackConfig,
    extractor: KeywordExtractor,
}

impl SourceScanner {
    pub fn new(config: FallbackConfig, extractor: KeywordExtractor) -> Self {
        Self { config, extractor }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Scan the sources of one knowledge base for `query`
    pub fn scan(&self, kb_root: &Path, query: &str, top_k: usize) -> Result<Vec<ScoredFragment>> {
        let content_dir = kb_root.join(CONTENT_DIR);
        if !self.config.enabled || top_k == 0 || !content_dir.is_dir() {
            return Ok(Vec::new());
        }

        let terms: Vec<String> = preprocess_query(query, &self.extractor)
            .into_iter()
            .map(|t| t.to_lowercase())
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let best_weight = self
            .config
            .name_weight
            .max(self.config.content_weight)
            .max(self.config.other_weight);
        let max_score = terms.len() as f32 * best_weight;

        let mut hits = Vec::new();
        for entry in WalkDir::new(&content_dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            let Some(extension) = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase())
            else {
                continue;
            };
            if !self.config.extensions.iter().any(|e| *e == extension) {
                continue;
            }

            let text = match read_source(path) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Skipping unreadable source {:?}: {}", path, e);
                    continue;
                }
            };
            let records = match extension.as_str() {
                "csv" => parse_delimited(&text, ','),
                "tsv" => parse_delimited(&text, '\t'),
                _ => parse_text_blocks(&text),
            };

            let source = path
                .strip_prefix(&content_dir)
                .unwrap_or(path)
                .to_string_lossy()
                .to_string();
            for record in records {
                let (score, matched_fields) = self.score_record(&record, &terms);
                if score > 0.0 {
                    let fragment = record_fragment(&source, &record, matched_fields);
                    hits.push(ScoredFragment::new(fragment, (score / max_score).min(1.0)));
                }
            }
        }

        sort_by_score(&mut hits);
        hits.truncate(top_k);
        debug!(
            "Source scan of {:?} for '{}' ({} terms): {} hits",
            content_dir,
            query,
            terms.len(),
            hits.len()
        );
        Ok(hits)
    }

    fn field_weight(&self, label: &str) -> f32 {
        if self.config.name_fields.iter().any(|f| f == label) {
            self.config.name_weight
        } else if self.config.content_fields.iter().any(|f| f == label) {
            self.config.content_weight
        } else {
            self.config.other_weight
        }
    }

    fn score_record(&self, record: &SourceRecord, terms: &[String]) -> (f32, Vec<String>) {
        let mut score = 0.0;
        let mut matched = Vec::new();
        for (label, value) in &record.fields {
            let value = value.to_lowercase();
            let hits = terms.iter().filter(|t| value.contains(t.as_str())).count();
            if hits > 0 {
                score += hits as f32 * self.field_weight(label);
                matched.push(label.clone());
            }
        }
        (score, matched)
    }
}

fn record_fragment(source: &str, record: &SourceRecord, matched_fields: Vec<String>) -> Fragment {
    let mut metadata = Map::new();
    metadata.insert(SOURCE_KEY.into(), Value::from(source));
    metadata.insert("row".into(), Value::from(record.position));
    metadata.insert("retriever_type".into(), Value::from("source_fallback"));
    metadata.insert("matched_fields".into(), Value::from(matched_fields));
    Fragment::new(record.content(), metadata)
}

/// Read a source file, replacing invalid UTF-8 sequences
fn read_source(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    match String::from_utf8(bytes) {
        Ok(text) => Ok(text),
        Err(e) => {
            warn!(
                "Source {:?} is not valid UTF-8 (at byte {}), decoding lossily",
                path,
                e.utf8_error().valid_up_to()
            );
            Ok(String::from_utf8_lossy(e.as_bytes()).into_owned())
        }
    }
}

/// Records of a delimited file keyed by its header
///
/// Positions count every record after the header, blank ones included, so
/// they line up with the row numbers assigned at ingestion.
fn parse_delimited(text: &str, delimiter: char) -> Vec<SourceRecord> {
    let is_blank = |record: &[String]| record.iter().all(|v| v.trim().is_empty());

    let mut records = split_records(text.trim_start_matches('\u{feff}'), delimiter).into_iter();
    let Some(header) = records.by_ref().find(|r| !is_blank(r)) else {
        return Vec::new();
    };
    let header: Vec<String> = header.into_iter().map(|h| h.trim().to_string()).collect();

    records
        .enumerate()
        .filter(|(_, record)| !is_blank(record))
        .map(|(i, record)| {
            let fields = record
                .into_iter()
                .enumerate()
                .filter(|(_, value)| !value.trim().is_empty())
                .map(|(col, value)| {
                    let label = header
                        .get(col)
                        .cloned()
                        .unwrap_or_else(|| format!("column_{}", col + 1));
                    (label, value.trim().to_string())
                })
                .collect();
            SourceRecord {
                position: i + 1,
                fields,
            }
        })
        .collect()
}

/// Split delimited text into records of fields
///
/// Double quotes group a cell, `""` is an escaped quote, and delimiters or
/// line breaks inside quotes belong to the cell.
fn split_records(text: &str, delimiter: char) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' if !quoted => {
                fields.push(std::mem::take(&mut current));
                records.push(std::mem::take(&mut fields));
            }
            c if c == delimiter && !quoted => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    if !current.is_empty() || !fields.is_empty() {
        fields.push(current);
        records.push(fields);
    }
    records
}

fn parse_text_blocks(text: &str) -> Vec<SourceRecord> {
    let mut records = Vec::new();
    let mut block: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            flush_block(&mut block, &mut records);
        } else {
            block.push(line);
        }
    }
    flush_block(&mut block, &mut records);
    records
}

fn flush_block(block: &mut Vec<&str>, records: &mut Vec<SourceRecord>) {
    if block.is_empty() {
        return;
    }
    let mut fields = Vec::new();
    let mut free_text = Vec::new();
    for line in block.drain(..) {
        match split_label(line) {
            Some((label, value)) => fields.push((label.to_string(), value.to_string())),
            None => free_text.push(line.trim()),
        }
    }
    if !free_text.is_empty() {
        fields.push((TEXT_FIELD.to_string(), free_text.join("\n")));
    }
    records.push(SourceRecord {
        position: records.len() + 1,
        fields,
    });
}

fn split_label(line: &str) -> Option<(&str, &str)> {
    let (label, value) = line.split_once(['：', ':'])?;
    let label = label.trim();
    if label.is_empty() || label.chars().count() > 10 || value.trim().is_empty() {
        return None;
    }
    Some((label, value.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Lexicon;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn extractor() -> KeywordExtractor {
        KeywordExtractor::new(Arc::new(Lexicon::builtin().unwrap()))
    }

    #[test]
    fn test_preprocess_query_drops_stop_fragments() {
        let terms = preprocess_query("张女士投诉了多少次？", &extractor());
        assert_eq!(terms[0], "张女士投诉");
        assert!(terms.contains(&"张女士".to_string()));
    }

    #[test]
    fn test_split_records_honours_quotes() {
        assert_eq!(
            split_records("a,\"b,c\",\"say \"\"hi\"\"\"\r\nd,e\n", ','),
            vec![vec!["a", "b,c", "say \"hi\""], vec!["d", "e"]]
        );
    }

    #[test]
    fn test_quoted_cell_spanning_lines_stays_one_record() {
        let records = parse_delimited(
            "姓名,内容\n张女士,\"噪音\n夜间施工\"\n李先生,停车收费\n",
            ',',
        );
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].fields,
            vec![
                ("姓名".to_string(), "张女士".to_string()),
                ("内容".to_string(), "噪音\n夜间施工".to_string())
            ]
        );
        assert_eq!(records[1].position, 2);
        assert_eq!(records[1].fields[0].1, "李先生");
    }

    #[test]
    fn test_row_positions_count_blank_lines() {
        let records = parse_delimited("\u{feff}姓名,内容\n张女士,噪音\n\n李先生,停车\n", ',');
        let positions: Vec<usize> = records.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![1, 3]);
    }

    #[test]
    fn test_invalid_utf8_source_is_decoded_lossily() {
        let temp = TempDir::new().unwrap();
        let content = temp.path().join(CONTENT_DIR);
        std::fs::create_dir_all(&content).unwrap();
        let mut bytes = "姓名,内容\n张女士,噪音\n".as_bytes().to_vec();
        bytes.extend_from_slice(&[0xd5, 0xc5, b',', 0xc5, b'\n']);
        std::fs::write(content.join("gbk.csv"), bytes).unwrap();

        let scanner = SourceScanner::new(FallbackConfig::default(), extractor());
        let hits = scanner.scan(temp.path(), "张女士", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id(), "gbk.csv_row_1");
    }

    #[test]
    fn test_text_blocks() {
        let records = parse_text_blocks("姓名: 张女士\n内容：噪音扰民\n\n普通段落\n第二行\n");
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].fields,
            vec![
                ("姓名".to_string(), "张女士".to_string()),
                ("内容".to_string(), "噪音扰民".to_string())
            ]
        );
        assert_eq!(records[1].content(), "普通段落\n第二行");
    }

    #[test]
    fn test_scan_weights_name_fields() {
        let temp = TempDir::new().unwrap();
        let content = temp.path().join(CONTENT_DIR);
        std::fs::create_dir_all(&content).unwrap();
        std::fs::write(
            content.join("complaints.csv"),
            "提供方姓名,具体问题,备注\n张女士,物业噪音扰民,无\n李先生,停车收费,张女士邻居\n",
        )
        .unwrap();
        std::fs::write(content.join("ignored.bin"), "张女士").unwrap();

        let scanner = SourceScanner::new(FallbackConfig::default(), extractor());
        let hits = scanner.scan(temp.path(), "张女士", 5).unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id(), "complaints.csv_row_1");
        assert!(hits[0].score > hits[1].score);
        assert_eq!(
            hits[0].fragment.metadata["retriever_type"],
            Value::from("source_fallback")
        );
        assert_eq!(
            hits[0].fragment.metadata["matched_fields"],
            Value::from(vec!["提供方姓名"])
        );
    }

    #[test]
    fn test_scan_without_content_dir() {
        let temp = TempDir::new().unwrap();
        let scanner = SourceScanner::new(FallbackConfig::default(), extractor());
        assert!(scanner.scan(temp.path(), "张女士", 5).unwrap().is_empty());
    }
}
