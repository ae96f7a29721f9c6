//! Dictionary segmentation for mixed CJK / ASCII text
//!
//! Han runs are split by forward maximum matching against the lexicon
//! dictionary; characters no dictionary word covers are emitted as bigrams.
//! ASCII runs become lowercase words or numerals.

use super::lexicon::{Lexicon, Pos};
use serde::{Deserialize, Serialize};

/// A segmented token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub text: String,
    pub pos: Pos,
}

impl Token {
    fn new(text: impl Into<String>, pos: Pos) -> Self {
        Self {
            text: text.into(),
            pos,
        }
    }
}

pub fn is_han(c: char) -> bool {
    matches!(c, '\u{4e00}'..='\u{9fff}' | '\u{3400}'..='\u{4dbf}' | '\u{f900}'..='\u{faff}')
}

/// Segment text without entity awareness; stop words are dropped
pub fn segment(lexicon: &Lexicon, text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_alphanumeric() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_alphanumeric() {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect::<String>().to_lowercase();
            let pos = if word.chars().all(|c| c.is_ascii_digit()) {
                Pos::M
            } else {
                Pos::Eng
            };
            tokens.push(Token::new(word, pos));
        } else if is_han(c) {
            let start = i;
            while i < chars.len() && is_han(chars[i]) {
                i += 1;
            }
            segment_han_run(lexicon, &chars[start..i], &mut tokens);
        } else {
            i += 1;
        }
    }

    tokens.retain(|t| !lexicon.is_stop_word(&t.text));
    tokens
}

fn segment_han_run(lexicon: &Lexicon, run: &[char], tokens: &mut Vec<Token>) {
    let mut remainder: Vec<char> = Vec::new();
    let mut i = 0;

    while i < run.len() {
        let longest = lexicon.max_word_chars.min(run.len() - i);
        let matched = (1..=longest).rev().find_map(|len| {
            let word: String = run[i..i + len].iter().collect();
            lexicon.dictionary.get(&word).map(|pos| (word, *pos, len))
        });

        match matched {
            Some((word, pos, len)) => {
                flush_remainder(&mut remainder, tokens);
                tokens.push(Token::new(word, pos));
                i += len;
            }
            None => {
                remainder.push(run[i]);
                i += 1;
            }
        }
    }

    flush_remainder(&mut remainder, tokens);
}

fn flush_remainder(remainder: &mut Vec<char>, tokens: &mut Vec<Token>) {
    match remainder.len() {
        0 => {}
        1 => tokens.push(Token::new(remainder[0].to_string(), Pos::X)),
        _ => {
            for pair in remainder.windows(2) {
                tokens.push(Token::new(pair.iter().collect::<String>(), Pos::X));
            }
        }
    }
    remainder.clear();
}

/// Character bigrams of every Han run (single characters for runs of one)
pub fn han_bigrams(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut run: Vec<char> = Vec::new();

    let flush = |run: &mut Vec<char>, out: &mut Vec<String>| {
        match run.len() {
            0 => {}
            1 => out.push(run[0].to_string()),
            _ => out.extend(run.windows(2).map(|p| p.iter().collect::<String>())),
        }
        run.clear();
    };

    for c in text.chars() {
        if is_han(c) {
            run.push(c);
        } else {
            flush(&mut run, &mut out);
        }
    }
    flush(&mut run, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(tokens: &[Token]) -> Vec<&str> {
        tokens.iter().map(|t| t.text.as_str()).collect()
    }

    #[test]
    fn test_max_match_prefers_dictionary_words() {
        let lexicon = Lexicon::builtin().unwrap();
        let tokens = segment(&lexicon, "投诉内容的处理结果");
        assert_eq!(texts(&tokens), vec!["投诉", "内容", "处理", "结果"]);
        assert_eq!(tokens[2].pos, Pos::V);
    }

    #[test]
    fn test_unknown_han_becomes_bigrams() {
        let lexicon = Lexicon::builtin().unwrap();
        let tokens = segment(&lexicon, "蓝莓果酱投诉");
        assert_eq!(texts(&tokens), vec!["蓝莓", "莓果", "果酱", "投诉"]);
        assert_eq!(tokens[0].pos, Pos::X);
    }

    #[test]
    fn test_ascii_words_and_numbers() {
        let lexicon = Lexicon::builtin().unwrap();
        let tokens = segment(&lexicon, "Q1 Sales of 2024");
        assert_eq!(texts(&tokens), vec!["q1", "sales", "2024"]);
        assert_eq!(tokens[2].pos, Pos::M);
        assert_eq!(tokens[1].pos, Pos::Eng);
    }

    #[test]
    fn test_han_bigrams() {
        assert_eq!(han_bigrams("投诉内容 a 张"), vec!["投诉", "诉内", "内容", "张"]);
        assert!(han_bigrams("abc").is_empty());
    }
}
