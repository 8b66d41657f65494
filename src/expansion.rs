//! Query expansion: one prompt in, several weighted query variants out.
//!
//! The retrieval pipeline runs every variant against the vector index and
//! scales the returned similarities by the variant weight. The shipped
//! [`KeywordExpander`] is purely lexical.

use std::collections::HashSet;

use anyhow::Result;
use serde::Serialize;

/// Upper bound on variants per query, the original included.
pub const MAX_VARIANTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryVariant {
    pub text: String,
    pub weight: f64,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
}

impl QueryVariant {
    /// The unexpanded query at full weight.
    pub fn original(text: &str) -> Self {
        Self {
            text: text.to_string(),
            weight: 1.0,
            source: "original".into(),
            intent: None,
        }
    }
}

/// Produces weighted variants of a query. Synchronous; the pipeline runs it
/// under `spawn_blocking` with its own timeout.
pub trait QueryExpander: Send + Sync {
    fn expand(&self, query: &str) -> Result<Vec<QueryVariant>>;
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "can", "could", "did", "do", "does",
    "for", "from", "had", "has", "have", "how", "i", "if", "in", "into", "is", "it", "its", "me",
    "my", "of", "on", "or", "our", "please", "should", "so", "that", "the", "their", "then",
    "there", "these", "this", "to", "us", "was", "we", "were", "what", "when", "where", "which",
    "who", "why", "will", "with", "would", "you", "your",
];

/// Lexical expander: keyword-only, identifier/path-only and split-identifier
/// variants, tagged with a coarse intent.
#[derive(Debug, Default, Clone)]
pub struct KeywordExpander;

impl KeywordExpander {
    pub fn new() -> Self {
        Self
    }
}

impl QueryExpander for KeywordExpander {
    fn expand(&self, query: &str) -> Result<Vec<QueryVariant>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let intent = detect_intent(query).to_string();
        let mut seen = HashSet::new();
        let mut variants = Vec::new();

        let mut push = |text: String, weight: f64, source: &str| {
            let key = text.to_lowercase();
            if text.is_empty() || !seen.insert(key) {
                return;
            }
            variants.push(QueryVariant {
                text,
                weight,
                source: source.into(),
                intent: Some(intent.clone()),
            });
        };

        push(query.to_string(), 1.0, "original");

        let words: Vec<&str> = query
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !is_term_char(c)))
            .filter(|w| !w.is_empty())
            .collect();

        let keywords: Vec<&str> = words
            .iter()
            .copied()
            .filter(|w| !STOPWORDS.contains(&w.to_lowercase().as_str()))
            .collect();
        push(keywords.join(" "), 0.8, "keywords");

        let identifiers: Vec<&str> = words.iter().copied().filter(|w| is_identifier(w)).collect();
        push(identifiers.join(" "), 0.9, "identifiers");

        let split: Vec<String> = identifiers.iter().flat_map(|w| split_identifier(w)).collect();
        push(split.join(" "), 0.7, "split-identifiers");

        variants.truncate(MAX_VARIANTS);
        Ok(variants)
    }
}

fn is_term_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '/' | '.' | ':' | '-')
}

/// Paths, `snake_case`, `camelCase`, `Type::path` and dotted names.
fn is_identifier(word: &str) -> bool {
    let has_inner_upper = word.chars().skip(1).any(|c| c.is_uppercase())
        && word.chars().any(|c| c.is_lowercase());
    word.contains('_')
        || word.contains("::")
        || word.contains('/')
        || (word.contains('.') && !word.ends_with('.'))
        || has_inner_upper
}

/// Break an identifier or path into lowercase words.
fn split_identifier(word: &str) -> Vec<String> {
    let mut parts = Vec::new();
    for chunk in word.split(|c: char| matches!(c, '_' | '/' | '.' | ':' | '-')) {
        let mut current = String::new();
        let mut prev_lower = false;
        for c in chunk.chars() {
            if c.is_uppercase() && prev_lower && !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
            current.extend(c.to_lowercase());
        }
        if !current.is_empty() {
            parts.push(current);
        }
    }
    parts
}

fn detect_intent(query: &str) -> &'static str {
    let lower = query.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    if has(&["error", "bug", "fail", "crash", "panic", "broken", "fix"]) {
        "debug"
    } else if lower.starts_with("how") || has(&["implement", "add ", "create"]) {
        "howto"
    } else if lower.starts_with("where") || has(&["find", "locate", "which file"]) {
        "locate"
    } else if lower.starts_with("why") || has(&["explain", "what is"]) {
        "explain"
    } else {
        "general"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn original_always_first_at_full_weight() {
        let variants = KeywordExpander::new().expand("how does the cache work").unwrap();
        assert_eq!(variants[0].text, "how does the cache work");
        assert_eq!(variants[0].weight, 1.0);
        assert_eq!(variants[0].source, "original");
        assert_eq!(variants[1].text, "cache work");
        assert_eq!(variants[1].source, "keywords");
    }

    #[test]
    fn identifiers_are_extracted_and_split() {
        let variants = KeywordExpander::new()
            .expand("why does parseConfig fail in src/config.rs")
            .unwrap();
        let ident = variants.iter().find(|v| v.source == "identifiers").unwrap();
        assert_eq!(ident.text, "parseConfig src/config.rs");
        let split = variants
            .iter()
            .find(|v| v.source == "split-identifiers")
            .unwrap();
        assert_eq!(split.text, "parse config src config rs");
        assert_eq!(ident.intent.as_deref(), Some("debug"));
    }

    #[test]
    fn duplicate_variants_collapse() {
        let variants = KeywordExpander::new().expand("authentication").unwrap();
        assert_eq!(variants.len(), 1);
    }

    #[test]
    fn empty_query_expands_to_nothing() {
        assert!(KeywordExpander::new().expand("   ").unwrap().is_empty());
    }

    #[test]
    fn never_more_than_max_variants() {
        let variants = KeywordExpander::new()
            .expand("where is the snake_case HttpClient in lib/net.rs")
            .unwrap();
        assert!(variants.len() <= MAX_VARIANTS);
    }

    #[test]
    fn intent_detection() {
        assert_eq!(detect_intent("where is the router"), "locate");
        assert_eq!(detect_intent("How to add a route"), "howto");
        assert_eq!(detect_intent("login crash on startup"), "debug");
        assert_eq!(detect_intent("database schema"), "general");
    }
}
