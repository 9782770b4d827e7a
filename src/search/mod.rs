//! Keyword tokenization for token-overlap search
//!
//! Search is lexical: a chunk scores by how many distinct query
//! terms it contains, then by how often. No stemming, no embeddings.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{L}\p{N}_]+").unwrap());

/// Words that carry no signal for overlap ranking
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of",
    "on", "or", "that", "the", "this", "to", "was", "with",
];

/// Longest term kept in the index
pub const MAX_TERM_LENGTH: usize = 64;

/// Lowercased terms of `text` in order of appearance, stopwords removed
pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|t| t.chars().count() <= MAX_TERM_LENGTH && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Distinct query terms, sorted so the same query always binds the same way
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms = tokenize(query);
    terms.sort();
    terms.dedup();
    terms
}

/// Term frequencies for indexing a chunk's content and tags
pub fn term_frequencies(content: &str, tags: &[String]) -> BTreeMap<String, i64> {
    let mut frequencies = BTreeMap::new();
    for term in tokenize(content)
        .into_iter()
        .chain(tags.iter().flat_map(|t| tokenize(t)))
    {
        *frequencies.entry(term).or_insert(0) += 1;
    }
    frequencies
}
