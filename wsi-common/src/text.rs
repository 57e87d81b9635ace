//! Tokenization and search-field generation
//!
//! Persisted documents carry a `tokenized` array (the full joined string
//! first, then each distinct word), a tokenized company name, and a
//! per-character count map used for incomplete-word matching.

use crate::models::{Company, Industry, Location};
use std::collections::BTreeMap;

const STOP_WORDS: [&str; 2] = ["the", "and"];

/// Maximum length of a derived place-name slug.
pub const MAX_SLUG_LEN: usize = 30;

/// Lowercase, strip non-alphanumerics, split into distinct words
/// (first-occurrence order preserved).
pub fn tokenize_string(s: &str) -> Vec<String> {
    let cleaned: String = s
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();

    let mut tokens: Vec<String> = Vec::new();
    for word in cleaned.split_whitespace() {
        if !tokens.iter().any(|t| t == word) {
            tokens.push(word.to_string());
        }
    }
    tokens
}

/// Build the `tokenized` search array from an entity's identity strings.
///
/// Stop-words are removed and the full joined string is prepended as the
/// first element.
pub fn tokenize_parts(parts: &[Option<&str>]) -> Vec<String> {
    let joined = parts
        .iter()
        .filter_map(|p| *p)
        .collect::<Vec<_>>()
        .join(" ");

    let mut tokens: Vec<String> = tokenize_string(&joined)
        .into_iter()
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect();

    tokens.insert(0, tokens.join(" "));
    tokens
}

/// Search tokens for a Location: company + establishment + city/state.
pub fn tokenize_location(loc: &Location) -> Vec<String> {
    tokenize_parts(&[
        Some(loc.company_name.as_str()),
        loc.industry.as_ref().and_then(|i: &Industry| i.caption.as_deref()),
        loc.ein.as_deref(),
        loc.establishment_name.as_deref(),
        loc.city.as_deref(),
        loc.state.as_deref(),
    ])
}

/// Search tokens for a Company: company name + industry + all EINs.
pub fn tokenize_company(company: &Company) -> Vec<String> {
    let mut parts: Vec<Option<&str>> = vec![
        Some(company.company_name.as_str()),
        company.industry.as_ref().and_then(|i| i.caption.as_deref()),
        company.ein.as_deref(),
    ];
    for ein in &company.eins {
        parts.push(Some(ein.as_str()));
    }
    tokenize_parts(&parts)
}

/// Count each ASCII letter and digit in `s` (case-insensitive).
pub fn char_count(s: &str) -> BTreeMap<char, u32> {
    let mut counts: BTreeMap<char, u32> = BTreeMap::new();
    for c in ('a'..='z').chain('0'..='9') {
        counts.insert(c, 0);
    }
    for c in s.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            *counts.entry(c).or_insert(0) += 1;
        }
    }
    counts
}

/// Derive a place-name slug from a company name: hyphen-joined tokens,
/// truncated to [`MAX_SLUG_LEN`] with trailing hyphens removed, plus an
/// optional numeric uniqueness suffix.
pub fn slugify(company_name: &str, suffix: u32) -> String {
    let tokens = tokenize_string(company_name);
    let mut slug: String = tokens.join("-").chars().take(MAX_SLUG_LEN).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    if suffix > 0 {
        slug.push_str(&format!("-{}", suffix));
    }
    slug
}

/// Trimmed cell text, `None` when empty.
pub fn coerce_string(v: Option<&str>) -> Option<String> {
    let trimmed = v?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parse a numeric cell, truncating any fractional part (some source
/// files append `.00` to integer columns).
pub fn coerce_number(v: Option<&str>) -> Option<f64> {
    let trimmed = v?.trim();
    trimmed.parse::<f64>().ok().map(f64::trunc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_removes_punctuation_and_duplicates() {
        assert_eq!(
            tokenize_string("Target, Inc. - Target Store #42"),
            vec!["target", "inc", "store", "42"]
        );
    }

    #[test]
    fn tokenize_parts_prepends_full_string() {
        let tokens = tokenize_parts(&[Some("The Acme Co"), None, Some("Acme")]);
        assert_eq!(tokens[0], "acme co");
        assert_eq!(&tokens[1..], ["acme", "co"]);
    }

    #[test]
    fn char_count_covers_alphabet_and_digits() {
        let counts = char_count("Abba 11");
        assert_eq!(counts[&'a'], 2);
        assert_eq!(counts[&'b'], 2);
        assert_eq!(counts[&'1'], 2);
        assert_eq!(counts[&'z'], 0);
        assert_eq!(counts.len(), 36);
    }

    #[test]
    fn slugify_truncates_and_suffixes() {
        assert_eq!(slugify("Acme Widgets", 0), "acme-widgets");
        assert_eq!(slugify("Acme Widgets", 2), "acme-widgets-2");
        let long = slugify("A Very Long Company Name That Goes On Forever", 0);
        assert!(long.len() <= MAX_SLUG_LEN);
        assert!(!long.ends_with('-'));
    }

    #[test]
    fn coerce_number_truncates_decimals() {
        assert_eq!(coerce_number(Some(" 123.00 ")), Some(123.0));
        assert_eq!(coerce_number(Some("abc")), None);
        assert_eq!(coerce_number(None), None);
    }
}
