use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static TERM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("valid regex"));

/// Case-folds, NFKC-normalizes and collapses whitespace so that queries
/// differing only in formatting normalize to the same string.
pub fn normalize_query(text: &str) -> String {
    let trimmed = text.trim_matches(|c: char| c.is_control() || c.is_whitespace());
    let nfkc = trimmed.nfkc().collect::<String>();
    let mut result = String::with_capacity(nfkc.len());
    let mut prev_space = false;
    for ch in nfkc.chars() {
        if ch.is_whitespace() {
            if !prev_space {
                result.push(' ');
                prev_space = true;
            }
            continue;
        }
        if ch.is_control() {
            continue;
        }
        result.extend(ch.to_lowercase());
        prev_space = false;
    }
    result.trim().to_string()
}

/// Alphanumeric terms of the normalized text, in order of appearance.
pub fn query_terms(text: &str) -> Vec<String> {
    let normalized = normalize_query(text);
    TERM_RE
        .find_iter(&normalized)
        .map(|m| m.as_str().to_string())
        .collect()
}
