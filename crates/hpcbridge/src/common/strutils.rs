use rand::Rng;
use rand::distr::Alphanumeric;

/// Splits a comma-separated manifest string into its trimmed, non-empty items.
pub fn split_manifest(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(|item| item.to_string())
        .collect()
}

pub fn random_suffix(length: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub fn pluralize(text: &str, count: usize) -> String {
    if count == 1 {
        text.to_string()
    } else {
        format!("{text}s")
    }
}
