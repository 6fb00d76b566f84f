use crate::normalize::{PhotoDelimiter, split_photos};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(?:https?://[^\s<>"']+|\bwww\.[^\s<>"']+|\b[a-z0-9][a-z0-9-]*(?:\.[a-z0-9-]+)*\.[a-z]{2,}/[^\s<>"']*)"#,
    )
    .expect("url pattern compiles")
});

const TRAILING: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '}', '\'', '"', '>'];

/// Links found in free text, scheme-qualified and in order of appearance.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    URL_RE
        .find_iter(text)
        .filter_map(|m| canonical_url(m.as_str()))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

/// The text with every recognised link replaced by a space.
pub fn strip_urls(text: &str) -> String {
    URL_RE.replace_all(text, " ").into_owned()
}

/// Manually supplied photos first, then links found in the text that are not already listed.
pub fn merge_photo_urls(manual: &str, text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut photos = Vec::new();
    let manual_urls = split_photos(manual, PhotoDelimiter::Manual)
        .into_iter()
        .map(|p| canonical_url(&p).unwrap_or(p));
    for url in manual_urls.chain(extract_urls(text)) {
        if seen.insert(url.clone()) {
            photos.push(url);
        }
    }
    photos
}

fn canonical_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches(TRAILING);
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        Some(trimmed.to_string())
    } else {
        Some(format!("https://{trimmed}"))
    }
}
