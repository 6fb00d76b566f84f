//! Maps source-specific records onto the canonical [`ListingDraft`] shape.
//!
//! Everything here is pure: no network and no store access.

use crate::models::{ListingDraft, ListingOrigin, ListingStatus, VehicleType};
use chrono::{Datelike, Utc};
use std::collections::{HashMap, HashSet};

/// One tabular record keyed by lowercased header name.
pub type RawRecord = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoDelimiter {
    /// `|` separated, as written by CSV feeds.
    Pipe,
    /// Newline, comma or pipe separated, as typed by people.
    Manual,
}

pub fn normalize_record(
    record: &RawRecord,
    dealer_id: &str,
    origin: ListingOrigin,
    delimiter: PhotoDelimiter,
) -> ListingDraft {
    let field = |name: &str| text(record.get(name).map(String::as_str));
    ListingDraft {
        dealer_id: dealer_id.to_string(),
        origin,
        stock_id: field("stock_id"),
        vehicle_type: record
            .get("type")
            .map(|v| VehicleType::coerce(v))
            .unwrap_or_default(),
        make: field("make"),
        model: field("model"),
        variant: field("variant"),
        year: record.get("year").and_then(|v| coerce_year(v)),
        km: record.get("km").and_then(|v| coerce_number(v)),
        fuel: field("fuel").map(|v| v.to_ascii_lowercase()),
        transmission: field("transmission").map(|v| v.to_ascii_lowercase()),
        price: record.get("price").and_then(|v| coerce_number(v)),
        location: field("location"),
        description: field("description"),
        photos: record
            .get("photos")
            .map(|v| split_photos(v, delimiter))
            .unwrap_or_default(),
        status: record
            .get("status")
            .map(|v| ListingStatus::coerce(v))
            .unwrap_or_default(),
    }
}

/// Trimmed text, or `None` when blank.
pub fn text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Lenient integer coercion for prices and odometer readings.
///
/// Separators, currency markers and a trailing distance unit are ignored. Unparsable,
/// negative or non-finite input yields `None` rather than an error.
pub fn coerce_number(raw: &str) -> Option<i64> {
    let mut cleaned = raw.trim().to_ascii_lowercase();
    for marker in ["₹", "$", "inr", "rs.", "rs", "kms", "km"] {
        cleaned = cleaned.replace(marker, "");
    }
    cleaned.retain(|c| !(c.is_whitespace() || c == ',' || c == '_'));
    if cleaned.is_empty() {
        return None;
    }
    let value = cleaned.parse::<f64>().ok()?;
    if !value.is_finite() || value < 0.0 || value > i64::MAX as f64 {
        return None;
    }
    Some(value.round() as i64)
}

pub fn coerce_year(raw: &str) -> Option<i32> {
    let year = coerce_number(raw)?;
    let max = i64::from(Utc::now().year()) + 1;
    (1900..=max).contains(&year).then_some(year as i32)
}

/// Splits a multi-value photo field, dropping blanks and repeats while keeping order.
pub fn split_photos(raw: &str, delimiter: PhotoDelimiter) -> Vec<String> {
    let parts: Vec<&str> = match delimiter {
        PhotoDelimiter::Pipe => raw.split('|').collect(),
        PhotoDelimiter::Manual => raw.split(['\n', '\r', ',', '|']).collect(),
    };
    dedupe(parts.into_iter().map(str::trim).filter(|p| !p.is_empty()))
}

pub fn dedupe<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for value in values {
        if seen.insert(value.to_string()) {
            out.push(value.to_string());
        }
    }
    out
}
