use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ListingOrigin {
    #[default]
    Manual,
    DealerFeed,
}

impl ListingOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingOrigin::Manual => "manual",
            ListingOrigin::DealerFeed => "dealer_feed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    #[default]
    Available,
    Sold,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Available => "available",
            ListingStatus::Sold => "sold",
        }
    }

    /// Anything other than an explicit `sold` is treated as available.
    pub fn coerce(input: &str) -> Self {
        match input.trim().to_ascii_lowercase().as_str() {
            "sold" => ListingStatus::Sold,
            _ => ListingStatus::Available,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    New,
    #[default]
    Used,
}

impl VehicleType {
    pub fn coerce(input: &str) -> Self {
        match input.trim().to_ascii_lowercase().as_str() {
            "new" | "brand new" | "brand_new" => VehicleType::New,
            _ => VehicleType::Used,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Csv,
    Sitemap,
    Page,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Csv => "csv",
            SourceKind::Sitemap => "sitemap",
            SourceKind::Page => "page",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncMode {
    #[default]
    Auto,
    Only(SourceKind),
}

impl SyncMode {
    pub fn parse(input: Option<&str>) -> Option<Self> {
        let raw = input.map(str::trim).unwrap_or("");
        match raw.to_ascii_lowercase().as_str() {
            "" | "auto" => Some(SyncMode::Auto),
            "csv" | "feed" => Some(SyncMode::Only(SourceKind::Csv)),
            "sitemap" => Some(SyncMode::Only(SourceKind::Sitemap)),
            "page" | "scrape" | "inventory" => Some(SyncMode::Only(SourceKind::Page)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Auto => "auto",
            SyncMode::Only(kind) => kind.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    pub url: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Dealer {
    pub id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub city: Option<String>,
    pub feed_url: Option<String>,
    pub inventory_url: Option<String>,
    pub sitemap_url: Option<String>,
}

impl Dealer {
    /// Source descriptors in sync priority order. Blank URLs are ignored.
    pub fn sources(&self) -> Vec<SourceDescriptor> {
        [
            (SourceKind::Csv, &self.feed_url),
            (SourceKind::Sitemap, &self.sitemap_url),
            (SourceKind::Page, &self.inventory_url),
        ]
        .into_iter()
        .filter_map(|(kind, url)| {
            url.as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(|u| SourceDescriptor {
                    kind,
                    url: u.to_string(),
                })
        })
        .collect()
    }

    pub fn source_for(&self, mode: SyncMode) -> Option<SourceDescriptor> {
        let sources = self.sources();
        match mode {
            SyncMode::Auto => sources.into_iter().next(),
            SyncMode::Only(kind) => sources.into_iter().find(|s| s.kind == kind),
        }
    }
}

/// Canonical listing shape before it is persisted.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ListingDraft {
    pub dealer_id: String,
    pub origin: ListingOrigin,
    pub stock_id: Option<String>,
    #[serde(rename = "type")]
    pub vehicle_type: VehicleType,
    pub make: Option<String>,
    pub model: Option<String>,
    pub variant: Option<String>,
    pub year: Option<i32>,
    pub km: Option<i64>,
    pub fuel: Option<String>,
    pub transmission: Option<String>,
    pub price: Option<i64>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub photos: Vec<String>,
    pub status: ListingStatus,
}

impl ListingDraft {
    /// Natural key for feed-origin rows; `None` when the row cannot be reconciled.
    pub fn natural_key(&self) -> Option<(&str, &str)> {
        self.stock_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|stock| (self.dealer_id.as_str(), stock))
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    pub id: Uuid,
    #[serde(flatten)]
    pub draft: ListingDraft,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ApiError {
    pub fn new(code: &str, detail: impl Into<String>) -> Self {
        Self {
            error: code.to_string(),
            detail: Some(detail.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dealer() -> Dealer {
        Dealer {
            id: "d-1".into(),
            name: Some("Ace Motors".into()),
            feed_url: Some("  ".into()),
            sitemap_url: Some("https://ace.example/sitemap.xml".into()),
            inventory_url: Some("https://ace.example/stock".into()),
            ..Default::default()
        }
    }

    #[test]
    fn sources_skip_blank_urls_and_keep_priority() {
        let kinds: Vec<SourceKind> = dealer().sources().into_iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![SourceKind::Sitemap, SourceKind::Page]);
    }

    #[test]
    fn source_for_mode() {
        let d = dealer();
        assert_eq!(
            d.source_for(SyncMode::Auto).map(|s| s.kind),
            Some(SourceKind::Sitemap)
        );
        assert!(d.source_for(SyncMode::Only(SourceKind::Csv)).is_none());
    }

    #[test]
    fn sync_mode_tokens() {
        assert_eq!(SyncMode::parse(None), Some(SyncMode::Auto));
        assert_eq!(
            SyncMode::parse(Some("Feed")),
            Some(SyncMode::Only(SourceKind::Csv))
        );
        assert_eq!(SyncMode::parse(Some("bogus")), None);
    }

    #[test]
    fn listing_serializes_flat_with_type_key() {
        let now = Utc::now();
        let listing = Listing {
            id: Uuid::new_v4(),
            draft: ListingDraft {
                dealer_id: "d-1".into(),
                origin: ListingOrigin::DealerFeed,
                stock_id: Some("S1".into()),
                make: Some("Honda".into()),
                ..Default::default()
            },
            last_seen_at: Some(now),
            created_at: now,
            updated_at: now,
        };
        let value = serde_json::to_value(&listing).unwrap();
        assert_eq!(value["type"], "used");
        assert_eq!(value["origin"], "dealer_feed");
        assert_eq!(value["status"], "available");
        assert!(value.get("model").is_none());
        let back: Listing = serde_json::from_value(value).unwrap();
        assert_eq!(back, listing);
    }
}
