use crate::{
    audit::{self, AuditEvent},
    models::Listing,
    store::{Store, StoreError, bounded},
    text::{parse_message, rules::Field},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Photos may arrive as one delimited string or as a JSON array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PhotoInput {
    Text(String),
    List(Vec<String>),
}

impl PhotoInput {
    fn joined(&self) -> String {
        match self {
            PhotoInput::Text(text) => text.clone(),
            PhotoInput::List(items) => items.join("\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManualListingRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub photos: Option<PhotoInput>,
}

#[derive(Debug, Error)]
pub enum ManualError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("could not find both make and model in the message")]
    MissingMakeModel { found: Vec<Field> },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ManualError {
    pub fn code(&self) -> &'static str {
        match self {
            ManualError::EmptyMessage => "empty_message",
            ManualError::MissingMakeModel { .. } => "missing_make_model",
            ManualError::Store(err) => err.code(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualListingResponse {
    pub ok: bool,
    pub listing: Listing,
    pub found: Vec<Field>,
}

/// Parses a dealer's free-text post and stores it as a manual listing.
///
/// Manual listings carry no stock id and are inserted, never deduplicated.
pub async fn submit<S>(
    store: &S,
    dealer_id: &str,
    actor: &str,
    request: ManualListingRequest,
    timeout: Duration,
) -> Result<ManualListingResponse, ManualError>
where
    S: Store + ?Sized,
{
    if request.message.trim().is_empty() {
        return Err(ManualError::EmptyMessage);
    }
    let photos = request
        .photos
        .as_ref()
        .map(PhotoInput::joined)
        .unwrap_or_default();
    let parsed = parse_message(&request.message, &photos);
    let found: Vec<Field> = parsed.found.iter().copied().collect();
    if !parsed.has_make_and_model() {
        return Err(ManualError::MissingMakeModel { found });
    }

    let draft = parsed.into_draft(dealer_id);
    let listing = bounded(timeout, store.insert_listing(&draft)).await?;
    info!(
        target = "dealer_sync.manual",
        dealer_id,
        listing_id = %listing.id,
        fields = found.len(),
        "manual listing stored"
    );
    audit::append(
        store,
        AuditEvent::new("listing.create", actor, "listing")
            .entity(listing.id.to_string())
            .detail(json!({ "origin": "manual", "found": found })),
    )
    .await;
    Ok(ManualListingResponse {
        ok: true,
        listing,
        found,
    })
}
