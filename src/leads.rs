use crate::{
    audit::{self, AuditEvent},
    store::{Store, StoreError, bounded},
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use serde_with::skip_serializing_none;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const LEADS_TABLE: &str = "leads";
const MAX_NAME: usize = 120;
const MAX_MESSAGE: usize = 2000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LeadRequest {
    pub dealer_id: String,
    pub listing_id: Option<String>,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub message: Option<String>,
    pub captcha_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum LeadError {
    #[error("{message}")]
    Invalid { code: &'static str, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LeadError {
    fn invalid(code: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            LeadError::Invalid { code, .. } => *code,
            LeadError::Store(err) => err.code(),
        }
    }
}

/// A lead that passed validation, with blank optionals dropped.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lead {
    pub dealer_id: String,
    pub listing_id: Option<String>,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeadReceipt {
    pub ok: bool,
    pub degraded: bool,
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn valid_phone(raw: &str) -> bool {
    let mut digits = 0;
    for c in raw.chars() {
        match c {
            '0'..='9' => digits += 1,
            '+' | '-' | '(' | ')' | ' ' => {}
            _ => return false,
        }
    }
    (7..=15).contains(&digits)
}

fn valid_email(raw: &str) -> bool {
    let Some((local, domain)) = raw.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !raw.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .is_some_and(|(host, rest)| !host.is_empty() && !rest.is_empty() && !rest.ends_with('.'))
}

pub fn validate(request: LeadRequest, now: DateTime<Utc>) -> Result<Lead, LeadError> {
    let dealer_id = request.dealer_id.trim().to_string();
    if dealer_id.is_empty() {
        return Err(LeadError::invalid("missing_dealer", "dealer_id is required"));
    }
    let name = request.name.trim().to_string();
    if name.is_empty() || name.chars().count() > MAX_NAME {
        return Err(LeadError::invalid(
            "invalid_name",
            format!("name must be 1-{MAX_NAME} characters"),
        ));
    }
    let phone = request.phone.trim().to_string();
    if !valid_phone(&phone) {
        return Err(LeadError::invalid(
            "invalid_phone",
            "phone must contain 7-15 digits",
        ));
    }
    let email = blank_to_none(request.email);
    if email.as_deref().is_some_and(|e| !valid_email(e)) {
        return Err(LeadError::invalid("invalid_email", "email is not valid"));
    }
    let message = blank_to_none(request.message);
    if message
        .as_deref()
        .is_some_and(|m| m.chars().count() > MAX_MESSAGE)
    {
        return Err(LeadError::invalid(
            "message_too_long",
            format!("message exceeds {MAX_MESSAGE} characters"),
        ));
    }
    Ok(Lead {
        dealer_id,
        listing_id: blank_to_none(request.listing_id),
        name,
        phone,
        email,
        message,
        created_at: now,
    })
}

fn minimal_row(lead: &Lead) -> Value {
    let mut row = Map::new();
    row.insert("dealer_id".into(), json!(lead.dealer_id));
    if let Some(listing_id) = &lead.listing_id {
        row.insert("listing_id".into(), json!(listing_id));
    }
    row.insert("name".into(), json!(lead.name));
    row.insert("phone".into(), json!(lead.phone));
    row.insert(
        "created_at".into(),
        json!(lead.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    Value::Object(row)
}

/// Validates and stores a lead. Falls back to the minimal column set when the
/// store reports an unknown column.
pub async fn submit<S>(
    store: &S,
    request: LeadRequest,
    timeout: Duration,
) -> Result<LeadReceipt, LeadError>
where
    S: Store + ?Sized,
{
    let lead = validate(request, Utc::now())?;
    let full = serde_json::to_value(&lead)
        .map_err(|err| StoreError::Invalid(err.to_string()))?;

    let degraded = match bounded(timeout, store.insert_row(LEADS_TABLE, &full)).await {
        Ok(()) => false,
        Err(StoreError::UnknownColumn { column }) => {
            warn!(
                target = "dealer_sync.leads",
                column = %column,
                "leads table is missing a column; storing minimal lead"
            );
            bounded(timeout, store.insert_row(LEADS_TABLE, &minimal_row(&lead))).await?;
            true
        }
        Err(err) => return Err(err.into()),
    };

    info!(
        target = "dealer_sync.leads",
        dealer_id = %lead.dealer_id,
        degraded,
        "lead stored"
    );
    audit::append(
        store,
        AuditEvent::new("lead.create", "public", "lead")
            .entity(&lead.dealer_id)
            .detail(json!({
                "listing_id": lead.listing_id,
                "degraded": degraded,
            })),
    )
    .await;
    Ok(LeadReceipt { ok: true, degraded })
}
