use crate::store::{RowSink, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use serde_with::skip_serializing_none;
use tracing::{debug, warn};

pub const AUDIT_TABLE: &str = "audit_log";

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub action: String,
    pub actor: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub detail: Value,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: &str, actor: &str, entity_type: &str) -> Self {
        Self {
            action: action.to_string(),
            actor: actor.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: None,
            detail: json!({}),
            at: Utc::now(),
        }
    }

    pub fn entity(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    pub fn detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Best-effort append. Failures are logged and never returned.
pub async fn append<S>(sink: &S, event: AuditEvent)
where
    S: RowSink + ?Sized,
{
    let row = match serde_json::to_value(&event) {
        Ok(row) => row,
        Err(err) => {
            warn!(target = "dealer_sync.audit", error = %err, "audit event not serializable");
            return;
        }
    };
    match sink.insert_row(AUDIT_TABLE, &row).await {
        Ok(()) => {}
        Err(StoreError::SchemaMissing { relation }) => debug!(
            target = "dealer_sync.audit",
            relation = %relation,
            action = %event.action,
            "audit table not provisioned; event dropped"
        ),
        Err(err) => warn!(
            target = "dealer_sync.audit",
            action = %event.action,
            error = %err,
            "audit append failed"
        ),
    }
}
