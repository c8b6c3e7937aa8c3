//! Append-only audit event recording.

use crate::store::{now_iso, WriteTx};
use parley_protocol::AuditEventType;
use serde_json::Value;

/// Record an audit event within the caller's open transaction.
///
/// Must be called INSIDE an existing BEGIN IMMEDIATE...COMMIT block; the
/// caller owns transaction management.
pub async fn record_event(
    tx: &mut WriteTx<'_>,
    review_id: Option<&str>,
    event_type: AuditEventType,
    actor: Option<&str>,
    old_status: Option<&str>,
    new_status: Option<&str>,
    metadata: Option<Value>,
) -> Result<(), sqlx::Error> {
    let metadata_json = metadata.map(|m| m.to_string());
    sqlx::query(
        "INSERT INTO audit_events
            (review_id, event_type, actor, old_status, new_status, metadata, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(review_id)
    .bind(event_type.as_str())
    .bind(actor)
    .bind(old_status)
    .bind(new_status)
    .bind(metadata_json)
    .bind(now_iso())
    .execute(tx.conn())
    .await?;
    Ok(())
}
