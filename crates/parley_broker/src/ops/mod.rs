//! Review operations: the mutating half of the broker contract.
//!
//! Every operation runs its writes inside one `BEGIN IMMEDIATE` block
//! behind the store's write token, records its audit events in the same
//! transaction, and fires notifications only after commit.

pub mod claims;
pub mod messages;
pub mod reviews;
pub mod scaling;
pub mod verdicts;

use crate::broker::Broker;
use crate::error::OpError;
use crate::store::{ReviewRow, WriteTx};
use parley_protocol::ReviewStatus;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Fetch a review inside an open write transaction.
pub(crate) async fn fetch_review_tx(
    tx: &mut WriteTx<'_>,
    operation: &'static str,
    review_id: &str,
) -> Result<Option<ReviewRow>, OpError> {
    sqlx::query_as::<_, ReviewRow>("SELECT * FROM reviews WHERE id = ?")
        .bind(review_id)
        .fetch_optional(tx.conn())
        .await
        .map_err(|e| OpError::store(operation, e))
}

/// Read-side review fetch.
pub(crate) async fn fetch_review(
    broker: &Broker,
    operation: &'static str,
    review_id: &str,
) -> Result<Option<ReviewRow>, OpError> {
    sqlx::query_as::<_, ReviewRow>("SELECT * FROM reviews WHERE id = ?")
        .bind(review_id)
        .fetch_optional(broker.store.pool())
        .await
        .map_err(|e| OpError::store(operation, e))
}

pub(crate) fn parse_status(
    row: &ReviewRow,
    operation: &'static str,
) -> Result<ReviewStatus, OpError> {
    row.status
        .parse::<ReviewStatus>()
        .map_err(|e| OpError::internal(operation, e.to_string()))
}

/// Decode a stored affected-files JSON column into a document value.
pub(crate) fn affected_files_value(stored: Option<&str>) -> Value {
    match stored {
        Some(raw) => serde_json::from_str(raw).unwrap_or(Value::Null),
        None => Value::Null,
    }
}

/// Seconds between two broker timestamps, or None when either fails to
/// parse.
pub(crate) fn seconds_between(earlier: &str, later: &str) -> Option<f64> {
    let earlier = chrono::DateTime::parse_from_rfc3339(earlier).ok()?;
    let later = chrono::DateTime::parse_from_rfc3339(later).ok()?;
    Some((later - earlier).num_milliseconds() as f64 / 1000.0)
}

/// Finalize a draining reviewer once its last open review is resolved.
///
/// Called after verdicts, closes, revises, reclaims, and detaches. A
/// reviewer counts as busy while any of its reviews is not yet closed.
pub(crate) async fn finalize_draining_if_idle(broker: &Broker, reviewer_id: &str) {
    let Some(pool) = broker.pool.as_ref() else {
        return;
    };

    let status: Option<String> =
        match sqlx::query_scalar("SELECT status FROM reviewers WHERE id = ?")
            .bind(reviewer_id)
            .fetch_optional(broker.store.pool())
            .await
        {
            Ok(status) => status,
            Err(err) => {
                warn!(reviewer_id, %err, "drain finalization check failed");
                return;
            }
        };
    if status.as_deref() != Some("draining") {
        return;
    }

    let open: i64 = match sqlx::query_scalar(
        "SELECT COUNT(*) FROM reviews WHERE claimed_by = ? AND status != 'closed'",
    )
    .bind(reviewer_id)
    .fetch_one(broker.store.pool())
    .await
    {
        Ok(open) => open,
        Err(err) => {
            warn!(reviewer_id, %err, "drain finalization count failed");
            return;
        }
    };
    if open == 0 {
        pool.terminate_reviewer(reviewer_id, &broker.store).await;
    }
}

/// Kick off a best-effort reactive scaling pass in the background.
pub(crate) fn schedule_reactive_scale(broker: &Arc<Broker>, source: &'static str) {
    if broker.pool.is_none() {
        return;
    }
    let broker = Arc::clone(broker);
    tokio::spawn(async move {
        scaling::reactive_scale_check(&broker, source).await;
    });
}
