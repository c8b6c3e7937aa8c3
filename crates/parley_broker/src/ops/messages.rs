//! add_message: threaded discussion with turn alternation and the
//! proposer follow-up requeue.

use crate::audit::record_event;
use crate::broker::Broker;
use crate::error::OpError;
use crate::notify::QUEUE_TOPIC;
use crate::ops::{fetch_review_tx, parse_status, schedule_reactive_scale};
use crate::store::now_iso;
use parley_protocol::{AuditEventType, ReviewStatus};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct AddMessageParams {
    pub review_id: String,
    pub sender_role: String,
    pub body: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Append a message to a review's discussion.
///
/// Consecutive messages must alternate sender_role. A proposer message on
/// a `changes_requested` review requeues it to `pending`, leaving
/// `claimed_by` in place as a soft reservation so the original reviewer
/// can pick the thread back up.
pub async fn add_message(
    broker: &Arc<Broker>,
    params: AddMessageParams,
) -> Result<Value, OpError> {
    const OP: &str = "add_message";

    if params.sender_role != "proposer" && params.sender_role != "reviewer" {
        return Err(OpError::InvalidInput(format!(
            "Invalid sender_role: {:?}. Must be 'proposer' or 'reviewer'.",
            params.sender_role
        )));
    }

    let mut tx = broker.store.begin_write().await.map_err(|e| OpError::store(OP, e))?;
    let row = match fetch_review_tx(&mut tx, OP, &params.review_id).await? {
        Some(row) => row,
        None => {
            tx.rollback_quietly().await;
            return Err(OpError::ReviewNotFound(params.review_id));
        }
    };
    let current = parse_status(&row, OP)?;

    if !matches!(
        current,
        ReviewStatus::Claimed | ReviewStatus::ChangesRequested | ReviewStatus::Approved
    ) {
        tx.rollback_quietly().await;
        return Err(OpError::NotAllowedInState {
            status: current.as_str().to_string(),
        });
    }

    let last_sender: Option<String> = sqlx::query_scalar(
        "SELECT sender_role FROM messages
         WHERE review_id = ?
         ORDER BY created_at DESC, id DESC
         LIMIT 1",
    )
    .bind(&params.review_id)
    .fetch_optional(tx.conn())
    .await
    .map_err(|e| OpError::store(OP, e))?;
    if last_sender.as_deref() == Some(params.sender_role.as_str()) {
        tx.rollback_quietly().await;
        return Err(OpError::TurnViolation {
            last_sender: params.sender_role,
        });
    }

    let message_id = Uuid::new_v4().to_string();
    let round = row.current_round;
    let requeue = params.sender_role == "proposer" && current == ReviewStatus::ChangesRequested;

    let result: Result<(), sqlx::Error> = async {
        sqlx::query(
            "INSERT INTO messages (id, review_id, sender_role, round, body, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message_id)
        .bind(&params.review_id)
        .bind(&params.sender_role)
        .bind(round)
        .bind(&params.body)
        .bind(params.metadata.as_ref().map(|m| m.to_string()))
        .bind(now_iso())
        .execute(tx.conn())
        .await?;

        if requeue {
            // Soft reservation: claimed_by survives the requeue so the
            // original reviewer can resume with context.
            sqlx::query(
                "UPDATE reviews
                 SET status = 'pending', claimed_at = NULL, updated_at = ?
                 WHERE id = ?",
            )
            .bind(now_iso())
            .bind(&params.review_id)
            .execute(tx.conn())
            .await?;
        } else {
            sqlx::query("UPDATE reviews SET updated_at = ? WHERE id = ?")
                .bind(now_iso())
                .bind(&params.review_id)
                .execute(tx.conn())
                .await?;
        }

        record_event(
            &mut tx,
            Some(&params.review_id),
            AuditEventType::MessageSent,
            Some(&params.sender_role),
            requeue.then(|| current.as_str()),
            requeue.then(|| ReviewStatus::Pending.as_str()),
            Some(json!({ "round": round, "requeued": requeue })),
        )
        .await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => tx.commit().await.map_err(|e| OpError::store(OP, e))?,
        Err(err) => {
            tx.rollback_quietly().await;
            return Err(OpError::store(OP, err));
        }
    }

    info!(
        review_id = %params.review_id,
        sender = %params.sender_role,
        requeue,
        "message appended"
    );
    broker.bus.notify(&params.review_id);
    if requeue {
        broker.bus.notify(QUEUE_TOPIC);
        schedule_reactive_scale(broker, "requeue");
    }

    Ok(json!({
        "message_id": message_id,
        "review_id": params.review_id,
        "round": round,
    }))
}
