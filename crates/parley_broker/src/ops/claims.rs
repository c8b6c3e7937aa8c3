//! claim_review: reservation handling, fenced claim, and diff auto-reject.

use crate::audit::record_event;
use crate::broker::Broker;
use crate::diff::Validation;
use crate::error::OpError;
use crate::ops::{affected_files_value, fetch_review_tx, parse_status};
use crate::state_machine::validate_transition;
use crate::store::now_iso;
use parley_protocol::{AuditEventType, ReviewStatus};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

/// Synthetic actor recorded when a claim is auto-rejected by validation.
pub const VALIDATOR_ACTOR: &str = "broker-validator";

#[derive(Debug, Deserialize)]
pub struct ClaimReviewParams {
    pub review_id: String,
    pub reviewer_id: String,
}

/// Claim a pending review for evaluation.
///
/// The response's `claim_generation` is a fencing token the reviewer must
/// echo back on submit_verdict; a reclaim bumps it and fences out the old
/// claim.
pub async fn claim_review(
    broker: &Arc<Broker>,
    params: ClaimReviewParams,
) -> Result<Value, OpError> {
    const OP: &str = "claim_review";
    let ClaimReviewParams {
        review_id,
        reviewer_id,
    } = params;

    // A draining or terminated reviewer may not take on new work. Unknown
    // reviewer ids are allowed (human reviewers have no pool row).
    let reviewer_status: Option<String> =
        sqlx::query_scalar("SELECT status FROM reviewers WHERE id = ?")
            .bind(&reviewer_id)
            .fetch_optional(broker.store.pool())
            .await
            .map_err(|e| OpError::store(OP, e))?;
    if let Some(status) = reviewer_status.as_deref() {
        if status == "draining" || status == "terminated" {
            return Err(OpError::Forbidden(format!(
                "Reviewer {reviewer_id} is {status} and cannot claim new reviews"
            )));
        }
    }

    let mut tx = broker.store.begin_write().await.map_err(|e| OpError::store(OP, e))?;
    let row = match fetch_review_tx(&mut tx, OP, &review_id).await? {
        Some(row) => row,
        None => {
            tx.rollback_quietly().await;
            return Err(OpError::ReviewNotFound(review_id));
        }
    };
    let current = parse_status(&row, OP)?;

    // Reservation handling: a pending review may retain claimed_by as a
    // soft reservation after a proposer follow-up. Enforce it only while
    // the reserved worker is still live under this session; otherwise the
    // stale reservation clears silently.
    if current == ReviewStatus::Pending {
        if let Some(reserved_for) = row.claimed_by.as_deref() {
            if reserved_for != reviewer_id {
                let reserved_alive = match broker.pool.as_ref() {
                    Some(pool) => pool.process_alive(reserved_for).await,
                    None => false,
                };
                if reserved_alive {
                    tx.rollback_quietly().await;
                    return Err(OpError::ReservedForReviewer {
                        review_id,
                        reviewer_id: reserved_for.to_string(),
                    });
                }
            }
        }
    }

    if let Err(err) = validate_transition(current, ReviewStatus::Claimed) {
        tx.rollback_quietly().await;
        return Err(err);
    }

    // Diff validation gate. A failing diff auto-rejects the review
    // instead of handing a reviewer un-appliable work.
    if let (Some(diff), false) = (row.diff.as_deref(), row.skip_diff_validation) {
        if let Validation::Failed(reason) = broker
            .validator
            .validate(diff, broker.repo_root.as_deref())
            .await
        {
            let result: Result<(), sqlx::Error> = async {
                sqlx::query(
                    "UPDATE reviews
                     SET status = 'changes_requested',
                         verdict_reason = ?,
                         claimed_by = ?,
                         updated_at = ?
                     WHERE id = ?",
                )
                .bind(format!("Auto-rejected: {reason}"))
                .bind(VALIDATOR_ACTOR)
                .bind(now_iso())
                .bind(&review_id)
                .execute(tx.conn())
                .await?;
                record_event(
                    &mut tx,
                    Some(&review_id),
                    AuditEventType::ReviewAutoRejected,
                    Some(VALIDATOR_ACTOR),
                    Some(current.as_str()),
                    Some(ReviewStatus::ChangesRequested.as_str()),
                    Some(json!({ "validation_error": &reason, "attempted_by": &reviewer_id })),
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

            info!(review_id = %review_id, "claim auto-rejected by diff validation");
            broker.bus.notify(&review_id);
            return Ok(json!({
                "review_id": review_id,
                "status": "changes_requested",
                "auto_rejected": true,
                "validation_error": reason,
                "category": row.category,
            }));
        }
    }

    let new_generation = row.claim_generation + 1;
    let result: Result<(), sqlx::Error> = async {
        sqlx::query(
            "UPDATE reviews
             SET status = 'claimed',
                 claimed_by = ?,
                 claimed_at = ?,
                 claim_generation = ?,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(&reviewer_id)
        .bind(now_iso())
        .bind(new_generation)
        .bind(now_iso())
        .bind(&review_id)
        .execute(tx.conn())
        .await?;
        record_event(
            &mut tx,
            Some(&review_id),
            AuditEventType::ReviewClaimed,
            Some(&reviewer_id),
            Some(current.as_str()),
            Some(ReviewStatus::Claimed.as_str()),
            Some(json!({ "claim_generation": new_generation })),
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
        review_id = %review_id,
        reviewer_id = %reviewer_id,
        generation = new_generation,
        "review claimed"
    );
    broker.bus.notify(&review_id);

    Ok(json!({
        "review_id": review_id,
        "status": "claimed",
        "claimed_by": reviewer_id,
        "claim_generation": new_generation,
        "intent": row.intent,
        "description": row.description,
        "category": row.category,
        "has_diff": row.diff.is_some(),
        "affected_files": affected_files_value(row.affected_files.as_deref()),
    }))
}
