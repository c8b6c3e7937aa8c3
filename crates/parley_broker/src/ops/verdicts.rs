//! submit_verdict and counter-patch accept/reject.

use crate::audit::record_event;
use crate::broker::Broker;
use crate::diff::Validation;
use crate::error::OpError;
use crate::ops::{fetch_review_tx, finalize_draining_if_idle, parse_status, seconds_between};
use crate::state_machine::validate_transition;
use crate::store::now_iso;
use parley_protocol::{AuditEventType, CounterPatchStatus, ReviewStatus, Verdict};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct SubmitVerdictParams {
    pub review_id: String,
    pub verdict: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub reviewer_id: Option<String>,
    #[serde(default)]
    pub claim_generation: Option<i64>,
    #[serde(default)]
    pub counter_patch: Option<String>,
}

/// Submit a verdict on a review.
///
/// `approved` and `changes_requested` transition state; `comment` only
/// updates the stored reason. While the review is claimed the caller must
/// prove ownership with `reviewer_id`, the `claim_generation` fencing
/// token, or both.
pub async fn submit_verdict(
    broker: &Arc<Broker>,
    params: SubmitVerdictParams,
) -> Result<Value, OpError> {
    const OP: &str = "submit_verdict";

    let verdict: Verdict = params.verdict.parse().map_err(|_| {
        OpError::InvalidInput(format!(
            "Invalid verdict: {:?}. Must be 'approved', 'changes_requested', or 'comment'.",
            params.verdict
        ))
    })?;

    if matches!(verdict, Verdict::ChangesRequested | Verdict::Comment)
        && params
            .reason
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .is_empty()
    {
        return Err(OpError::InvalidInput(format!(
            "A non-empty reason is required for verdict {:?}",
            verdict.as_str()
        )));
    }

    if params.counter_patch.is_some() && verdict == Verdict::Approved {
        return Err(OpError::InvalidInput(
            "counter_patch is only allowed with verdict 'changes_requested' or 'comment'"
                .to_string(),
        ));
    }

    // Validate the counter-patch before opening the transaction; a patch
    // that does not apply never reaches the store.
    let counter_patch_files = match params.counter_patch.as_deref() {
        Some(patch) => {
            if let Validation::Failed(reason) = broker
                .validator
                .validate(patch, broker.repo_root.as_deref())
                .await
            {
                return Err(OpError::InvalidCounterPatch(reason));
            }
            let files = broker.validator.extract_affected_files(patch);
            Some(serde_json::to_string(&files).map_err(|e| OpError::internal(OP, e.to_string()))?)
        }
        None => None,
    };

    let mut tx = broker.store.begin_write().await.map_err(|e| OpError::store(OP, e))?;
    let row = match fetch_review_tx(&mut tx, OP, &params.review_id).await? {
        Some(row) => row,
        None => {
            tx.rollback_quietly().await;
            return Err(OpError::ReviewNotFound(params.review_id));
        }
    };
    let current = parse_status(&row, OP)?;

    // Fencing: a claimed review only accepts verdicts from its owner.
    if current == ReviewStatus::Claimed {
        if params.reviewer_id.is_none() && params.claim_generation.is_none() {
            tx.rollback_quietly().await;
            return Err(OpError::InvalidInput(
                "Claimed reviews require reviewer_id or claim_generation for verdict submission"
                    .to_string(),
            ));
        }
        if let Some(generation) = params.claim_generation {
            if generation != row.claim_generation {
                tx.rollback_quietly().await;
                return Err(OpError::StaleClaim {
                    provided: generation,
                    current: row.claim_generation,
                });
            }
        }
        if let Some(reviewer_id) = params.reviewer_id.as_deref() {
            if row.claimed_by.as_deref() != Some(reviewer_id) {
                tx.rollback_quietly().await;
                return Err(OpError::Unauthorized {
                    claimed_by: row.claimed_by.clone().unwrap_or_default(),
                    reviewer_id: reviewer_id.to_string(),
                });
            }
        }
    }

    let has_counter_patch = counter_patch_files.is_some();
    let actor = params
        .reviewer_id
        .clone()
        .or_else(|| row.claimed_by.clone());

    let new_status = match verdict {
        Verdict::Approved => Some(ReviewStatus::Approved),
        Verdict::ChangesRequested => Some(ReviewStatus::ChangesRequested),
        Verdict::Comment => None,
    };
    if let Some(target) = new_status {
        if let Err(err) = validate_transition(current, target) {
            tx.rollback_quietly().await;
            return Err(err);
        }
    }

    let result: Result<(), sqlx::Error> = async {
        match new_status {
            Some(target) => {
                sqlx::query(
                    "UPDATE reviews
                     SET status = ?,
                         verdict_reason = ?,
                         counter_patch = COALESCE(?, counter_patch),
                         counter_patch_affected_files = COALESCE(?, counter_patch_affected_files),
                         counter_patch_status = CASE WHEN ? THEN 'pending'
                                                     ELSE counter_patch_status END,
                         updated_at = ?
                     WHERE id = ?",
                )
                .bind(target.as_str())
                .bind(&params.reason)
                .bind(&params.counter_patch)
                .bind(&counter_patch_files)
                .bind(has_counter_patch)
                .bind(now_iso())
                .bind(&params.review_id)
                .execute(tx.conn())
                .await?;
                record_event(
                    &mut tx,
                    Some(&params.review_id),
                    AuditEventType::VerdictSubmitted,
                    actor.as_deref(),
                    Some(current.as_str()),
                    Some(target.as_str()),
                    Some(json!({
                        "verdict": verdict.as_str(),
                        "reason": &params.reason,
                        "has_counter_patch": has_counter_patch,
                    })),
                )
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE reviews
                     SET verdict_reason = ?,
                         counter_patch = COALESCE(?, counter_patch),
                         counter_patch_affected_files = COALESCE(?, counter_patch_affected_files),
                         counter_patch_status = CASE WHEN ? THEN 'pending'
                                                     ELSE counter_patch_status END,
                         updated_at = ?
                     WHERE id = ?",
                )
                .bind(&params.reason)
                .bind(&params.counter_patch)
                .bind(&counter_patch_files)
                .bind(has_counter_patch)
                .bind(now_iso())
                .bind(&params.review_id)
                .execute(tx.conn())
                .await?;
                record_event(
                    &mut tx,
                    Some(&params.review_id),
                    AuditEventType::VerdictComment,
                    actor.as_deref(),
                    None,
                    None,
                    Some(json!({
                        "reason": &params.reason,
                        "has_counter_patch": has_counter_patch,
                    })),
                )
                .await?;
            }
        }
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

    let status_after = new_status.unwrap_or(current);
    info!(
        review_id = %params.review_id,
        verdict = verdict.as_str(),
        status = status_after.as_str(),
        "verdict submitted"
    );

    // Terminal verdicts feed the reviewer's performance counters.
    if new_status.is_some() {
        if let (Some(pool), Some(reviewer_id)) = (broker.pool.as_ref(), row.claimed_by.as_deref())
        {
            let duration = row
                .claimed_at
                .as_deref()
                .and_then(|claimed_at| seconds_between(claimed_at, &now_iso()))
                .unwrap_or(0.0)
                .max(0.0);
            pool.update_reviewer_stats(reviewer_id, &broker.store, verdict.as_str(), duration)
                .await;
        }
    }

    broker.bus.notify(&params.review_id);
    if new_status.is_some() {
        if let Some(reviewer_id) = row.claimed_by.as_deref() {
            finalize_draining_if_idle(broker, reviewer_id).await;
        }
    }

    Ok(json!({
        "review_id": params.review_id,
        "status": status_after.as_str(),
        "verdict_reason": params.reason,
        "has_counter_patch": has_counter_patch,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CounterPatchParams {
    pub review_id: String,
}

/// Accept a pending counter-patch: it becomes the review's diff.
pub async fn accept_counter_patch(
    broker: &Arc<Broker>,
    params: CounterPatchParams,
) -> Result<Value, OpError> {
    const OP: &str = "accept_counter_patch";

    let mut tx = broker.store.begin_write().await.map_err(|e| OpError::store(OP, e))?;
    let row = match fetch_review_tx(&mut tx, OP, &params.review_id).await? {
        Some(row) => row,
        None => {
            tx.rollback_quietly().await;
            return Err(OpError::ReviewNotFound(params.review_id));
        }
    };

    let patch = match (row.counter_patch_status.as_deref(), row.counter_patch.as_deref()) {
        (Some("pending"), Some(patch)) => patch.to_string(),
        _ => {
            tx.rollback_quietly().await;
            return Err(OpError::InvalidInput(format!(
                "No pending counter-patch for review {}",
                params.review_id
            )));
        }
    };

    // Re-validate: the tree may have moved since the reviewer offered it.
    // Failure leaves all review state untouched.
    if let Validation::Failed(reason) = broker
        .validator
        .validate(&patch, broker.repo_root.as_deref())
        .await
    {
        tx.rollback_quietly().await;
        return Err(OpError::StaleCounterPatch(reason));
    }

    let result: Result<(), sqlx::Error> = async {
        sqlx::query(
            "UPDATE reviews
             SET diff = counter_patch,
                 affected_files = counter_patch_affected_files,
                 counter_patch = NULL,
                 counter_patch_affected_files = NULL,
                 counter_patch_status = 'accepted',
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(now_iso())
        .bind(&params.review_id)
        .execute(tx.conn())
        .await?;
        record_event(
            &mut tx,
            Some(&params.review_id),
            AuditEventType::CounterPatchAccepted,
            None,
            None,
            None,
            None,
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

    info!(review_id = %params.review_id, "counter-patch accepted");
    broker.bus.notify(&params.review_id);
    Ok(json!({
        "review_id": params.review_id,
        "counter_patch_status": CounterPatchStatus::Accepted.as_str(),
    }))
}

/// Reject a pending counter-patch, discarding it.
pub async fn reject_counter_patch(
    broker: &Arc<Broker>,
    params: CounterPatchParams,
) -> Result<Value, OpError> {
    const OP: &str = "reject_counter_patch";

    let mut tx = broker.store.begin_write().await.map_err(|e| OpError::store(OP, e))?;
    let row = match fetch_review_tx(&mut tx, OP, &params.review_id).await? {
        Some(row) => row,
        None => {
            tx.rollback_quietly().await;
            return Err(OpError::ReviewNotFound(params.review_id));
        }
    };

    if row.counter_patch_status.as_deref() != Some("pending") {
        tx.rollback_quietly().await;
        return Err(OpError::InvalidInput(format!(
            "No pending counter-patch for review {}",
            params.review_id
        )));
    }

    let result: Result<(), sqlx::Error> = async {
        sqlx::query(
            "UPDATE reviews
             SET counter_patch = NULL,
                 counter_patch_affected_files = NULL,
                 counter_patch_status = 'rejected',
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(now_iso())
        .bind(&params.review_id)
        .execute(tx.conn())
        .await?;
        record_event(
            &mut tx,
            Some(&params.review_id),
            AuditEventType::CounterPatchRejected,
            None,
            None,
            None,
            None,
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

    info!(review_id = %params.review_id, "counter-patch rejected");
    broker.bus.notify(&params.review_id);
    Ok(json!({
        "review_id": params.review_id,
        "counter_patch_status": CounterPatchStatus::Rejected.as_str(),
    }))
}
