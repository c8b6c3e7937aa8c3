//! create_review (create + revise), close_review, and the internal
//! reclaim_review.

use crate::audit::record_event;
use crate::broker::Broker;
use crate::diff::Validation;
use crate::error::OpError;
use crate::notify::QUEUE_TOPIC;
use crate::ops::{
    fetch_review_tx, finalize_draining_if_idle, parse_status, schedule_reactive_scale,
};
use crate::priority::infer_priority;
use crate::state_machine::validate_transition;
use crate::store::now_iso;
use parley_protocol::{AgentIdentity, AuditEventType, ReviewStatus};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateReviewParams {
    pub intent: String,
    #[serde(flatten)]
    pub agent: AgentIdentity,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub diff: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub skip_diff_validation: bool,
    /// Present in revise mode.
    #[serde(default)]
    pub review_id: Option<String>,
}

/// Create a new review, or revise an existing `changes_requested` one.
pub async fn create_review(
    broker: &Arc<Broker>,
    params: CreateReviewParams,
) -> Result<Value, OpError> {
    const OP: &str = "create_review";

    // Validate the diff up front; parse affected files regardless of the
    // validation outcome (parse failure is never fatal).
    let affected_files_json = match params.diff.as_deref() {
        Some(diff) => {
            if !params.skip_diff_validation {
                if let Validation::Failed(reason) = broker
                    .validator
                    .validate(diff, broker.repo_root.as_deref())
                    .await
                {
                    return Err(OpError::InvalidDiff(reason));
                }
            }
            let files = broker.validator.extract_affected_files(diff);
            Some(serde_json::to_string(&files).map_err(|e| OpError::internal(OP, e.to_string()))?)
        }
        None => None,
    };

    match params.review_id.clone() {
        Some(review_id) => revise_review(broker, params, review_id, affected_files_json).await,
        None => insert_review(broker, params, affected_files_json).await,
    }
}

async fn insert_review(
    broker: &Arc<Broker>,
    params: CreateReviewParams,
    affected_files_json: Option<String>,
) -> Result<Value, OpError> {
    const OP: &str = "create_review";
    let review_id = Uuid::new_v4().to_string();
    let priority = infer_priority(&params.agent.agent_type, &params.agent.phase);
    let now = now_iso();

    let mut tx = broker.store.begin_write().await.map_err(|e| OpError::store(OP, e))?;
    let result: Result<(), sqlx::Error> = async {
        sqlx::query(
            "INSERT INTO reviews (
                 id, status, intent, description, diff, affected_files,
                 agent_type, agent_role, phase, plan, task, project,
                 priority, category, skip_diff_validation,
                 created_at, updated_at
             ) VALUES (?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&review_id)
        .bind(&params.intent)
        .bind(&params.description)
        .bind(&params.diff)
        .bind(&affected_files_json)
        .bind(&params.agent.agent_type)
        .bind(&params.agent.agent_role)
        .bind(&params.agent.phase)
        .bind(&params.agent.plan)
        .bind(&params.agent.task)
        .bind(&params.agent.project)
        .bind(priority.as_str())
        .bind(&params.category)
        .bind(params.skip_diff_validation)
        .bind(&now)
        .bind(&now)
        .execute(tx.conn())
        .await?;
        record_event(
            &mut tx,
            Some(&review_id),
            AuditEventType::ReviewCreated,
            Some(&params.agent.agent_type),
            None,
            Some(ReviewStatus::Pending.as_str()),
            Some(json!({ "intent": &params.intent, "category": &params.category })),
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

    info!(review_id = %review_id, priority = %priority, "review created");
    broker.bus.notify(&review_id);
    broker.bus.notify(QUEUE_TOPIC);
    schedule_reactive_scale(broker, "create");

    Ok(json!({ "review_id": review_id, "status": "pending" }))
}

async fn revise_review(
    broker: &Arc<Broker>,
    params: CreateReviewParams,
    review_id: String,
    affected_files_json: Option<String>,
) -> Result<Value, OpError> {
    const OP: &str = "create_review";

    let mut tx = broker.store.begin_write().await.map_err(|e| OpError::store(OP, e))?;
    let row = match fetch_review_tx(&mut tx, OP, &review_id).await? {
        Some(row) => row,
        None => {
            tx.rollback_quietly().await;
            return Err(OpError::ReviewNotFound(review_id));
        }
    };
    let current = parse_status(&row, OP)?;
    if current != ReviewStatus::ChangesRequested {
        tx.rollback_quietly().await;
        return Err(OpError::InvalidTransition {
            from: current.as_str().to_string(),
            to: ReviewStatus::Pending.as_str().to_string(),
        });
    }

    let former_reviewer = row.claimed_by.clone();
    let new_round = row.current_round + 1;

    let result: Result<(), sqlx::Error> = async {
        sqlx::query(
            "UPDATE reviews
             SET status = 'pending',
                 intent = ?,
                 description = ?,
                 diff = ?,
                 affected_files = ?,
                 skip_diff_validation = ?,
                 current_round = ?,
                 counter_patch = NULL,
                 counter_patch_affected_files = NULL,
                 counter_patch_status = NULL,
                 claimed_by = NULL,
                 claimed_at = NULL,
                 verdict_reason = NULL,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(&params.intent)
        .bind(&params.description)
        .bind(&params.diff)
        .bind(&affected_files_json)
        .bind(params.skip_diff_validation)
        .bind(new_round)
        .bind(now_iso())
        .bind(&review_id)
        .execute(tx.conn())
        .await?;
        record_event(
            &mut tx,
            Some(&review_id),
            AuditEventType::ReviewRevised,
            Some(&params.agent.agent_type),
            Some(ReviewStatus::ChangesRequested.as_str()),
            Some(ReviewStatus::Pending.as_str()),
            Some(json!({
                "intent": &params.intent,
                "category": &params.category,
                "round": new_round,
            })),
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

    info!(review_id = %review_id, round = new_round, "review revised");
    if let Some(reviewer_id) = former_reviewer.as_deref() {
        finalize_draining_if_idle(broker, reviewer_id).await;
    }
    broker.bus.notify(&review_id);
    broker.bus.notify(QUEUE_TOPIC);
    schedule_reactive_scale(broker, "revise");

    Ok(json!({
        "review_id": review_id,
        "status": "pending",
        "revised": true,
        "current_round": new_round,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CloseReviewParams {
    pub review_id: String,
    pub closer_role: String,
}

/// Close a review that reached a terminal verdict. Proposer only.
pub async fn close_review(
    broker: &Arc<Broker>,
    params: CloseReviewParams,
) -> Result<Value, OpError> {
    const OP: &str = "close_review";

    if params.closer_role != "proposer" {
        return Err(OpError::Forbidden(format!(
            "Only the proposer can close a review (closer_role was {:?})",
            params.closer_role
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
    if let Err(err) = validate_transition(current, ReviewStatus::Closed) {
        tx.rollback_quietly().await;
        return Err(err);
    }

    let result: Result<(), sqlx::Error> = async {
        sqlx::query("UPDATE reviews SET status = 'closed', updated_at = ? WHERE id = ?")
            .bind(now_iso())
            .bind(&params.review_id)
            .execute(tx.conn())
            .await?;
        record_event(
            &mut tx,
            Some(&params.review_id),
            AuditEventType::ReviewClosed,
            Some(&params.closer_role),
            Some(current.as_str()),
            Some(ReviewStatus::Closed.as_str()),
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

    info!(review_id = %params.review_id, "review closed");
    broker.bus.notify(&params.review_id);
    broker.bus.cleanup(&params.review_id);
    if let Some(reviewer_id) = row.claimed_by.as_deref() {
        finalize_draining_if_idle(broker, reviewer_id).await;
    }

    Ok(json!({ "review_id": params.review_id, "status": "closed" }))
}

/// Return a claimed review to the queue, fencing out the previous claim.
///
/// Internal: invoked by the claim-timeout and dead-process reapers and by
/// the startup ownership sweep, never by a transport caller.
pub async fn reclaim_review(
    broker: &Arc<Broker>,
    review_id: &str,
    reason: &str,
) -> Result<Value, OpError> {
    const OP: &str = "reclaim_review";

    let mut tx = broker.store.begin_write().await.map_err(|e| OpError::store(OP, e))?;
    let row = match fetch_review_tx(&mut tx, OP, review_id).await? {
        Some(row) => row,
        None => {
            tx.rollback_quietly().await;
            return Err(OpError::ReviewNotFound(review_id.to_string()));
        }
    };
    let current = parse_status(&row, OP)?;
    if current != ReviewStatus::Claimed {
        tx.rollback_quietly().await;
        return Err(OpError::InvalidTransition {
            from: current.as_str().to_string(),
            to: ReviewStatus::Pending.as_str().to_string(),
        });
    }

    let former_reviewer = row.claimed_by.clone();
    let new_generation = row.claim_generation + 1;

    let result: Result<(), sqlx::Error> = async {
        sqlx::query(
            "UPDATE reviews
             SET status = 'pending',
                 claimed_by = NULL,
                 claimed_at = NULL,
                 claim_generation = ?,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(new_generation)
        .bind(now_iso())
        .bind(review_id)
        .execute(tx.conn())
        .await?;
        record_event(
            &mut tx,
            Some(review_id),
            AuditEventType::ReviewReclaimed,
            Some(crate::pool::POOL_ACTOR),
            Some(ReviewStatus::Claimed.as_str()),
            Some(ReviewStatus::Pending.as_str()),
            Some(json!({ "reason": reason, "previous_reviewer": &former_reviewer })),
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

    info!(review_id, reason, "review reclaimed");
    broker.bus.notify(review_id);
    broker.bus.notify(QUEUE_TOPIC);
    if let Some(reviewer_id) = former_reviewer.as_deref() {
        finalize_draining_if_idle(broker, reviewer_id).await;
    }

    Ok(json!({
        "review_id": review_id,
        "status": "pending",
        "claim_generation": new_generation,
    }))
}
