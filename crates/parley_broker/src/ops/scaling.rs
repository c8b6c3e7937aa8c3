//! Reactive scaling and the pool-facing operations.

use crate::broker::Broker;
use crate::error::OpError;
use crate::store::ReviewerRow;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::Row;
use std::sync::Arc;
use tracing::{debug, warn};

/// One reactive scaling pass.
///
/// Pending reviews are grouped by project (NULL is its own bucket); each
/// bucket gets enough workers to keep pending-per-worker at or under the
/// configured ratio, bounded by the pool cap. Scaling spawns bypass the
/// spawn cooldown: the pass cadence itself (create/requeue triggers plus
/// the periodic interval) is the throttle.
pub async fn reactive_scale_check(broker: &Arc<Broker>, source: &'static str) {
    let Some(pool) = broker.pool.as_ref() else {
        return;
    };
    let _pass = pool.scale_guard().await;

    let buckets = match sqlx::query(
        "SELECT project, COUNT(*) AS pending
         FROM reviews
         WHERE status = 'pending'
         GROUP BY project",
    )
    .fetch_all(broker.store.pool())
    .await
    {
        Ok(rows) => rows,
        Err(err) => {
            warn!(source, %err, "reactive scaling query failed");
            return;
        }
    };

    for bucket in buckets {
        let project: Option<String> = bucket.get("project");
        let pending: i64 = bucket.get("pending");
        if pending <= 0 {
            continue;
        }

        let active = pool.active_count_for_project(project.as_deref()).await as i64;
        let target = (pending as f64 / pool.config.scaling_ratio).ceil() as i64;
        let needed = target - active;
        if needed <= 0 {
            continue;
        }
        debug!(source, ?project, pending, active, needed, "scaling bucket");

        for _ in 0..needed {
            match pool
                .spawn_reviewer(&broker.store, project.as_deref(), true)
                .await
            {
                Ok(_) => {}
                Err(OpError::PoolCapReached { .. }) => {
                    debug!(source, "reactive scaling stopped: pool cap reached");
                    return;
                }
                Err(err) => {
                    warn!(source, %err, "reactive scaling spawn failed");
                    return;
                }
            }
        }
    }
}

/// Manual spawn operation. Respects the spawn cooldown.
pub async fn spawn_reviewer(broker: &Arc<Broker>) -> Result<Value, OpError> {
    let pool = broker.pool.as_ref().ok_or(OpError::PoolDisabled)?;
    pool.spawn_reviewer(&broker.store, None, false).await
}

#[derive(Debug, Deserialize)]
pub struct KillReviewerParams {
    pub reviewer_id: String,
}

/// Drain (and, once idle, terminate) a reviewer.
pub async fn kill_reviewer(
    broker: &Arc<Broker>,
    params: KillReviewerParams,
) -> Result<Value, OpError> {
    const OP: &str = "kill_reviewer";
    let pool = broker.pool.as_ref().ok_or(OpError::PoolDisabled)?;

    let known: Option<i64> = sqlx::query_scalar("SELECT 1 FROM reviewers WHERE id = ?")
        .bind(&params.reviewer_id)
        .fetch_optional(broker.store.pool())
        .await
        .map_err(|e| OpError::store(OP, e))?;
    if known.is_none() {
        return Err(OpError::ReviewerNotFound(params.reviewer_id));
    }

    pool.drain_reviewer(&params.reviewer_id, &broker.store, "manual")
        .await
}

/// List all reviewer rows, most recently spawned first.
pub async fn list_reviewers(broker: &Arc<Broker>) -> Result<Value, OpError> {
    const OP: &str = "list_reviewers";
    let rows: Vec<ReviewerRow> =
        sqlx::query_as("SELECT * FROM reviewers ORDER BY spawned_at DESC, id DESC")
            .fetch_all(broker.store.pool())
            .await
            .map_err(|e| OpError::store(OP, e))?;

    let reviewers: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "id": row.id,
                "display_name": row.display_name,
                "session_token": row.session_token,
                "status": row.status,
                "pid": row.pid,
                "spawned_at": row.spawned_at,
                "last_active_at": row.last_active_at,
                "terminated_at": row.terminated_at,
                "reviews_completed": row.reviews_completed,
                "total_review_seconds": row.total_review_seconds,
                "approvals": row.approvals,
                "rejections": row.rejections,
            })
        })
        .collect();
    let count = reviewers.len();
    Ok(json!({ "reviewers": reviewers, "count": count }))
}
