//! Periodic background checks and startup recovery sweeps.
//!
//! Each reaper isolates its own failures: one failing check never stops
//! the others or the foreground path.

use crate::audit::record_event;
use crate::broker::Broker;
use crate::error::OpError;
use crate::notify::QUEUE_TOPIC;
use crate::ops::reviews::reclaim_review;
use crate::ops::scaling::reactive_scale_check;
use crate::pool::POOL_ACTOR;
use crate::store::{iso_from, now_iso};
use chrono::{Duration as ChronoDuration, Utc};
use parley_protocol::AuditEventType;
use serde_json::json;
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

fn cutoff_iso(seconds: f64) -> String {
    iso_from(Utc::now() - ChronoDuration::milliseconds((seconds * 1000.0) as i64))
}

/// The background task: run every check each interval, logging failures
/// per check.
pub async fn periodic_check(broker: Arc<Broker>) {
    loop {
        let interval = match broker.pool.as_ref() {
            Some(pool) => pool.config.background_check_interval_seconds,
            None => return,
        };
        tokio::time::sleep(Duration::from_secs_f64(interval)).await;

        reactive_scale_check(&broker, "periodic").await;
        if let Err(err) = check_idle_timeouts(&broker).await {
            error!(%err, "background check failed: idle_timeout");
        }
        if let Err(err) = check_ttl_expiry(&broker).await {
            error!(%err, "background check failed: ttl_expiry");
        }
        if let Err(err) = check_claim_timeouts(&broker).await {
            error!(%err, "background check failed: claim_timeout");
        }
        if let Err(err) = check_dead_processes(&broker).await {
            error!(%err, "background check failed: dead_process");
        }
    }
}

/// Drain active reviewers idle past the timeout with no reviews attached.
pub async fn check_idle_timeouts(broker: &Arc<Broker>) -> Result<(), OpError> {
    const OP: &str = "idle_timeout";
    let Some(pool) = broker.pool.as_ref() else {
        return Ok(());
    };
    let cutoff = cutoff_iso(pool.config.idle_timeout_seconds);
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM reviewers
         WHERE status = 'active'
           AND last_active_at < ?
           AND NOT EXISTS (
               SELECT 1 FROM reviews
               WHERE reviews.claimed_by = reviewers.id
                 AND reviews.status != 'closed'
           )",
    )
    .bind(&cutoff)
    .fetch_all(broker.store.pool())
    .await
    .map_err(|e| OpError::store(OP, e))?;

    for reviewer_id in ids {
        info!(reviewer_id = %reviewer_id, "idle timeout: draining reviewer");
        pool.drain_reviewer(&reviewer_id, &broker.store, "idle").await?;
    }
    Ok(())
}

/// Drain active reviewers older than the TTL with no reviews attached.
pub async fn check_ttl_expiry(broker: &Arc<Broker>) -> Result<(), OpError> {
    const OP: &str = "ttl_expiry";
    let Some(pool) = broker.pool.as_ref() else {
        return Ok(());
    };
    let cutoff = cutoff_iso(pool.config.max_ttl_seconds);
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM reviewers
         WHERE status = 'active'
           AND spawned_at < ?
           AND NOT EXISTS (
               SELECT 1 FROM reviews
               WHERE reviews.claimed_by = reviewers.id
                 AND reviews.status != 'closed'
           )",
    )
    .bind(&cutoff)
    .fetch_all(broker.store.pool())
    .await
    .map_err(|e| OpError::store(OP, e))?;

    for reviewer_id in ids {
        info!(reviewer_id = %reviewer_id, "ttl expired: draining reviewer");
        pool.drain_reviewer(&reviewer_id, &broker.store, "ttl").await?;
    }
    Ok(())
}

/// Reclaim reviews whose claim outlived the claim timeout.
pub async fn check_claim_timeouts(broker: &Arc<Broker>) -> Result<(), OpError> {
    const OP: &str = "claim_timeout";
    let Some(pool) = broker.pool.as_ref() else {
        return Ok(());
    };
    let cutoff = cutoff_iso(pool.config.claim_timeout_seconds);
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM reviews
         WHERE status = 'claimed'
           AND COALESCE(claimed_at, updated_at, created_at) < ?",
    )
    .bind(&cutoff)
    .fetch_all(broker.store.pool())
    .await
    .map_err(|e| OpError::store(OP, e))?;

    for review_id in ids {
        info!(review_id = %review_id, "claim timeout: reclaiming");
        reclaim_review(broker, &review_id, "claim_timeout").await?;
    }
    Ok(())
}

/// Recover state owned by reviewers whose subprocess exited.
///
/// Claimed reviews are reclaimed; other open reviews are detached from
/// the dead reviewer. A reviewer with open reviews still attached after
/// the sweep stays draining; otherwise it is terminated and removed.
pub async fn check_dead_processes(broker: &Arc<Broker>) -> Result<(), OpError> {
    const OP: &str = "dead_process";
    let Some(pool) = broker.pool.as_ref() else {
        return Ok(());
    };

    for (reviewer_id, exit_code) in pool.dead_processes().await {
        let attached = sqlx::query(
            "SELECT id, status FROM reviews WHERE claimed_by = ? AND status != 'closed'",
        )
        .bind(&reviewer_id)
        .fetch_all(broker.store.pool())
        .await
        .map_err(|e| OpError::store(OP, e))?;

        let mut detached: Vec<String> = Vec::new();
        let mut detached_pending = false;
        for row in &attached {
            let review_id: String = row.get("id");
            let status: String = row.get("status");
            if status == "claimed" {
                reclaim_review(broker, &review_id, "reviewer_process_exit").await?;
            } else {
                if status == "pending" {
                    detached_pending = true;
                }
                detached.push(review_id);
            }
        }

        if !detached.is_empty() {
            let mut tx = broker
                .store
                .begin_write()
                .await
                .map_err(|e| OpError::store(OP, e))?;
            let result: Result<(), sqlx::Error> = async {
                for review_id in &detached {
                    sqlx::query(
                        "UPDATE reviews
                         SET claimed_by = NULL, claimed_at = NULL, updated_at = ?
                         WHERE id = ? AND claimed_by = ?",
                    )
                    .bind(now_iso())
                    .bind(review_id)
                    .bind(&reviewer_id)
                    .execute(tx.conn())
                    .await?;
                    record_event(
                        &mut tx,
                        Some(review_id),
                        AuditEventType::ReviewDetached,
                        Some(POOL_ACTOR),
                        None,
                        None,
                        Some(json!({
                            "reason": "reviewer_process_exit",
                            "reviewer_id": &reviewer_id,
                        })),
                    )
                    .await?;
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
            for review_id in &detached {
                broker.bus.notify(review_id);
            }
            if detached_pending {
                broker.bus.notify(QUEUE_TOPIC);
            }
        }

        let remaining: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM reviews WHERE claimed_by = ? AND status != 'closed'",
        )
        .bind(&reviewer_id)
        .fetch_one(broker.store.pool())
        .await
        .map_err(|e| OpError::store(OP, e))?;

        if remaining > 0 {
            pool.mark_dead_process_draining(&reviewer_id, &broker.store, exit_code, remaining)
                .await?;
        } else {
            pool.terminate_reviewer(&reviewer_id, &broker.store).await;
        }
    }
    Ok(())
}

/// Startup: reviewers persisted by a previous broker instance are gone
/// with its processes; mark them terminated.
pub async fn startup_terminate_stale_reviewers(broker: &Arc<Broker>) -> Result<usize, OpError> {
    const OP: &str = "startup_terminate_stale_reviewers";
    let Some(pool) = broker.pool.as_ref() else {
        return Ok(0);
    };

    let mut tx = broker
        .store
        .begin_write()
        .await
        .map_err(|e| OpError::store(OP, e))?;
    let result: Result<usize, sqlx::Error> = async {
        let stale: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM reviewers
             WHERE status IN ('active', 'draining') AND session_token != ?",
        )
        .bind(&pool.session_token)
        .fetch_all(tx.conn())
        .await?;
        if !stale.is_empty() {
            let placeholders = vec!["?"; stale.len()].join(", ");
            let sql = format!(
                "UPDATE reviewers SET status = 'terminated', terminated_at = ?
                 WHERE id IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql).bind(now_iso());
            for id in &stale {
                query = query.bind(id);
            }
            query.execute(tx.conn()).await?;
        }
        Ok(stale.len())
    }
    .await;

    match result {
        Ok(count) => {
            tx.commit().await.map_err(|e| OpError::store(OP, e))?;
            Ok(count)
        }
        Err(err) => {
            tx.rollback_quietly().await;
            Err(OpError::store(OP, err))
        }
    }
}

/// Startup: reclaim claimed reviews whose owner is not an active or
/// draining reviewer of the current session.
pub async fn startup_ownership_sweep(broker: &Arc<Broker>) -> Result<usize, OpError> {
    const OP: &str = "startup_ownership_sweep";
    let Some(pool) = broker.pool.as_ref() else {
        return Ok(0);
    };

    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM reviews
         WHERE status = 'claimed'
           AND (
               claimed_by IS NULL
               OR claimed_by NOT IN (
                   SELECT id FROM reviewers
                   WHERE session_token = ? AND status IN ('active', 'draining')
               )
           )",
    )
    .bind(&pool.session_token)
    .fetch_all(broker.store.pool())
    .await
    .map_err(|e| OpError::store(OP, e))?;

    let mut reclaimed = 0;
    for review_id in ids {
        if reclaim_review(broker, &review_id, "stale_session").await.is_ok() {
            reclaimed += 1;
        }
    }
    Ok(reclaimed)
}
