//! Read-side queries: listings, snapshots, discussion, activity feed,
//! timeline, audit retrieval, and aggregate stats.
//!
//! Long-poll variants snapshot the bus version before the first read, so
//! a change landing between read and wait is never missed.

use crate::broker::Broker;
use crate::error::OpError;
use crate::notify::QUEUE_TOPIC;
use crate::ops::{affected_files_value, fetch_review, seconds_between};
use crate::store::{AuditEventRow, MessageRow, ReviewRow};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_WAIT_TIMEOUT_SECONDS: f64 = 25.0;
const PREVIEW_MAX_CHARS: usize = 120;

fn wait_timeout(seconds: Option<f64>) -> Duration {
    Duration::from_secs_f64(seconds.unwrap_or(DEFAULT_WAIT_TIMEOUT_SECONDS).max(0.0))
}

#[derive(Debug, Deserialize)]
pub struct ListReviewsParams {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub projects: Option<Vec<String>>,
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub wait_timeout_seconds: Option<f64>,
}

/// List reviews ordered by priority (critical, normal, low) then age.
///
/// `wait=true` (pending only) long-polls the queue topic when no rows
/// match, waking as soon as new pending work arrives.
pub async fn list_reviews(broker: &Broker, params: ListReviewsParams) -> Result<Value, OpError> {
    if params.project.is_some() && params.projects.is_some() {
        return Err(OpError::InvalidInput(
            "Cannot supply both project and projects".to_string(),
        ));
    }
    if params.wait && params.status.as_deref() != Some("pending") {
        return Err(OpError::InvalidInput(
            "wait=true requires status='pending'".to_string(),
        ));
    }

    let queue_version = params.wait.then(|| broker.bus.current_version(QUEUE_TOPIC));
    let mut rows = query_reviews(broker, &params).await?;
    if rows.is_empty() && params.wait {
        broker
            .bus
            .wait_for_change(
                QUEUE_TOPIC,
                wait_timeout(params.wait_timeout_seconds),
                queue_version,
            )
            .await;
        rows = query_reviews(broker, &params).await?;
    }

    let reviews: Vec<Value> = rows.iter().map(review_summary).collect();
    let count = reviews.len();
    Ok(json!({ "reviews": reviews, "count": count }))
}

async fn query_reviews(
    broker: &Broker,
    params: &ListReviewsParams,
) -> Result<Vec<ReviewRow>, OpError> {
    const OP: &str = "list_reviews";

    let mut sql = String::from("SELECT * FROM reviews WHERE 1=1");
    let mut binds: Vec<String> = Vec::new();
    if let Some(status) = &params.status {
        sql.push_str(" AND status = ?");
        binds.push(status.clone());
    }
    if let Some(category) = &params.category {
        sql.push_str(" AND category = ?");
        binds.push(category.clone());
    }
    if let Some(project) = &params.project {
        sql.push_str(" AND project = ?");
        binds.push(project.clone());
    }
    if let Some(projects) = &params.projects {
        if projects.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; projects.len()].join(", ");
        sql.push_str(&format!(" AND project IN ({placeholders})"));
        binds.extend(projects.iter().cloned());
    }
    sql.push_str(
        " ORDER BY CASE priority WHEN 'critical' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END,
          created_at ASC",
    );

    let mut query = sqlx::query_as::<_, ReviewRow>(&sql);
    for bind in &binds {
        query = query.bind(bind);
    }
    query
        .fetch_all(broker.store.pool())
        .await
        .map_err(|e| OpError::store(OP, e))
}

fn review_summary(row: &ReviewRow) -> Value {
    json!({
        "id": row.id,
        "status": row.status,
        "intent": row.intent,
        "agent_type": row.agent_type,
        "agent_role": row.agent_role,
        "phase": row.phase,
        "priority": row.priority,
        "plan": row.plan,
        "task": row.task,
        "project": row.project,
        "category": row.category,
        "current_round": row.current_round,
        "claimed_by": row.claimed_by,
        "created_at": row.created_at,
        "updated_at": row.updated_at,
    })
}

#[derive(Debug, Deserialize)]
pub struct GetReviewStatusParams {
    pub review_id: String,
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub wait_timeout_seconds: Option<f64>,
}

/// Single-review snapshot; `wait=true` long-polls the review's topic and
/// returns the fresh snapshot with a `changed` flag.
pub async fn get_review_status(
    broker: &Broker,
    params: GetReviewStatusParams,
) -> Result<Value, OpError> {
    const OP: &str = "get_review_status";

    let version = params
        .wait
        .then(|| broker.bus.current_version(&params.review_id));
    let row = fetch_review(broker, OP, &params.review_id)
        .await?
        .ok_or_else(|| OpError::ReviewNotFound(params.review_id.clone()))?;

    if !params.wait {
        return Ok(status_snapshot(&row, None));
    }

    let changed = broker
        .bus
        .wait_for_change(
            &params.review_id,
            wait_timeout(params.wait_timeout_seconds),
            version,
        )
        .await;
    let row = fetch_review(broker, OP, &params.review_id)
        .await?
        .ok_or_else(|| OpError::ReviewNotFound(params.review_id.clone()))?;
    Ok(status_snapshot(&row, Some(changed)))
}

fn status_snapshot(row: &ReviewRow, changed: Option<bool>) -> Value {
    let mut doc = Map::new();
    doc.insert("id".into(), json!(row.id));
    doc.insert("status".into(), json!(row.status));
    doc.insert("intent".into(), json!(row.intent));
    doc.insert("description".into(), json!(row.description));
    doc.insert("agent_type".into(), json!(row.agent_type));
    doc.insert("agent_role".into(), json!(row.agent_role));
    doc.insert("phase".into(), json!(row.phase));
    doc.insert("plan".into(), json!(row.plan));
    doc.insert("task".into(), json!(row.task));
    doc.insert("project".into(), json!(row.project));
    doc.insert("priority".into(), json!(row.priority));
    doc.insert("category".into(), json!(row.category));
    doc.insert("current_round".into(), json!(row.current_round));
    doc.insert("claimed_by".into(), json!(row.claimed_by));
    doc.insert("claimed_at".into(), json!(row.claimed_at));
    doc.insert("claim_generation".into(), json!(row.claim_generation));
    doc.insert("verdict_reason".into(), json!(row.verdict_reason));
    doc.insert(
        "counter_patch_status".into(),
        json!(row.counter_patch_status),
    );
    doc.insert("has_diff".into(), json!(row.diff.is_some()));
    doc.insert("created_at".into(), json!(row.created_at));
    doc.insert("updated_at".into(), json!(row.updated_at));
    if let Some(changed) = changed {
        doc.insert("changed".into(), json!(changed));
    }
    Value::Object(doc)
}

#[derive(Debug, Deserialize)]
pub struct GetProposalParams {
    pub review_id: String,
}

/// Full proposal, including the raw diff and any counter-patch.
pub async fn get_proposal(broker: &Broker, params: GetProposalParams) -> Result<Value, OpError> {
    const OP: &str = "get_proposal";
    let row = fetch_review(broker, OP, &params.review_id)
        .await?
        .ok_or_else(|| OpError::ReviewNotFound(params.review_id.clone()))?;

    Ok(json!({
        "id": row.id,
        "status": row.status,
        "intent": row.intent,
        "description": row.description,
        "diff": row.diff,
        "affected_files": affected_files_value(row.affected_files.as_deref()),
        "counter_patch": row.counter_patch,
        "counter_patch_status": row.counter_patch_status,
        "counter_patch_affected_files":
            affected_files_value(row.counter_patch_affected_files.as_deref()),
        "category": row.category,
        "current_round": row.current_round,
        "skip_diff_validation": row.skip_diff_validation,
        "created_at": row.created_at,
        "updated_at": row.updated_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct GetDiscussionParams {
    pub review_id: String,
    #[serde(default)]
    pub round: Option<i64>,
}

/// Messages for a review in insertion order, optionally one round only.
pub async fn get_discussion(
    broker: &Broker,
    params: GetDiscussionParams,
) -> Result<Value, OpError> {
    const OP: &str = "get_discussion";
    if fetch_review(broker, OP, &params.review_id).await?.is_none() {
        return Err(OpError::ReviewNotFound(params.review_id));
    }

    let rows: Vec<MessageRow> = match params.round {
        Some(round) => sqlx::query_as(
            "SELECT * FROM messages
             WHERE review_id = ? AND round = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(&params.review_id)
        .bind(round)
        .fetch_all(broker.store.pool())
        .await
        .map_err(|e| OpError::store(OP, e))?,
        None => sqlx::query_as(
            "SELECT * FROM messages
             WHERE review_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(&params.review_id)
        .fetch_all(broker.store.pool())
        .await
        .map_err(|e| OpError::store(OP, e))?,
    };

    let messages: Vec<Value> = rows
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "sender_role": m.sender_role,
                "round": m.round,
                "body": m.body,
                "metadata": m.metadata.as_deref()
                    .and_then(|raw| serde_json::from_str::<Value>(raw).ok()),
                "created_at": m.created_at,
            })
        })
        .collect();
    let count = messages.len();
    Ok(json!({ "review_id": params.review_id, "messages": messages, "count": count }))
}

#[derive(Debug, Deserialize, Default)]
pub struct ActivityFeedParams {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
}

/// Most-recently-updated reviews with message counts and a preview of the
/// latest message.
pub async fn get_activity_feed(
    broker: &Broker,
    params: ActivityFeedParams,
) -> Result<Value, OpError> {
    const OP: &str = "get_activity_feed";

    let mut sql = String::from(
        "SELECT r.id, r.status, r.intent, r.agent_type, r.phase, r.priority,
                r.project, r.category, r.current_round, r.claimed_by,
                r.created_at, r.updated_at,
                (SELECT COUNT(*) FROM messages m WHERE m.review_id = r.id) AS message_count,
                (SELECT MAX(m.created_at) FROM messages m WHERE m.review_id = r.id)
                    AS last_message_at,
                (SELECT m.body FROM messages m WHERE m.review_id = r.id
                 ORDER BY m.created_at DESC, m.id DESC LIMIT 1) AS last_message_body
         FROM reviews r
         WHERE 1=1",
    );
    let mut binds: Vec<String> = Vec::new();
    if let Some(status) = &params.status {
        sql.push_str(" AND r.status = ?");
        binds.push(status.clone());
    }
    if let Some(category) = &params.category {
        sql.push_str(" AND r.category = ?");
        binds.push(category.clone());
    }
    if let Some(project) = &params.project {
        sql.push_str(" AND r.project = ?");
        binds.push(project.clone());
    }
    sql.push_str(" ORDER BY r.updated_at DESC, r.id DESC");

    let mut query = sqlx::query(&sql);
    for bind in &binds {
        query = query.bind(bind);
    }
    let rows = query
        .fetch_all(broker.store.pool())
        .await
        .map_err(|e| OpError::store(OP, e))?;

    let reviews: Vec<Value> = rows
        .iter()
        .map(|row| {
            let preview: Option<String> = row
                .get::<Option<String>, _>("last_message_body")
                .map(|body| truncate_chars(&body, PREVIEW_MAX_CHARS));
            json!({
                "id": row.get::<String, _>("id"),
                "status": row.get::<String, _>("status"),
                "intent": row.get::<String, _>("intent"),
                "agent_type": row.get::<String, _>("agent_type"),
                "phase": row.get::<String, _>("phase"),
                "priority": row.get::<String, _>("priority"),
                "project": row.get::<Option<String>, _>("project"),
                "category": row.get::<Option<String>, _>("category"),
                "current_round": row.get::<i64, _>("current_round"),
                "claimed_by": row.get::<Option<String>, _>("claimed_by"),
                "created_at": row.get::<String, _>("created_at"),
                "updated_at": row.get::<String, _>("updated_at"),
                "message_count": row.get::<i64, _>("message_count"),
                "last_message_at": row.get::<Option<String>, _>("last_message_at"),
                "last_message_preview": preview,
            })
        })
        .collect();
    let count = reviews.len();
    Ok(json!({ "reviews": reviews, "count": count }))
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[derive(Debug, Deserialize)]
pub struct GetReviewTimelineParams {
    pub review_id: String,
}

/// All audit events for one review, oldest first.
pub async fn get_review_timeline(
    broker: &Broker,
    params: GetReviewTimelineParams,
) -> Result<Value, OpError> {
    const OP: &str = "get_review_timeline";
    let row = fetch_review(broker, OP, &params.review_id)
        .await?
        .ok_or_else(|| OpError::ReviewNotFound(params.review_id.clone()))?;

    let events: Vec<AuditEventRow> =
        sqlx::query_as("SELECT * FROM audit_events WHERE review_id = ? ORDER BY id ASC")
            .bind(&params.review_id)
            .fetch_all(broker.store.pool())
            .await
            .map_err(|e| OpError::store(OP, e))?;

    let events: Vec<Value> = events.iter().map(audit_event_doc).collect();
    let event_count = events.len();
    Ok(json!({
        "review_id": params.review_id,
        "intent": row.intent,
        "current_status": row.status,
        "category": row.category,
        "events": events,
        "event_count": event_count,
    }))
}

#[derive(Debug, Deserialize, Default)]
pub struct GetAuditLogParams {
    #[serde(default)]
    pub review_id: Option<String>,
}

/// Global or per-review audit log, oldest first.
pub async fn get_audit_log(broker: &Broker, params: GetAuditLogParams) -> Result<Value, OpError> {
    const OP: &str = "get_audit_log";

    let rows: Vec<AuditEventRow> = match &params.review_id {
        Some(review_id) => {
            sqlx::query_as("SELECT * FROM audit_events WHERE review_id = ? ORDER BY id ASC")
                .bind(review_id)
                .fetch_all(broker.store.pool())
                .await
        }
        None => {
            sqlx::query_as("SELECT * FROM audit_events ORDER BY id ASC")
                .fetch_all(broker.store.pool())
                .await
        }
    }
    .map_err(|e| OpError::store(OP, e))?;

    let events: Vec<Value> = rows.iter().map(audit_event_doc).collect();
    let count = events.len();
    Ok(json!({ "events": events, "count": count }))
}

fn audit_event_doc(event: &AuditEventRow) -> Value {
    json!({
        "id": event.id,
        "review_id": event.review_id,
        "event_type": event.event_type,
        "actor": event.actor,
        "old_status": event.old_status,
        "new_status": event.new_status,
        "metadata": event.metadata.as_deref()
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok()),
        "created_at": event.created_at,
    })
}

/// Aggregate review statistics.
pub async fn get_review_stats(broker: &Broker) -> Result<Value, OpError> {
    const OP: &str = "get_review_stats";
    let pool = broker.store.pool();

    let total_reviews: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reviews")
        .fetch_one(pool)
        .await
        .map_err(|e| OpError::store(OP, e))?;

    let mut by_status = Map::new();
    for status in [
        "pending",
        "claimed",
        "in_review",
        "approved",
        "changes_requested",
        "closed",
    ] {
        by_status.insert(status.to_string(), json!(0));
    }
    let status_rows = sqlx::query("SELECT status, COUNT(*) AS n FROM reviews GROUP BY status")
        .fetch_all(pool)
        .await
        .map_err(|e| OpError::store(OP, e))?;
    for row in &status_rows {
        let status: String = row.get("status");
        let n: i64 = row.get("n");
        by_status.insert(status, json!(n));
    }

    let mut by_category = Map::new();
    let category_rows = sqlx::query(
        "SELECT COALESCE(category, 'uncategorized') AS category, COUNT(*) AS n
         FROM reviews GROUP BY COALESCE(category, 'uncategorized')",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| OpError::store(OP, e))?;
    for row in &category_rows {
        let category: String = row.get("category");
        let n: i64 = row.get("n");
        by_category.insert(category, json!(n));
    }

    let verdict_rows = sqlx::query(
        "SELECT new_status, COUNT(*) AS n
         FROM audit_events
         WHERE event_type = 'verdict_submitted'
         GROUP BY new_status",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| OpError::store(OP, e))?;
    let mut approved = 0i64;
    let mut rejected = 0i64;
    for row in &verdict_rows {
        let status: Option<String> = row.get("new_status");
        let n: i64 = row.get("n");
        match status.as_deref() {
            Some("approved") => approved += n,
            Some("changes_requested") => rejected += n,
            _ => {}
        }
    }
    let approval_rate_pct = if approved + rejected > 0 {
        json!((approved as f64 / (approved + rejected) as f64) * 100.0)
    } else {
        Value::Null
    };

    let avg_time_to_verdict: Option<f64> = sqlx::query_scalar(
        "SELECT AVG((julianday(e.first_verdict) - julianday(r.created_at)) * 86400.0)
         FROM reviews r
         JOIN (SELECT review_id, MIN(created_at) AS first_verdict
               FROM audit_events
               WHERE event_type = 'verdict_submitted'
               GROUP BY review_id) e
           ON e.review_id = r.id",
    )
    .fetch_one(pool)
    .await
    .map_err(|e| OpError::store(OP, e))?;

    let avg_review_duration: Option<f64> = sqlx::query_scalar(
        "SELECT AVG((julianday(e.closed_at) - julianday(r.created_at)) * 86400.0)
         FROM reviews r
         JOIN (SELECT review_id, MIN(created_at) AS closed_at
               FROM audit_events
               WHERE event_type = 'review_closed'
               GROUP BY review_id) e
           ON e.review_id = r.id",
    )
    .fetch_one(pool)
    .await
    .map_err(|e| OpError::store(OP, e))?;

    let avg_time_in_state = avg_time_in_state(broker).await?;

    Ok(json!({
        "total_reviews": total_reviews,
        "by_status": by_status,
        "by_category": by_category,
        "approval_rate_pct": approval_rate_pct,
        "avg_time_to_verdict_seconds": avg_time_to_verdict,
        "avg_review_duration_seconds": avg_review_duration,
        "avg_time_in_state_seconds": avg_time_in_state,
    }))
}

/// Average completed-interval duration per state, reconstructed from the
/// audit trail. A state a review is still sitting in contributes nothing
/// until it is exited.
async fn avg_time_in_state(broker: &Broker) -> Result<Value, OpError> {
    const OP: &str = "get_review_stats";

    let events: Vec<AuditEventRow> = sqlx::query_as(
        "SELECT * FROM audit_events
         WHERE review_id IS NOT NULL AND new_status IS NOT NULL
         ORDER BY review_id, id ASC",
    )
    .fetch_all(broker.store.pool())
    .await
    .map_err(|e| OpError::store(OP, e))?;

    let mut sums: HashMap<&str, (f64, u64)> = HashMap::new();
    let mut previous: Option<(String, String, String)> = None; // (review, state, entered_at)

    for event in &events {
        let review_id = event.review_id.as_deref().unwrap_or_default();
        let new_status = event.new_status.as_deref().unwrap_or_default();

        if let Some((prev_review, prev_state, entered_at)) = previous.take() {
            if prev_review == review_id {
                if let Some(elapsed) = seconds_between(&entered_at, &event.created_at) {
                    for state in ["pending", "claimed", "approved", "changes_requested"] {
                        if prev_state == state {
                            let entry = sums.entry(state).or_insert((0.0, 0));
                            entry.0 += elapsed.max(0.0);
                            entry.1 += 1;
                        }
                    }
                }
            }
        }
        previous = Some((
            review_id.to_string(),
            new_status.to_string(),
            event.created_at.clone(),
        ));
    }

    let mut doc = Map::new();
    for state in ["pending", "claimed", "approved", "changes_requested"] {
        let value = match sums.get(state) {
            Some((total, count)) if *count > 0 => json!(total / *count as f64),
            _ => Value::Null,
        };
        doc.insert(state.to_string(), value);
    }
    Ok(Value::Object(doc))
}
