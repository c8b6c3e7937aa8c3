//! Claim semantics: fencing tokens, reservations, reviewer eligibility,
//! and diff auto-reject.

mod common;

use common::*;
use parley_broker::error::OpError;
use parley_broker::ops::{claims, reviews, verdicts};
use serde_json::json;

#[tokio::test]
async fn claim_generation_increments_per_claim() {
    let ctx = broker().await;
    let created = create_review(&ctx, "fencing").await;
    let review_id = created["review_id"].as_str().unwrap().to_string();

    let first = claim(&ctx, &review_id, "rev-a").await;
    assert_eq!(first["claim_generation"], 1);

    reviews::reclaim_review(&ctx.broker, &review_id, "claim_timeout")
        .await
        .unwrap();
    assert!(query_text(
        &ctx,
        &format!("SELECT claimed_by FROM reviews WHERE id = '{review_id}'")
    )
    .await
    .is_none());

    let second = claim(&ctx, &review_id, "rev-b").await;
    assert_eq!(second["claim_generation"], 3);
}

#[tokio::test]
async fn stale_claim_generation_is_fenced_out() {
    let ctx = broker().await;
    let created = create_review(&ctx, "stale verdict").await;
    let review_id = created["review_id"].as_str().unwrap().to_string();

    let first = claim(&ctx, &review_id, "rev-a").await;
    reviews::reclaim_review(&ctx.broker, &review_id, "claim_timeout")
        .await
        .unwrap();
    let second = claim(&ctx, &review_id, "rev-b").await;

    // Reviewer A wakes up late and submits with its old token.
    let err = verdicts::submit_verdict(
        &ctx.broker,
        serde_json::from_value(json!({
            "review_id": review_id,
            "verdict": "approved",
            "claim_generation": first["claim_generation"],
        }))
        .unwrap(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OpError::StaleClaim { .. }));
    assert!(err.to_string().starts_with("Stale claim"));

    let ok = submit_verdict(
        &ctx,
        json!({
            "review_id": review_id,
            "verdict": "approved",
            "claim_generation": second["claim_generation"],
        }),
    )
    .await;
    assert_eq!(ok["status"], "approved");
}

#[tokio::test]
async fn wrong_reviewer_is_unauthorized() {
    let ctx = broker().await;
    let created = create_review(&ctx, "ownership").await;
    let review_id = created["review_id"].as_str().unwrap().to_string();
    claim(&ctx, &review_id, "rev-a").await;

    let err = verdicts::submit_verdict(
        &ctx.broker,
        serde_json::from_value(json!({
            "review_id": review_id,
            "verdict": "approved",
            "reviewer_id": "rev-b",
        }))
        .unwrap(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OpError::Unauthorized { .. }));
    assert!(err.to_string().starts_with("Unauthorized"));
}

#[tokio::test]
async fn claimed_verdict_requires_some_credential() {
    let ctx = broker().await;
    let created = create_review(&ctx, "credentials").await;
    let review_id = created["review_id"].as_str().unwrap().to_string();
    claim(&ctx, &review_id, "rev-a").await;

    let err = verdicts::submit_verdict(
        &ctx.broker,
        serde_json::from_value(json!({
            "review_id": review_id,
            "verdict": "approved",
        }))
        .unwrap(),
    )
    .await
    .unwrap_err();
    assert!(err
        .to_string()
        .contains("require reviewer_id or claim_generation"));
}

#[tokio::test]
async fn double_claim_is_invalid_transition() {
    let ctx = broker().await;
    let created = create_review(&ctx, "single winner").await;
    let review_id = created["review_id"].as_str().unwrap().to_string();
    claim(&ctx, &review_id, "rev-a").await;

    let err = claims::claim_review(
        &ctx.broker,
        serde_json::from_value(json!({
            "review_id": review_id,
            "reviewer_id": "rev-b",
        }))
        .unwrap(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OpError::InvalidTransition { .. }));
}

#[tokio::test]
async fn draining_reviewer_cannot_claim() {
    let ctx = broker().await;
    insert_reviewer(&ctx, "r-draining", "testsess", "draining").await;
    let created = create_review(&ctx, "no new work").await;

    let err = claims::claim_review(
        &ctx.broker,
        serde_json::from_value(json!({
            "review_id": created["review_id"],
            "reviewer_id": "r-draining",
        }))
        .unwrap(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OpError::Forbidden(_)));
    assert!(err.to_string().contains("cannot claim new reviews"));
}

#[tokio::test]
async fn terminated_reviewer_cannot_claim() {
    let ctx = broker().await;
    insert_reviewer(&ctx, "r-gone", "testsess", "terminated").await;
    let created = create_review(&ctx, "no zombie claims").await;

    let err = claims::claim_review(
        &ctx.broker,
        serde_json::from_value(json!({
            "review_id": created["review_id"],
            "reviewer_id": "r-gone",
        }))
        .unwrap(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("cannot claim new reviews"));
}

#[tokio::test]
async fn unknown_reviewer_id_may_claim() {
    // Human reviewers have no pool row at all.
    let ctx = broker().await;
    let created = create_review(&ctx, "human reviewer").await;
    let claimed = claim(&ctx, created["review_id"].as_str().unwrap(), "alice").await;
    assert_eq!(claimed["status"], "claimed");
}

#[tokio::test]
async fn failing_diff_auto_rejects_on_claim() {
    let ctx = broker().await;
    let created = create_review_with(
        &ctx,
        json!({
            "intent": "broken diff",
            "diff": bad_diff(),
            "skip_diff_validation": true,
        }),
    )
    .await;
    let review_id = created["review_id"].as_str().unwrap().to_string();

    // Creation skipped validation; the claim does not.
    exec_sql(
        &ctx,
        &format!("UPDATE reviews SET skip_diff_validation = 0 WHERE id = '{review_id}'"),
    )
    .await;

    let result = claim(&ctx, &review_id, "rev-a").await;
    assert_eq!(result["auto_rejected"], true);
    assert_eq!(result["status"], "changes_requested");
    assert!(result["validation_error"].as_str().is_some());

    let claimed_by = query_text(
        &ctx,
        &format!("SELECT claimed_by FROM reviews WHERE id = '{review_id}'"),
    )
    .await;
    assert_eq!(claimed_by.as_deref(), Some("broker-validator"));

    let events = timeline_events(&ctx, &review_id).await;
    assert!(events.contains(&"review_auto_rejected".to_string()));
}

#[tokio::test]
async fn skip_diff_validation_bypasses_auto_reject() {
    let ctx = broker().await;
    let created = create_review_with(
        &ctx,
        json!({
            "intent": "trusted diff",
            "diff": bad_diff(),
            "skip_diff_validation": true,
        }),
    )
    .await;
    let claimed = claim(&ctx, created["review_id"].as_str().unwrap(), "rev-a").await;
    assert_eq!(claimed["status"], "claimed");
    assert!(claimed.get("auto_rejected").is_none());
}

#[tokio::test]
async fn create_rejects_invalid_diff() {
    let ctx = broker().await;
    let err = reviews::create_review(
        &ctx.broker,
        serde_json::from_value(json!({
            "intent": "bad from the start",
            "agent_type": "gsd-executor",
            "agent_role": "proposer",
            "phase": "1",
            "diff": bad_diff(),
        }))
        .unwrap(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OpError::InvalidDiff(_)));
}

#[tokio::test]
async fn reservation_blocks_other_reviewers_while_owner_lives() {
    let ctx = broker_with_pool().await;
    let pool = ctx.broker.pool.as_ref().unwrap().clone();

    let spawned = pool.spawn_reviewer(&ctx.broker.store, None, true).await.unwrap();
    let reviewer_id = spawned["reviewer_id"].as_str().unwrap().to_string();

    let created = create_review(&ctx, "reservation").await;
    let review_id = created["review_id"].as_str().unwrap().to_string();
    let claimed = claim(&ctx, &review_id, &reviewer_id).await;
    submit_verdict(
        &ctx,
        json!({
            "review_id": review_id,
            "verdict": "changes_requested",
            "reason": "needs clarification",
            "reviewer_id": reviewer_id,
            "claim_generation": claimed["claim_generation"],
        }),
    )
    .await;
    add_message(&ctx, &review_id, "proposer", "Can you clarify this?").await;

    // Status flipped back to pending with the reservation held.
    let status = query_text(
        &ctx,
        &format!("SELECT status FROM reviews WHERE id = '{review_id}'"),
    )
    .await;
    assert_eq!(status.as_deref(), Some("pending"));
    let reserved = query_text(
        &ctx,
        &format!("SELECT claimed_by FROM reviews WHERE id = '{review_id}'"),
    )
    .await;
    assert_eq!(reserved.as_deref(), Some(reviewer_id.as_str()));

    // A different reviewer bounces off the reservation.
    let err = claims::claim_review(
        &ctx.broker,
        serde_json::from_value(json!({
            "review_id": review_id,
            "reviewer_id": "interloper",
        }))
        .unwrap(),
    )
    .await
    .unwrap_err();
    assert!(err
        .to_string()
        .contains(&format!("reserved for reviewer {reviewer_id}")));

    // The original reviewer resumes.
    let resumed = claim(&ctx, &review_id, &reviewer_id).await;
    assert_eq!(resumed["status"], "claimed");

    pool.shutdown_all(&ctx.broker.store).await;
}

#[tokio::test]
async fn stale_reservation_clears_when_process_exits() {
    let ctx = broker_with_pool().await;
    let pool = ctx.broker.pool.as_ref().unwrap().clone();

    let spawned = pool.spawn_reviewer(&ctx.broker.store, None, true).await.unwrap();
    let reviewer_id = spawned["reviewer_id"].as_str().unwrap().to_string();

    let created = create_review(&ctx, "stale reservation").await;
    let review_id = created["review_id"].as_str().unwrap().to_string();
    let claimed = claim(&ctx, &review_id, &reviewer_id).await;
    submit_verdict(
        &ctx,
        json!({
            "review_id": review_id,
            "verdict": "changes_requested",
            "reason": "needs work",
            "reviewer_id": reviewer_id,
            "claim_generation": claimed["claim_generation"],
        }),
    )
    .await;
    add_message(&ctx, &review_id, "proposer", "Follow-up question").await;

    // The reserved worker dies; the reservation is no longer enforced.
    pool.shutdown_all(&ctx.broker.store).await;

    let fallback = claim(&ctx, &review_id, "fallback-reviewer").await;
    assert_eq!(fallback["status"], "claimed");
    assert_eq!(fallback["claimed_by"], "fallback-reviewer");
}

#[tokio::test]
async fn reservation_unenforced_without_pool() {
    let ctx = broker().await;
    let created = create_review(&ctx, "no pool, no reservation").await;
    let review_id = created["review_id"].as_str().unwrap().to_string();
    let claimed = claim(&ctx, &review_id, "rev-a").await;
    submit_verdict(
        &ctx,
        json!({
            "review_id": review_id,
            "verdict": "changes_requested",
            "reason": "tweak",
            "claim_generation": claimed["claim_generation"],
        }),
    )
    .await;
    add_message(&ctx, &review_id, "proposer", "done, look again").await;

    let other = claim(&ctx, &review_id, "rev-b").await;
    assert_eq!(other["claimed_by"], "rev-b");
}
