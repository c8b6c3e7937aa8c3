//! End-to-end lifecycle scenarios: happy path, revision cycle, close
//! rules, and audit trail ordering.

mod common;

use common::*;
use parley_broker::error::OpError;
use parley_broker::ops::reviews;
use parley_broker::queries;
use serde_json::json;

#[tokio::test]
async fn happy_path_full_lifecycle() {
    let ctx = broker().await;

    let created = create_review_with(
        &ctx,
        json!({
            "intent": "implement auth module",
            "category": "code_change",
        }),
    )
    .await;
    let review_id = created["review_id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "pending");

    let claimed = claim(&ctx, &review_id, "rev-1").await;
    assert_eq!(claimed["status"], "claimed");
    assert_eq!(claimed["claim_generation"], 1);
    assert_eq!(claimed["claimed_by"], "rev-1");
    assert_eq!(claimed["intent"], "implement auth module");

    add_message(&ctx, &review_id, "reviewer", "Looks mostly good").await;
    add_message(&ctx, &review_id, "proposer", "Thanks, noted").await;

    let verdict = submit_verdict(
        &ctx,
        json!({
            "review_id": review_id,
            "verdict": "approved",
            "reason": "LGTM",
            "reviewer_id": "rev-1",
            "claim_generation": 1,
        }),
    )
    .await;
    assert_eq!(verdict["status"], "approved");

    let closed = close_review(&ctx, &review_id).await;
    assert_eq!(closed["status"], "closed");

    assert_eq!(
        timeline_events(&ctx, &review_id).await,
        vec![
            "review_created",
            "review_claimed",
            "message_sent",
            "message_sent",
            "verdict_submitted",
            "review_closed",
        ]
    );
}

#[tokio::test]
async fn revision_cycle_increments_round() {
    let ctx = broker().await;

    let created = create_review(&ctx, "first attempt").await;
    let review_id = created["review_id"].as_str().unwrap().to_string();

    let claimed = claim(&ctx, &review_id, "rev-1").await;
    submit_verdict(
        &ctx,
        json!({
            "review_id": review_id,
            "verdict": "changes_requested",
            "reason": "Fix typo",
            "reviewer_id": "rev-1",
            "claim_generation": claimed["claim_generation"],
        }),
    )
    .await;

    let revised = create_review_with(
        &ctx,
        json!({ "intent": "second attempt", "review_id": review_id }),
    )
    .await;
    assert_eq!(revised["revised"], true);
    assert_eq!(revised["status"], "pending");
    assert_eq!(revised["current_round"], 2);

    let status = queries::get_review_status(
        &ctx.broker,
        serde_json::from_value(json!({ "review_id": review_id })).unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(status["current_round"], 2);
    assert_eq!(status["intent"], "second attempt");
    assert!(status["claimed_by"].is_null());
    assert!(status["verdict_reason"].is_null());

    let reclaimed = claim(&ctx, &review_id, "rev-2").await;
    submit_verdict(
        &ctx,
        json!({
            "review_id": review_id,
            "verdict": "approved",
            "reason": "good now",
            "claim_generation": reclaimed["claim_generation"],
        }),
    )
    .await;
    close_review(&ctx, &review_id).await;

    let events = timeline_events(&ctx, &review_id).await;
    assert_eq!(
        &events[events.len() - 5..],
        &[
            "verdict_submitted",
            "review_revised",
            "review_claimed",
            "verdict_submitted",
            "review_closed",
        ]
    );
}

#[tokio::test]
async fn revise_requires_changes_requested() {
    let ctx = broker().await;
    let created = create_review(&ctx, "still pending").await;
    let review_id = created["review_id"].as_str().unwrap();

    let err = reviews::create_review(
        &ctx.broker,
        serde_json::from_value(json!({
            "intent": "premature revision",
            "agent_type": "gsd-executor",
            "agent_role": "proposer",
            "phase": "1",
            "review_id": review_id,
        }))
        .unwrap(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OpError::InvalidTransition { .. }));
}

#[tokio::test]
async fn only_proposer_may_close() {
    let ctx = broker().await;
    let created = create_review(&ctx, "close rules").await;
    let review_id = created["review_id"].as_str().unwrap().to_string();

    let claimed = claim(&ctx, &review_id, "rev-1").await;
    submit_verdict(
        &ctx,
        json!({
            "review_id": review_id,
            "verdict": "approved",
            "claim_generation": claimed["claim_generation"],
        }),
    )
    .await;

    let err = reviews::close_review(
        &ctx.broker,
        serde_json::from_value(json!({
            "review_id": review_id,
            "closer_role": "reviewer",
        }))
        .unwrap(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OpError::Forbidden(_)));

    close_review(&ctx, &review_id).await;
}

#[tokio::test]
async fn pending_review_cannot_be_closed() {
    let ctx = broker().await;
    let created = create_review(&ctx, "too early").await;

    let err = reviews::close_review(
        &ctx.broker,
        serde_json::from_value(json!({
            "review_id": created["review_id"],
            "closer_role": "proposer",
        }))
        .unwrap(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OpError::InvalidTransition { .. }));
}

#[tokio::test]
async fn closed_is_terminal() {
    let ctx = broker().await;
    let created = create_review(&ctx, "terminal").await;
    let review_id = created["review_id"].as_str().unwrap().to_string();

    let claimed = claim(&ctx, &review_id, "rev-1").await;
    submit_verdict(
        &ctx,
        json!({
            "review_id": review_id,
            "verdict": "approved",
            "claim_generation": claimed["claim_generation"],
        }),
    )
    .await;
    close_review(&ctx, &review_id).await;

    let err = reviews::close_review(
        &ctx.broker,
        serde_json::from_value(json!({
            "review_id": review_id,
            "closer_role": "proposer",
        }))
        .unwrap(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OpError::InvalidTransition { .. }));
}

#[tokio::test]
async fn missing_review_is_not_found() {
    let ctx = broker().await;
    let err = reviews::close_review(
        &ctx.broker,
        serde_json::from_value(json!({
            "review_id": "no-such-review",
            "closer_role": "proposer",
        }))
        .unwrap(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OpError::ReviewNotFound(_)));
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn audit_new_status_matches_review_status() {
    let ctx = broker().await;
    let created = create_review(&ctx, "audit consistency").await;
    let review_id = created["review_id"].as_str().unwrap().to_string();
    let claimed = claim(&ctx, &review_id, "rev-1").await;
    submit_verdict(
        &ctx,
        json!({
            "review_id": review_id,
            "verdict": "approved",
            "claim_generation": claimed["claim_generation"],
        }),
    )
    .await;

    let timeline = queries::get_review_timeline(
        &ctx.broker,
        serde_json::from_value(json!({ "review_id": review_id })).unwrap(),
    )
    .await
    .unwrap();
    let last = timeline["events"].as_array().unwrap().last().unwrap().clone();
    assert_eq!(last["new_status"], timeline["current_status"]);
}
