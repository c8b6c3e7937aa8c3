//! Thin wiring layer: named operations over JSON documents.
//!
//! A transport hands in an operation name and a params document and gets
//! back a success or `{error: ...}` document. Nothing here blocks the
//! caller beyond the operation itself.

use crate::broker::Broker;
use crate::error::OpError;
use crate::ops::{claims, messages, reviews, scaling, verdicts};
use crate::queries;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;

/// Operation names exposed to the transport.
pub const OPERATIONS: &[&str] = &[
    "create_review",
    "list_reviews",
    "claim_review",
    "submit_verdict",
    "accept_counter_patch",
    "reject_counter_patch",
    "add_message",
    "get_discussion",
    "close_review",
    "get_review_status",
    "get_proposal",
    "get_activity_feed",
    "get_review_timeline",
    "get_audit_log",
    "get_review_stats",
    "spawn_reviewer",
    "kill_reviewer",
    "list_reviewers",
];

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, OpError> {
    serde_json::from_value(params).map_err(|err| OpError::InvalidInput(err.to_string()))
}

/// Dispatch one operation. Errors become `{error: ...}` documents; the
/// contract never surfaces a panic or a raw driver error.
pub async fn dispatch(broker: &Arc<Broker>, operation: &str, params: Value) -> Value {
    let result = dispatch_inner(broker, operation, params).await;
    match result {
        Ok(doc) => doc,
        Err(err) => err.to_document(),
    }
}

async fn dispatch_inner(
    broker: &Arc<Broker>,
    operation: &str,
    params: Value,
) -> Result<Value, OpError> {
    match operation {
        "create_review" => reviews::create_review(broker, parse_params(params)?).await,
        "list_reviews" => queries::list_reviews(broker, parse_params(params)?).await,
        "claim_review" => claims::claim_review(broker, parse_params(params)?).await,
        "submit_verdict" => verdicts::submit_verdict(broker, parse_params(params)?).await,
        "accept_counter_patch" => {
            verdicts::accept_counter_patch(broker, parse_params(params)?).await
        }
        "reject_counter_patch" => {
            verdicts::reject_counter_patch(broker, parse_params(params)?).await
        }
        "add_message" => messages::add_message(broker, parse_params(params)?).await,
        "get_discussion" => queries::get_discussion(broker, parse_params(params)?).await,
        "close_review" => reviews::close_review(broker, parse_params(params)?).await,
        "get_review_status" => queries::get_review_status(broker, parse_params(params)?).await,
        "get_proposal" => queries::get_proposal(broker, parse_params(params)?).await,
        "get_activity_feed" => queries::get_activity_feed(broker, parse_params(params)?).await,
        "get_review_timeline" => {
            queries::get_review_timeline(broker, parse_params(params)?).await
        }
        "get_audit_log" => queries::get_audit_log(broker, parse_params(params)?).await,
        "get_review_stats" => queries::get_review_stats(broker).await,
        "spawn_reviewer" => scaling::spawn_reviewer(broker).await,
        "kill_reviewer" => scaling::kill_reviewer(broker, parse_params(params)?).await,
        "list_reviewers" => scaling::list_reviewers(broker).await,
        _ => Ok(json!({ "error": format!("Unknown operation: {operation}") })),
    }
}
