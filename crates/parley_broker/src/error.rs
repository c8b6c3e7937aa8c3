//! Operation error taxonomy.
//!
//! Operations never panic or propagate raw driver errors across the
//! contract: every failure maps to one of these kinds and is rendered as
//! an `{error: ...}` document by the bindings layer.

use serde_json::{json, Value};
use thiserror::Error;

/// Errors surfaced by broker operations.
#[derive(Debug, Error)]
pub enum OpError {
    #[error("Review not found: {0}")]
    ReviewNotFound(String),

    #[error("Reviewer not found: {0}")]
    ReviewerNotFound(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Review {review_id} is reserved for reviewer {reviewer_id}")]
    ReservedForReviewer {
        review_id: String,
        reviewer_id: String,
    },

    #[error("Stale claim: generation {provided} does not match current generation {current}")]
    StaleClaim { provided: i64, current: i64 },

    #[error("Unauthorized: review is claimed by {claimed_by}, not {reviewer_id}")]
    Unauthorized {
        claimed_by: String,
        reviewer_id: String,
    },

    #[error("Turn violation: consecutive messages must alternate sender_role (last sender was {last_sender})")]
    TurnViolation { last_sender: String },

    #[error("Messages are not allowed while review status is {status}")]
    NotAllowedInState { status: String },

    #[error("Diff validation failed: {0}")]
    InvalidDiff(String),

    #[error("Counter-patch validation failed: {0}")]
    InvalidCounterPatch(String),

    #[error("Counter-patch no longer applies: {0}")]
    StaleCounterPatch(String),

    #[error("Spawn cooldown active")]
    CooldownActive { retry_after_seconds: f64 },

    #[error("Reviewer pool cap reached")]
    PoolCapReached { max_pool_size: u32 },

    #[error("Reviewer pool is not configured")]
    PoolDisabled,

    #[error("{operation} failed due to database error: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("{operation} failed: {message}")]
    Internal {
        operation: &'static str,
        message: String,
    },
}

impl OpError {
    pub fn store(operation: &'static str, source: sqlx::Error) -> Self {
        OpError::Store { operation, source }
    }

    pub fn internal(operation: &'static str, message: impl Into<String>) -> Self {
        OpError::Internal {
            operation,
            message: message.into(),
        }
    }

    /// Render as the stable `{error: ...}` document the transport returns.
    pub fn to_document(&self) -> Value {
        match self {
            OpError::CooldownActive {
                retry_after_seconds,
            } => json!({
                "error": "Spawn cooldown active",
                "retry_after_seconds": retry_after_seconds,
            }),
            OpError::PoolCapReached { max_pool_size } => json!({
                "error": "Reviewer pool cap reached",
                "max_pool_size": max_pool_size,
            }),
            OpError::ReservedForReviewer {
                review_id: _,
                reviewer_id,
            } => json!({
                "error": self.to_string(),
                "reserved_for": reviewer_id,
            }),
            OpError::StaleClaim { provided, current } => json!({
                "error": self.to_string(),
                "provided_generation": provided,
                "current_generation": current,
            }),
            _ => json!({ "error": self.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_document_carries_retry_hint() {
        let doc = OpError::CooldownActive {
            retry_after_seconds: 4.5,
        }
        .to_document();
        assert_eq!(doc["error"], "Spawn cooldown active");
        assert_eq!(doc["retry_after_seconds"], 4.5);
    }

    #[test]
    fn stale_claim_document_names_both_generations() {
        let doc = OpError::StaleClaim {
            provided: 1,
            current: 2,
        }
        .to_document();
        assert!(doc["error"].as_str().unwrap().starts_with("Stale claim"));
        assert_eq!(doc["provided_generation"], 1);
        assert_eq!(doc["current_generation"], 2);
    }
}
