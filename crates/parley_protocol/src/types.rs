//! Canonical enums and payload types shared across the broker crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {kind}: {value:?}")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseStatusError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Review lifecycle states.
///
/// This is the CANONICAL definition - the store CHECK constraint, the state
/// machine, and all operation documents use these spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Claimed,
    InReview,
    Approved,
    ChangesRequested,
    Closed,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Claimed => "claimed",
            ReviewStatus::InReview => "in_review",
            ReviewStatus::Approved => "approved",
            ReviewStatus::ChangesRequested => "changes_requested",
            ReviewStatus::Closed => "closed",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReviewStatus::Closed)
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReviewStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReviewStatus::Pending),
            "claimed" => Ok(ReviewStatus::Claimed),
            "in_review" => Ok(ReviewStatus::InReview),
            "approved" => Ok(ReviewStatus::Approved),
            "changes_requested" => Ok(ReviewStatus::ChangesRequested),
            "closed" => Ok(ReviewStatus::Closed),
            _ => Err(ParseStatusError::new("review status", s)),
        }
    }
}

/// Reviewer worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewerStatus {
    Active,
    Draining,
    Terminated,
}

impl ReviewerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewerStatus::Active => "active",
            ReviewerStatus::Draining => "draining",
            ReviewerStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ReviewerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReviewerStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ReviewerStatus::Active),
            "draining" => Ok(ReviewerStatus::Draining),
            "terminated" => Ok(ReviewerStatus::Terminated),
            _ => Err(ParseStatusError::new("reviewer status", s)),
        }
    }
}

/// Review priority, inferred once at creation from the agent identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Priority::Critical),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            _ => Err(ParseStatusError::new("priority", s)),
        }
    }
}

/// Reviewer verdict. Only `Approved` and `ChangesRequested` change state;
/// `Comment` leaves the review where it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    ChangesRequested,
    Comment,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approved => "approved",
            Verdict::ChangesRequested => "changes_requested",
            Verdict::Comment => "comment",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Verdict::Approved),
            "changes_requested" => Ok(Verdict::ChangesRequested),
            "comment" => Ok(Verdict::Comment),
            _ => Err(ParseStatusError::new("verdict", s)),
        }
    }
}

/// Status of a counter-patch offered by a reviewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterPatchStatus {
    Pending,
    Accepted,
    Rejected,
}

impl CounterPatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterPatchStatus::Pending => "pending",
            CounterPatchStatus::Accepted => "accepted",
            CounterPatchStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for CounterPatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CounterPatchStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CounterPatchStatus::Pending),
            "accepted" => Ok(CounterPatchStatus::Accepted),
            "rejected" => Ok(CounterPatchStatus::Rejected),
            _ => Err(ParseStatusError::new("counter patch status", s)),
        }
    }
}

/// Audit event kinds recorded in the append-only `audit_events` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ReviewCreated,
    ReviewRevised,
    ReviewClaimed,
    ReviewAutoRejected,
    VerdictSubmitted,
    VerdictComment,
    ReviewClosed,
    CounterPatchAccepted,
    CounterPatchRejected,
    MessageSent,
    ReviewerSpawned,
    ReviewerDrainStart,
    ReviewerTerminated,
    ReviewReclaimed,
    ReviewDetached,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::ReviewCreated => "review_created",
            AuditEventType::ReviewRevised => "review_revised",
            AuditEventType::ReviewClaimed => "review_claimed",
            AuditEventType::ReviewAutoRejected => "review_auto_rejected",
            AuditEventType::VerdictSubmitted => "verdict_submitted",
            AuditEventType::VerdictComment => "verdict_comment",
            AuditEventType::ReviewClosed => "review_closed",
            AuditEventType::CounterPatchAccepted => "counter_patch_accepted",
            AuditEventType::CounterPatchRejected => "counter_patch_rejected",
            AuditEventType::MessageSent => "message_sent",
            AuditEventType::ReviewerSpawned => "reviewer_spawned",
            AuditEventType::ReviewerDrainStart => "reviewer_drain_start",
            AuditEventType::ReviewerTerminated => "reviewer_terminated",
            AuditEventType::ReviewReclaimed => "review_reclaimed",
            AuditEventType::ReviewDetached => "review_detached",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of the agent submitting a review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// e.g. "gsd-executor", "gsd-planner"
    pub agent_type: String,
    /// "proposer" or "reviewer"
    pub agent_role: String,
    /// e.g. "1", "05-verify"
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

/// One file touched by a unified diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedFile {
    pub path: String,
    /// "create", "delete", or "modify"
    pub operation: String,
    pub added: u64,
    pub removed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_status_round_trips_through_strings() {
        for status in [
            ReviewStatus::Pending,
            ReviewStatus::Claimed,
            ReviewStatus::InReview,
            ReviewStatus::Approved,
            ReviewStatus::ChangesRequested,
            ReviewStatus::Closed,
        ] {
            assert_eq!(status.as_str().parse::<ReviewStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = "bogus".parse::<ReviewStatus>().unwrap_err();
        assert_eq!(err.kind, "review status");
    }

    #[test]
    fn verdict_serde_uses_snake_case() {
        let json = serde_json::to_string(&Verdict::ChangesRequested).unwrap();
        assert_eq!(json, "\"changes_requested\"");
    }

    #[test]
    fn affected_file_serializes_all_fields() {
        let file = AffectedFile {
            path: "src/lib.rs".to_string(),
            operation: "modify".to_string(),
            added: 3,
            removed: 1,
        };
        let value = serde_json::to_value(&file).unwrap();
        assert_eq!(value["path"], "src/lib.rs");
        assert_eq!(value["operation"], "modify");
        assert_eq!(value["added"], 3);
        assert_eq!(value["removed"], 1);
    }
}
