//! Shared vocabulary types for the Parley review broker.
//!
//! Everything the broker persists or puts on the wire speaks in these
//! types: review lifecycle states, verdicts, priorities, audit event
//! kinds, and the agent identity attached to every submission.

mod types;

pub use types::{
    AffectedFile, AgentIdentity, AuditEventType, CounterPatchStatus, ParseStatusError, Priority,
    ReviewStatus, ReviewerStatus, Verdict,
};
