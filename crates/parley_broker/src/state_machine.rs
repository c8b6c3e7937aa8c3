//! Review lifecycle transition table.

use crate::error::OpError;
use parley_protocol::ReviewStatus;

/// Valid targets from each state.
///
/// claimed -> pending is the reclaim path; changes_requested -> pending is
/// the revise/requeue path.
pub fn allowed_targets(from: ReviewStatus) -> &'static [ReviewStatus] {
    use ReviewStatus::*;
    match from {
        Pending => &[Claimed],
        Claimed => &[Pending, InReview, Approved, ChangesRequested],
        InReview => &[Approved, ChangesRequested],
        Approved => &[Closed],
        ChangesRequested => &[Pending, Closed],
        Closed => &[],
    }
}

/// Validate a state transition.
pub fn validate_transition(from: ReviewStatus, to: ReviewStatus) -> Result<(), OpError> {
    if allowed_targets(from).contains(&to) {
        Ok(())
    } else {
        Err(OpError::InvalidTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReviewStatus::*;

    #[test]
    fn pending_can_only_be_claimed() {
        assert!(validate_transition(Pending, Claimed).is_ok());
        for target in [Pending, InReview, Approved, ChangesRequested, Closed] {
            assert!(validate_transition(Pending, target).is_err());
        }
    }

    #[test]
    fn claimed_supports_reclaim_and_verdicts() {
        assert!(validate_transition(Claimed, Pending).is_ok());
        assert!(validate_transition(Claimed, InReview).is_ok());
        assert!(validate_transition(Claimed, Approved).is_ok());
        assert!(validate_transition(Claimed, ChangesRequested).is_ok());
        assert!(validate_transition(Claimed, Closed).is_err());
    }

    #[test]
    fn changes_requested_allows_revise_and_close() {
        assert!(validate_transition(ChangesRequested, Pending).is_ok());
        assert!(validate_transition(ChangesRequested, Closed).is_ok());
        assert!(validate_transition(ChangesRequested, Claimed).is_err());
    }

    #[test]
    fn closed_is_terminal() {
        for target in [Pending, Claimed, InReview, Approved, ChangesRequested, Closed] {
            assert!(validate_transition(Closed, target).is_err());
        }
    }

    #[test]
    fn invalid_transition_error_names_both_states() {
        let err = validate_transition(Approved, Claimed).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("approved"));
        assert!(msg.contains("claimed"));
    }
}
