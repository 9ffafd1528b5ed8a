//! Conversation stage transition table.
//!
//! Forward path:
//! New -> Qualified -> PreviewPendingApproval -> PreviewSent ->
//! PaymentPendingApproval -> PaymentSent -> Client -> Live
//! PreviewEditing -> PreviewPendingApproval (reworked preview resubmitted)
//! any non-terminal stage -> ClosedLost
//!
//! Backward (denial compensations only):
//! PreviewPendingApproval -> PreviewEditing
//! PaymentPendingApproval -> PreviewSent

use leadflow_core::types::ConversationStage;

use crate::error::ConversationError;

use super::Authority;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Classify a transition, or `None` if the table does not allow it.
pub fn classify(from: ConversationStage, to: ConversationStage) -> Option<Direction> {
    use ConversationStage::*;

    if to == ClosedLost {
        return (!from.is_terminal()).then_some(Direction::Forward);
    }
    match (from, to) {
        (New, Qualified)
        | (Qualified, PreviewPendingApproval)
        | (PreviewEditing, PreviewPendingApproval)
        | (PreviewPendingApproval, PreviewSent)
        | (PreviewSent, PaymentPendingApproval)
        | (PaymentPendingApproval, PaymentSent)
        | (PaymentSent, Client)
        | (Client, Live) => Some(Direction::Forward),
        (PreviewPendingApproval, PreviewEditing) | (PaymentPendingApproval, PreviewSent) => {
            Some(Direction::Backward)
        }
        _ => None,
    }
}

/// Validate a transition against the table and against what `authority`
/// is allowed to do.
pub fn validate_transition(
    from: ConversationStage,
    to: ConversationStage,
    authority: Authority,
) -> Result<Direction, ConversationError> {
    let direction =
        classify(from, to).ok_or(ConversationError::InvalidTransition(from, to))?;
    let allowed = match direction {
        Direction::Forward => authority.may_advance(),
        Direction::Backward => authority.may_revert(),
    };
    if allowed {
        Ok(direction)
    } else {
        Err(ConversationError::Unauthorized {
            authority,
            from,
            to,
        })
    }
}
