//! Status state machines for every record kind
//!
//! Each status set is a closed enum with an explicit transition table.
//! Writes that do not appear in the table are rejected.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a status change is not in the transition table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {entity} transition: {from} -> {to}")]
pub struct TransitionError {
    pub entity: &'static str,
    pub from: String,
    pub to: String,
}

/// Error returned when a stored or user-supplied string is not a known variant
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Common shape of a status state machine
pub trait Lifecycle: Copy + PartialEq + std::fmt::Display + Sized + 'static {
    /// Entity name used in error messages
    const ENTITY: &'static str;

    /// States reachable in one step from `self`
    fn allowed_next(&self) -> &'static [Self];

    fn can_transition_to(&self, to: Self) -> bool {
        self.allowed_next().contains(&to)
    }

    fn is_terminal(&self) -> bool {
        self.allowed_next().is_empty()
    }

    /// Validate a transition and return the new state
    fn transition(self, to: Self) -> Result<Self, TransitionError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(TransitionError {
                entity: Self::ENTITY,
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }
}

/// Implements `as_str`, `Display` and `FromStr` over a fixed wire vocabulary
macro_rules! wire_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $wire:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $wire),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($wire => Ok($ty::$variant),)+
                    _ => Err(ParseEnumError { kind: $kind, value: s.to_string() }),
                }
            }
        }
    };
}

pub(crate) use wire_enum;

/// Review state of a code review suggestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    /// Waiting for a human decision
    Pending,
    Approved,
    Rejected,
    /// Change has been applied to the source
    Applied,
}

wire_enum!(SuggestionStatus, "suggestion status", {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    Applied => "applied",
});

impl Lifecycle for SuggestionStatus {
    const ENTITY: &'static str = "suggestion";

    fn allowed_next(&self) -> &'static [Self] {
        use SuggestionStatus::*;
        match self {
            Pending => &[Approved, Rejected],
            Approved => &[Applied, Rejected],
            Rejected | Applied => &[],
        }
    }
}

/// Workflow state of a refactor proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Proposed,
    Approved,
    InProgress,
    Completed,
    Rejected,
}

wire_enum!(ProposalStatus, "proposal status", {
    Proposed => "proposed",
    Approved => "approved",
    InProgress => "in_progress",
    Completed => "completed",
    Rejected => "rejected",
});

impl Lifecycle for ProposalStatus {
    const ENTITY: &'static str = "proposal";

    fn allowed_next(&self) -> &'static [Self] {
        use ProposalStatus::*;
        match self {
            Proposed => &[Approved, Rejected],
            Approved => &[InProgress, Rejected],
            InProgress => &[Completed, Rejected],
            Completed | Rejected => &[],
        }
    }
}

/// Workflow state of a capability gap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapStatus {
    Detected,
    Proposed,
    Approved,
    Implemented,
    Rejected,
}

wire_enum!(GapStatus, "gap status", {
    Detected => "detected",
    Proposed => "proposed",
    Approved => "approved",
    Implemented => "implemented",
    Rejected => "rejected",
});

impl Lifecycle for GapStatus {
    const ENTITY: &'static str = "capability gap";

    fn allowed_next(&self) -> &'static [Self] {
        use GapStatus::*;
        match self {
            Detected => &[Proposed, Rejected],
            Proposed => &[Approved, Rejected],
            Approved => &[Implemented, Rejected],
            Implemented | Rejected => &[],
        }
    }
}

/// Progress of one action invocation in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Started,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

wire_enum!(ActionStatus, "action status", {
    Started => "started",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl Lifecycle for ActionStatus {
    const ENTITY: &'static str = "action log";

    fn allowed_next(&self) -> &'static [Self] {
        use ActionStatus::*;
        match self {
            Started => &[InProgress, Completed, Failed, Cancelled],
            InProgress => &[Completed, Failed, Cancelled],
            Completed | Failed | Cancelled => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggestion_transitions() {
        let approved = SuggestionStatus::Pending
            .transition(SuggestionStatus::Approved)
            .unwrap();
        assert_eq!(approved, SuggestionStatus::Approved);
        assert!(approved.can_transition_to(SuggestionStatus::Applied));

        let err = SuggestionStatus::Pending
            .transition(SuggestionStatus::Applied)
            .unwrap_err();
        assert_eq!(err.from, "pending");
        assert_eq!(err.to, "applied");
    }

    #[test]
    fn test_proposal_workflow() {
        let mut status = ProposalStatus::Proposed;
        for next in [
            ProposalStatus::Approved,
            ProposalStatus::InProgress,
            ProposalStatus::Completed,
        ] {
            status = status.transition(next).unwrap();
        }
        assert!(status.is_terminal());
        assert!(status.transition(ProposalStatus::Proposed).is_err());
    }

    #[test]
    fn test_gap_cannot_skip_review() {
        assert!(GapStatus::Detected
            .transition(GapStatus::Implemented)
            .is_err());
        assert!(GapStatus::Detected.can_transition_to(GapStatus::Rejected));
    }

    #[test]
    fn test_action_status_terminal_states() {
        for status in ActionStatus::ALL {
            let terminal = matches!(
                status,
                ActionStatus::Completed | ActionStatus::Failed | ActionStatus::Cancelled
            );
            assert_eq!(status.is_terminal(), terminal, "{status}");
        }
        assert!(ActionStatus::Failed
            .transition(ActionStatus::Completed)
            .is_err());
    }

    #[test]
    fn test_wire_strings() {
        assert_eq!(
            "in_progress".parse::<ProposalStatus>().unwrap(),
            ProposalStatus::InProgress
        );
        assert_eq!(" Pending ".parse::<SuggestionStatus>().unwrap(), SuggestionStatus::Pending);
        assert!("done".parse::<GapStatus>().is_err());
        assert_eq!(ActionStatus::Cancelled.to_string(), "cancelled");
    }
}
