use funnel_core::error::{FunnelError, FunnelResult};
use serde::Serialize;

use crate::types::EnrollmentStatus;

/// Describes a single valid status transition for an enrollment.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StateTransition {
    pub from: EnrollmentStatus,
    pub to: EnrollmentStatus,
    pub trigger: &'static str,
}

/// Every transition an enrollment may take. Creation (NOT_ENROLLED → ACTIVE)
/// is not a transition of an existing record and is not listed.
pub const TRANSITIONS: &[StateTransition] = &[
    // Active ->
    StateTransition {
        from: EnrollmentStatus::Active,
        to: EnrollmentStatus::Paused,
        trigger: "pause",
    },
    StateTransition {
        from: EnrollmentStatus::Active,
        to: EnrollmentStatus::Completed,
        trigger: "last_stage_sent",
    },
    StateTransition {
        from: EnrollmentStatus::Active,
        to: EnrollmentStatus::Active,
        trigger: "re_entry_restart",
    },
    // Paused ->
    StateTransition {
        from: EnrollmentStatus::Paused,
        to: EnrollmentStatus::Active,
        trigger: "resume",
    },
    StateTransition {
        from: EnrollmentStatus::Paused,
        to: EnrollmentStatus::Completed,
        trigger: "last_stage_sent",
    },
    // Completed ->
    StateTransition {
        from: EnrollmentStatus::Completed,
        to: EnrollmentStatus::Active,
        trigger: "re_entry_restart",
    },
];

/// Guards enrollment lifecycle changes against the transition table.
#[derive(Debug, Clone, Copy)]
pub struct EnrollmentStateMachine {
    pub state: EnrollmentStatus,
}

impl EnrollmentStateMachine {
    pub fn new(state: EnrollmentStatus) -> Self {
        Self { state }
    }

    pub fn can_transition(from: EnrollmentStatus, to: EnrollmentStatus) -> bool {
        TRANSITIONS.iter().any(|t| t.from == from && t.to == to)
    }

    /// Move to `to`, returning the trigger name of the transition taken.
    pub fn transition(&mut self, to: EnrollmentStatus) -> FunnelResult<&'static str> {
        match TRANSITIONS
            .iter()
            .find(|t| t.from == self.state && t.to == to)
        {
            Some(t) => {
                self.state = to;
                Ok(t.trigger)
            }
            None => Err(FunnelError::validation(format!(
                "Invalid state transition from {:?} to {:?}",
                self.state, to
            ))),
        }
    }
}
