//! Per-unit status machine.
//!
//! ```text
//! pending ──► running ──► completed ──► rolled_back
//!                │            │              │
//!                ▼            └─(force)──┐   │
//!              failed ────────► running ◄┴───┘
//! ```

use crate::{EngineError, UnitRef, UnitStatus};

impl UnitStatus {
    /// Whether a run may start this unit without `force`.
    #[must_use]
    pub fn is_runnable(self) -> bool {
        matches!(self, Self::Pending | Self::Failed | Self::RolledBack)
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Pending | Self::Failed | Self::RolledBack | Self::Completed,
                Self::Running
            ) | (Self::Running, Self::Completed | Self::Failed)
                | (Self::Completed, Self::RolledBack)
        )
    }
}

/// # Errors
/// Returns [`EngineError::Validation`] when `from -> to` is not a legal transition.
pub fn ensure_transition(
    unit: UnitRef,
    from: UnitStatus,
    to: UnitStatus,
) -> Result<(), EngineError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "{unit} cannot move from {} to {}",
            from.as_str(),
            to.as_str()
        )))
    }
}
