use taskline_types::InvalidTransition;
use thiserror::Error;

pub const BUDGET_EXCEEDED_MARKER: &str = "Budget has been exceeded";

#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("Budget has been exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid state: {0}")]
    InvalidState(#[from] InvalidTransition),

}

/// How the dispatcher reacts to a failed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Budget,
    Cancelled,
    Other,
}

pub fn classify_failure(err: &anyhow::Error) -> FailureKind {
    for cause in err.chain() {
        if let Some(known) = cause.downcast_ref::<ControlPlaneError>() {
            match known {
                ControlPlaneError::BudgetExceeded(_) => return FailureKind::Budget,
                ControlPlaneError::Cancelled => return FailureKind::Cancelled,
                _ => {}
            }
        }
    }
    if err.to_string().contains(BUDGET_EXCEEDED_MARKER) {
        return FailureKind::Budget;
    }
    FailureKind::Other
}
