use serde::{Deserialize, Serialize};
use std::fmt;

/// Turn status of a task.
///
/// Within one turn the status only moves forward
/// (`confirming -> confirmed -> processing -> done`, skipping allowed).
/// `done -> confirming` is the single reset and opens the next turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Confirming,
    Confirmed,
    Processing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot move task from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Confirming => "confirming",
            TaskStatus::Confirmed => "confirmed",
            TaskStatus::Processing => "processing",
            TaskStatus::Done => "done",
        }
    }

    fn rank(self) -> u8 {
        match self {
            TaskStatus::Confirming => 0,
            TaskStatus::Confirmed => 1,
            TaskStatus::Processing => 2,
            TaskStatus::Done => 3,
        }
    }

    pub fn can_transition(self, to: TaskStatus) -> bool {
        if self == to {
            return true;
        }
        if self == TaskStatus::Done {
            return to == TaskStatus::Confirming;
        }
        to.rank() > self.rank()
    }

    pub fn transition(self, to: TaskStatus) -> Result<TaskStatus, InvalidTransition> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    pub fn is_done(self) -> bool {
        self == TaskStatus::Done
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_moves_are_legal() {
        let status = TaskStatus::Confirming
            .transition(TaskStatus::Confirmed)
            .and_then(|s| s.transition(TaskStatus::Processing))
            .and_then(|s| s.transition(TaskStatus::Done))
            .expect("forward path");
        assert_eq!(status, TaskStatus::Done);
        assert!(TaskStatus::Confirming.can_transition(TaskStatus::Done));
    }

    #[test]
    fn done_only_resets_to_confirming() {
        assert!(TaskStatus::Done.can_transition(TaskStatus::Confirming));
        assert!(!TaskStatus::Done.can_transition(TaskStatus::Processing));
        assert!(!TaskStatus::Done.can_transition(TaskStatus::Confirmed));
    }

    #[test]
    fn backward_moves_are_rejected() {
        let err = TaskStatus::Processing
            .transition(TaskStatus::Confirmed)
            .expect_err("backward move");
        assert_eq!(err.from, TaskStatus::Processing);
        assert_eq!(err.to.to_string(), "confirmed");
    }
}
