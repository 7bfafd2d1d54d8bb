//! Task state machine for a claimed run.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Local view of a task run's lifecycle.
///
/// State transitions:
/// - Unclaimed -> Claimed -> Running
/// - Running -> Lost (reclaim conflict, or expiry without renewal)
/// - Running -> ReportedCompleted | ReportedFailed | ReportedException
///
/// `Lost` and the `Reported*` states are terminal: no queue call is issued
/// from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Unclaimed,
    Claimed,
    Running,
    Lost,
    ReportedCompleted,
    ReportedFailed,
    ReportedException,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Lost
                | TaskStatus::ReportedCompleted
                | TaskStatus::ReportedFailed
                | TaskStatus::ReportedException
        )
    }

    /// Do we currently believe we hold the claim?
    pub fn holds_claim(self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Running)
    }

    pub fn is_reported(self) -> bool {
        matches!(
            self,
            TaskStatus::ReportedCompleted
                | TaskStatus::ReportedFailed
                | TaskStatus::ReportedException
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Unclaimed => "unclaimed",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Lost => "lost",
            TaskStatus::ReportedCompleted => "reported_completed",
            TaskStatus::ReportedFailed => "reported_failed",
            TaskStatus::ReportedException => "reported_exception",
        };
        f.write_str(s)
    }
}
