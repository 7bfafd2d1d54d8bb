//! Outcome model: what a finished run reports back to the queue.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::TaskStatus;

/// Exception reasons understood by the queue's `reportException` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExceptionReason {
    WorkerShutdown,
    MalformedPayload,
    ResourceUnavailable,
    InternalError,
    Superseded,
    IntermittentTask,
}

impl ExceptionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExceptionReason::WorkerShutdown => "worker-shutdown",
            ExceptionReason::MalformedPayload => "malformed-payload",
            ExceptionReason::ResourceUnavailable => "resource-unavailable",
            ExceptionReason::InternalError => "internal-error",
            ExceptionReason::Superseded => "superseded",
            ExceptionReason::IntermittentTask => "intermittent-task",
        }
    }
}

impl fmt::Display for ExceptionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal resolution of a run.
///
/// - `Completed`: the payload ran and succeeded.
/// - `Failed`: the payload ran and failed (non-zero exit, bad artifact, ...).
/// - `Exception`: the worker could not run the payload properly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resolution", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
    Exception(ExceptionReason),
}

impl Outcome {
    /// Exit code 0 is success, anything else a failure.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Outcome::Completed
        } else {
            Outcome::Failed
        }
    }

    /// Status the task moves to once this outcome is acknowledged.
    pub fn reported_status(self) -> TaskStatus {
        match self {
            Outcome::Completed => TaskStatus::ReportedCompleted,
            Outcome::Failed => TaskStatus::ReportedFailed,
            Outcome::Exception(_) => TaskStatus::ReportedException,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_map_to_outcomes() {
        assert_eq!(Outcome::from_exit_code(0), Outcome::Completed);
        assert_eq!(Outcome::from_exit_code(1), Outcome::Failed);
        assert_eq!(Outcome::from_exit_code(-9), Outcome::Failed);
    }

    #[test]
    fn reason_serializes_in_queue_vocabulary() {
        let s = serde_json::to_string(&ExceptionReason::MalformedPayload).unwrap();
        assert_eq!(s, "\"malformed-payload\"");
        assert_eq!(ExceptionReason::WorkerShutdown.to_string(), "worker-shutdown");
    }

    #[test]
    fn outcome_is_tagged() {
        let v = serde_json::to_value(Outcome::Exception(ExceptionReason::Superseded)).unwrap();
        assert_eq!(v["resolution"], "exception");
        assert_eq!(v["reason"], "superseded");
        assert_eq!(
            Outcome::Exception(ExceptionReason::Superseded).reported_status(),
            TaskStatus::ReportedException
        );
    }
}
