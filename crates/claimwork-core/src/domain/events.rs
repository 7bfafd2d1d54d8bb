//! Events - ドメインイベント
//!
//! Structured observations of queue calls and task state changes, delivered to
//! an `EventSink`. They never feed back into the call path.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::errors::ErrorKind;
use super::ids::TaskRef;
use super::state::TaskStatus;

/// Queue operations a worker issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOp {
    ClaimTask,
    ReclaimTask,
    ReportCompleted,
    ReportFailed,
    ReportException,
    CreateArtifact,
    PollTaskUrls,
}

impl QueueOp {
    pub fn is_report(self) -> bool {
        matches!(
            self,
            QueueOp::ReportCompleted | QueueOp::ReportFailed | QueueOp::ReportException
        )
    }
}

/// Result of one observed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "kind", rename_all = "snake_case")]
pub enum CallResult {
    Ok,
    Err(ErrorKind),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A queue call is about to be sent. Emitted even if the call then hangs
    /// or is abandoned.
    QueueCallStarted {
        op: QueueOp,
        task: Option<TaskRef>,
        client_id: Option<String>,
    },

    /// One queue call, after it returned.
    QueueCall {
        op: QueueOp,
        task: Option<TaskRef>,
        /// Client id of the credentials the call was made with.
        client_id: Option<String>,
        result: CallResult,
    },

    /// Local state machine transition.
    StateChanged {
        task: TaskRef,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Claim renewed by the reclaim scheduler.
    ClaimRenewed {
        task: TaskRef,
        client_id: String,
        taken_until: DateTime<Utc>,
    },

    /// One artifact upload attempt.
    UploadAttempt {
        task: TaskRef,
        name: String,
        attempt: u32,
        status: Option<u16>,
    },
}

impl DomainEvent {
    pub fn task(&self) -> Option<&TaskRef> {
        match self {
            DomainEvent::QueueCallStarted { task, .. } | DomainEvent::QueueCall { task, .. } => {
                task.as_ref()
            }
            DomainEvent::StateChanged { task, .. }
            | DomainEvent::ClaimRenewed { task, .. }
            | DomainEvent::UploadAttempt { task, .. } => Some(task),
        }
    }
}
