//! Errors - エラー型と分類
//!
//! Every task-level failure is a [`WorkerError`]: a kind from the shared
//! taxonomy, the phase it happened in, and the task/run it belongs to.

use serde::Serialize;
use std::fmt;

use super::ids::{RunId, TaskId, TaskRef};

/// ErrorKind は実行エラーの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Claim/reclaim lost to another owner. Terminal, never retried.
    Conflict,
    /// The queue does not offer this task/run (already resolved, unknown, ...).
    Unavailable,
    /// Network or server-side failure. Retried with bounded backoff.
    Transient,
    /// Unexpected request/response shape. Not retryable.
    Malformed,
    /// Signer is not in the trusted key set.
    Untrusted,
    /// Content digest mismatch.
    Integrity,
    /// Claim window lapsed without confirmed renewal.
    Expired,
    /// Operation not allowed from the task's current state.
    InvalidState,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    /// Does this error mean the server no longer recognizes our claim?
    pub fn is_claim_gone(self) -> bool {
        matches!(self, ErrorKind::Conflict | ErrorKind::Unavailable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Transient => "transient",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Untrusted => "untrusted",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Expired => "expired",
            ErrorKind::InvalidState => "invalid_state",
        };
        f.write_str(s)
    }
}

/// Where in the task lifecycle an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Claim,
    Reclaim,
    Work,
    Artifact,
    Verify,
    Upload,
    Report,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Claim => "claim",
            Phase::Reclaim => "reclaim",
            Phase::Work => "work",
            Phase::Artifact => "artifact",
            Phase::Verify => "verify",
            Phase::Upload => "upload",
            Phase::Report => "report",
        };
        f.write_str(s)
    }
}

/// WorkerError はタスク単位のドメインエラー
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{kind} error during {phase} of task {task_id} run {run_id}: {message}")]
pub struct WorkerError {
    pub kind: ErrorKind,
    pub phase: Phase,
    pub task_id: TaskId,
    pub run_id: RunId,
    pub message: String,
}

impl WorkerError {
    pub fn new(kind: ErrorKind, phase: Phase, task: &TaskRef, message: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            task_id: task.task_id.clone(),
            run_id: task.run_id,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn task_ref(&self) -> TaskRef {
        TaskRef::new(self.task_id.clone(), self.run_id)
    }
}
