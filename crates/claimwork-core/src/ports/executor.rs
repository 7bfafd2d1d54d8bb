//! TaskExecutor port - payload の実行（sandbox は外部）

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{Artifact, ExceptionReason, Task};

/// What a finished payload produced.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub exit_code: i32,
    pub artifacts: Vec<Artifact>,
}

impl ExecutionReport {
    pub fn new(exit_code: i32) -> Self {
        Self {
            exit_code,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// The payload could not be run at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct ExecutionError {
    pub reason: ExceptionReason,
    pub message: String,
}

impl ExecutionError {
    pub fn new(reason: ExceptionReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Runs a claimed task's payload.
///
/// `cancel` fires when the claim is lost; implementations should stop promptly
/// since nothing they produce afterwards will be reported.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport, ExecutionError>;
}
