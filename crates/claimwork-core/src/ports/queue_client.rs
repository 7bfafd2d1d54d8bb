//! QueueClient port - タスク調整キューへの呼び出し
//!
//! The queue server and its HTTP client live elsewhere. This trait is the seam;
//! `QueueError::from_status` is the one place a status code becomes an error
//! kind, so call sites branch on `ErrorKind::Conflict`, never on `409`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ClaimCredentials, ErrorKind, ExceptionReason, RunId, TaskId, TaskRef, WorkerInfo};

/// Successful `claimTask` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResponse {
    pub credentials: ClaimCredentials,
    /// Task definition (opaque to the claim machinery).
    pub task: serde_json::Value,
    pub taken_until: DateTime<Utc>,
}

/// Successful `reclaimTask` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimResponse {
    pub credentials: ClaimCredentials,
    pub taken_until: DateTime<Utc>,
}

/// `createArtifact` request options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRequest {
    pub content_type: String,
    pub expires: DateTime<Utc>,
}

/// Where to upload an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    pub content_type: String,
    #[serde(rename = "putUrl")]
    pub upload_destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("claim conflict (HTTP {status}): {message}")]
    Conflict { status: u16, message: String },

    #[error("task unavailable (HTTP {status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("transient queue failure: {message}")]
    Transient { status: Option<u16>, message: String },

    #[error("malformed queue exchange: {message}")]
    Malformed { status: Option<u16>, message: String },
}

impl QueueError {
    /// Translate a non-success HTTP status.
    ///
    /// - 409 -> Conflict
    /// - 404, 410 -> Unavailable
    /// - 408, 429, 5xx -> Transient
    /// - other 4xx -> Malformed
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            409 => QueueError::Conflict { status, message },
            404 | 410 => QueueError::Unavailable { status, message },
            408 | 429 | 500..=599 => QueueError::Transient {
                status: Some(status),
                message,
            },
            _ => QueueError::Malformed {
                status: Some(status),
                message,
            },
        }
    }

    /// Network-level failure (no status at all).
    pub fn transport(message: impl Into<String>) -> Self {
        QueueError::Transient {
            status: None,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        QueueError::Malformed {
            status: None,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Conflict { .. } => ErrorKind::Conflict,
            QueueError::Unavailable { .. } => ErrorKind::Unavailable,
            QueueError::Transient { .. } => ErrorKind::Transient,
            QueueError::Malformed { .. } => ErrorKind::Malformed,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            QueueError::Conflict { status, .. } | QueueError::Unavailable { status, .. } => {
                Some(*status)
            }
            QueueError::Transient { status, .. } | QueueError::Malformed { status, .. } => *status,
        }
    }
}

/// Capability surface of the task-coordination queue.
///
/// # 設計原則
/// - 呼び出しは全て timeout 付き（呼び出し側で制御）
/// - 認証は claim 時に渡された credentials を使う
#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn claim_task(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        worker: &WorkerInfo,
    ) -> Result<ClaimResponse, QueueError>;

    async fn reclaim_task(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
    ) -> Result<ReclaimResponse, QueueError>;

    async fn report_completed(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
    ) -> Result<(), QueueError>;

    async fn report_failed(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
    ) -> Result<(), QueueError>;

    async fn report_exception(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
        reason: ExceptionReason,
    ) -> Result<(), QueueError>;

    async fn create_artifact(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
        name: &str,
        request: &ArtifactRequest,
    ) -> Result<UploadTarget, QueueError>;

    /// Runs currently offered to this worker type.
    async fn poll_task_urls(&self, worker: &WorkerInfo) -> Result<Vec<TaskRef>, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::conflict(409, ErrorKind::Conflict)]
    #[case::not_found(404, ErrorKind::Unavailable)]
    #[case::gone(410, ErrorKind::Unavailable)]
    #[case::timeout(408, ErrorKind::Transient)]
    #[case::throttled(429, ErrorKind::Transient)]
    #[case::server(500, ErrorKind::Transient)]
    #[case::gateway(503, ErrorKind::Transient)]
    #[case::bad_request(400, ErrorKind::Malformed)]
    #[case::forbidden(403, ErrorKind::Malformed)]
    fn status_translation(#[case] status: u16, #[case] kind: ErrorKind) {
        let err = QueueError::from_status(status, "x");
        assert_eq!(err.kind(), kind);
        assert_eq!(err.status(), Some(status));
    }

    #[test]
    fn transport_failures_are_transient_without_status() {
        let err = QueueError::transport("connection reset");
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.status(), None);
    }

    #[test]
    fn upload_target_uses_put_url_on_the_wire() {
        let t: UploadTarget =
            serde_json::from_str(r#"{"contentType": "text/plain", "putUrl": "https://x/y"}"#).unwrap();
        assert_eq!(t.upload_destination, "https://x/y");
        assert_eq!(t.content_type, "text/plain");
    }
}
