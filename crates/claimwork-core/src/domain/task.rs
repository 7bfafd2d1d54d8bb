//! Task record: identity, claim credentials and lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{RunId, TaskId, TaskRef};
use super::state::TaskStatus;

/// Short-lived scoped credentials granted with a claim.
///
/// Replaced wholesale on every successful reclaim; artifact and report calls
/// always use the most recent set.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimCredentials {
    pub client_id: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

impl ClaimCredentials {
    pub fn new(client_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            access_token: access_token.into(),
            certificate: None,
        }
    }

    pub fn with_certificate(mut self, certificate: impl Into<String>) -> Self {
        self.certificate = Some(certificate.into());
        self
    }
}

// access_token はログに出さない
impl fmt::Debug for ClaimCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimCredentials")
            .field("client_id", &self.client_id)
            .field("access_token", &"<redacted>")
            .field("certificate", &self.certificate.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A task run as seen by this worker.
///
/// Design:
/// - Owned by exactly one `TaskClaimManager`; nobody else mutates it.
/// - Callers get clones (snapshots), never a live reference.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub task_id: TaskId,
    pub run_id: RunId,

    /// Opaque task definition/payload handed to the executor.
    pub payload: serde_json::Value,

    pub status: TaskStatus,

    #[serde(skip)]
    pub credentials: Option<ClaimCredentials>,

    /// Claim expiry. An unrenewed claim is void after this instant.
    pub taken_until: Option<DateTime<Utc>>,
}

impl Task {
    pub fn unclaimed(task_id: TaskId, run_id: RunId) -> Self {
        Self {
            task_id,
            run_id,
            payload: serde_json::Value::Null,
            status: TaskStatus::Unclaimed,
            credentials: None,
            taken_until: None,
        }
    }

    pub fn task_ref(&self) -> TaskRef {
        TaskRef::new(self.task_id.clone(), self.run_id)
    }

    /// Unclaimed -> Claimed.
    pub fn mark_claimed(
        &mut self,
        payload: serde_json::Value,
        credentials: ClaimCredentials,
        taken_until: DateTime<Utc>,
    ) {
        self.payload = payload;
        self.credentials = Some(credentials);
        self.taken_until = Some(taken_until);
        self.status = TaskStatus::Claimed;
    }

    /// Claimed -> Running.
    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
    }

    /// Swap in credentials and expiry from a successful reclaim.
    pub fn renew(&mut self, credentials: ClaimCredentials, taken_until: DateTime<Utc>) {
        self.credentials = Some(credentials);
        self.taken_until = Some(taken_until);
    }

    pub fn mark_lost(&mut self) {
        self.status = TaskStatus::Lost;
    }

    pub fn mark_reported(&mut self, status: TaskStatus) {
        debug_assert!(status.is_reported());
        self.status = status;
    }

    /// Has the claim window already lapsed at `now`?
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.taken_until {
            Some(until) => now >= until,
            None => true,
        }
    }
}
