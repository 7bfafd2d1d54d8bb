//! Domain identifiers (strongly-typed IDs).
//!
//! The queue hands out task ids as opaque slugs and run ids as small integers.
//! Both are wrapped so a run id can never be passed where a task id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Identifier of a task as issued by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one run of a task. Every retry on the queue side is a new run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(u32);

impl RunId {
    pub fn new(n: u32) -> Self {
        Self(n)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// `(task_id, run_id)` pair: the unit a claim is granted for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub task_id: TaskId,
    pub run_id: RunId,
}

impl TaskRef {
    pub fn new(task_id: TaskId, run_id: RunId) -> Self {
        Self { task_id, run_id }
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task_id, self.run_id)
    }
}

/// Identity this worker presents to the queue when claiming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub provisioner_id: String,
    pub worker_type: String,
    pub worker_group: String,
    pub worker_id: String,
}

impl WorkerInfo {
    pub fn new(
        provisioner_id: impl Into<String>,
        worker_type: impl Into<String>,
        worker_group: impl Into<String>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            provisioner_id: provisioner_id.into(),
            worker_type: worker_type.into(),
            worker_group: worker_group.into(),
            worker_id: worker_id.into(),
        }
    }

    /// Same as [`WorkerInfo::new`] but with a freshly generated ULID worker id.
    ///
    /// ULID は時刻でソート可能なので、ログ上でワーカーの起動順が追える。
    pub fn generated(
        provisioner_id: impl Into<String>,
        worker_type: impl Into<String>,
        worker_group: impl Into<String>,
    ) -> Self {
        Self::new(
            provisioner_id,
            worker_type,
            worker_group,
            format!("worker-{}", Ulid::new().to_string().to_lowercase()),
        )
    }
}
