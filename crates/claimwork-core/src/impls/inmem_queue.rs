//! InMemoryQueueClient - 開発・テスト用のキュー
//!
//! # 特徴
//! - Mutex で排他制御（ロックを跨いで await しない）
//! - claim/reclaim ごとに新しい credentials（`client-{n}`）を発行
//! - 古い credentials での呼び出しは 401 で拒否する
//! - 操作ごとに失敗/ハングを台本として積める
//!
//! Scripted replies are consumed in FIFO order per operation, before any real
//! state is touched.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::domain::{ClaimCredentials, ExceptionReason, QueueOp, RunId, TaskId, TaskRef, WorkerInfo};
use crate::ports::{
    ArtifactRequest, ClaimResponse, Clock, QueueClient, QueueError, ReclaimResponse, SystemClock,
    UploadTarget,
};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Fail(QueueError),
    /// Never answer (exercises caller timeouts).
    Hang,
}

#[derive(Debug, Clone)]
struct RunState {
    client_id: String,
    resolution: Option<QueueOp>,
    artifacts: Vec<String>,
}

#[derive(Default)]
struct State {
    pending: VecDeque<(TaskRef, serde_json::Value)>,
    /// Handed out by a poll, not yet claimed.
    offered: HashMap<TaskRef, serde_json::Value>,
    runs: HashMap<TaskRef, RunState>,
    scripted: HashMap<QueueOp, VecDeque<Reply>>,
    issued: u64,
}

impl State {
    fn issue(&mut self) -> ClaimCredentials {
        self.issued += 1;
        ClaimCredentials::new(
            format!("client-{}", self.issued),
            format!("token-{}", self.issued),
        )
    }

    /// The run must be claimed, unresolved, and addressed with its latest
    /// credentials.
    fn active_run(
        &mut self,
        task: &TaskRef,
        credentials: &ClaimCredentials,
    ) -> Result<&mut RunState, QueueError> {
        let Some(run) = self.runs.get_mut(task) else {
            return Err(QueueError::from_status(404, format!("run {task} is not claimed")));
        };
        if run.resolution.is_some() {
            return Err(QueueError::from_status(409, format!("run {task} is already resolved")));
        }
        if run.client_id != credentials.client_id {
            return Err(QueueError::from_status(
                401,
                format!("stale credentials {} for run {task}", credentials.client_id),
            ));
        }
        Ok(run)
    }
}

pub struct InMemoryQueueClient {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    lease: Duration,
}

impl InMemoryQueueClient {
    /// 20-minute claims on the system clock.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock: Arc::new(SystemClock),
            lease: Duration::from_secs(20 * 60),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// How long each claim/reclaim is valid for.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer a run to `poll_task_urls`.
    pub fn add_pending(&self, task: TaskRef) {
        self.add_pending_with(task, json!({}));
    }

    pub fn add_pending_with(&self, task: TaskRef, payload: serde_json::Value) {
        self.state().pending.push_back((task, payload));
    }

    pub fn script(&self, op: QueueOp, reply: Reply) {
        self.state().scripted.entry(op).or_default().push_back(reply);
    }

    pub fn fail_next(&self, op: QueueOp, error: QueueError) {
        self.script(op, Reply::Fail(error));
    }

    pub fn hang_next(&self, op: QueueOp) {
        self.script(op, Reply::Hang);
    }

    /// Which report resolved the run, if any.
    pub fn resolution(&self, task: &TaskRef) -> Option<QueueOp> {
        self.state().runs.get(task).and_then(|run| run.resolution)
    }

    pub fn artifacts(&self, task: &TaskRef) -> Vec<String> {
        self.state()
            .runs
            .get(task)
            .map(|run| run.artifacts.clone())
            .unwrap_or_default()
    }

    /// Client id the queue currently accepts for `task`.
    pub fn current_client_id(&self, task: &TaskRef) -> Option<String> {
        self.state().runs.get(task).map(|run| run.client_id.clone())
    }

    async fn scripted(&self, op: QueueOp) -> Result<(), QueueError> {
        let reply = self.state().scripted.get_mut(&op).and_then(VecDeque::pop_front);
        match reply {
            None => Ok(()),
            Some(Reply::Fail(e)) => Err(e),
            Some(Reply::Hang) => std::future::pending().await,
        }
    }

    fn expiry(&self) -> chrono::DateTime<chrono::Utc> {
        let lease = chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::zero());
        self.clock.now() + lease
    }

    fn resolve(
        &self,
        op: QueueOp,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
    ) -> Result<(), QueueError> {
        let task = TaskRef::new(task_id.clone(), run_id);
        let mut state = self.state();
        let run = state.active_run(&task, credentials)?;
        run.resolution = Some(op);
        Ok(())
    }
}

impl Default for InMemoryQueueClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    async fn claim_task(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        worker: &WorkerInfo,
    ) -> Result<ClaimResponse, QueueError> {
        self.scripted(QueueOp::ClaimTask).await?;

        let task = TaskRef::new(task_id.clone(), run_id);
        let taken_until = self.expiry();
        let mut state = self.state();
        if state.runs.contains_key(&task) {
            return Err(QueueError::from_status(409, format!("run {task} is already claimed")));
        }
        let payload = match state.offered.remove(&task) {
            Some(payload) => payload,
            None => match state.pending.iter().position(|(t, _)| *t == task) {
                Some(index) => state
                    .pending
                    .remove(index)
                    .map(|(_, payload)| payload)
                    .unwrap_or_default(),
                None => json!({}),
            },
        };
        let credentials = state.issue();
        state.runs.insert(
            task,
            RunState {
                client_id: credentials.client_id.clone(),
                resolution: None,
                artifacts: Vec::new(),
            },
        );

        Ok(ClaimResponse {
            credentials,
            task: json!({
                "taskId": task_id,
                "runId": run_id,
                "workerId": worker.worker_id,
                "payload": payload,
            }),
            taken_until,
        })
    }

    async fn reclaim_task(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
    ) -> Result<ReclaimResponse, QueueError> {
        self.scripted(QueueOp::ReclaimTask).await?;

        let task = TaskRef::new(task_id.clone(), run_id);
        let taken_until = self.expiry();
        let mut state = self.state();
        state.active_run(&task, credentials)?;
        let fresh = state.issue();
        if let Some(run) = state.runs.get_mut(&task) {
            run.client_id = fresh.client_id.clone();
        }
        Ok(ReclaimResponse {
            credentials: fresh,
            taken_until,
        })
    }

    async fn report_completed(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
    ) -> Result<(), QueueError> {
        self.scripted(QueueOp::ReportCompleted).await?;
        self.resolve(QueueOp::ReportCompleted, task_id, run_id, credentials)
    }

    async fn report_failed(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
    ) -> Result<(), QueueError> {
        self.scripted(QueueOp::ReportFailed).await?;
        self.resolve(QueueOp::ReportFailed, task_id, run_id, credentials)
    }

    async fn report_exception(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
        _reason: ExceptionReason,
    ) -> Result<(), QueueError> {
        self.scripted(QueueOp::ReportException).await?;
        self.resolve(QueueOp::ReportException, task_id, run_id, credentials)
    }

    async fn create_artifact(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
        name: &str,
        request: &ArtifactRequest,
    ) -> Result<UploadTarget, QueueError> {
        self.scripted(QueueOp::CreateArtifact).await?;

        let task = TaskRef::new(task_id.clone(), run_id);
        let mut state = self.state();
        let run = state.active_run(&task, credentials)?;
        run.artifacts.push(name.to_string());
        Ok(UploadTarget {
            content_type: request.content_type.clone(),
            upload_destination: format!("https://uploads.invalid/{task_id}/{run_id}/{name}"),
        })
    }

    async fn poll_task_urls(&self, _worker: &WorkerInfo) -> Result<Vec<TaskRef>, QueueError> {
        self.scripted(QueueOp::PollTaskUrls).await?;
        // 1 回のポーリングで 1 件だけ渡す（複数ワーカーで同じ run を取り合わない）
        let mut state = self.state();
        let Some((task, payload)) = state.pending.pop_front() else {
            return Ok(Vec::new());
        };
        state.offered.insert(task.clone(), payload);
        Ok(vec![task])
    }
}
