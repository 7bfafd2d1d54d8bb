//! ObservedQueueClient - 呼び出しを EventSink に記録するデコレータ

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{
    CallResult, ClaimCredentials, DomainEvent, ExceptionReason, QueueOp, RunId, TaskId, TaskRef,
    WorkerInfo,
};
use crate::ports::{
    ArtifactRequest, ClaimResponse, EventSink, QueueClient, QueueError, ReclaimResponse,
    UploadTarget,
};

/// Wraps any `QueueClient` and emits `DomainEvent::QueueCallStarted` before
/// each call and `DomainEvent::QueueCall` once it returns. A call dropped by a
/// timeout or cancellation only has the start event. Results pass through
/// untouched.
pub struct ObservedQueueClient {
    inner: Arc<dyn QueueClient>,
    sink: Arc<dyn EventSink>,
}

impl ObservedQueueClient {
    pub fn new(inner: Arc<dyn QueueClient>, sink: Arc<dyn EventSink>) -> Self {
        Self { inner, sink }
    }

    fn started(&self, op: QueueOp, task: Option<TaskRef>, credentials: Option<&ClaimCredentials>) {
        self.sink.emit(DomainEvent::QueueCallStarted {
            op,
            task,
            client_id: credentials.map(|c| c.client_id.clone()),
        });
    }

    fn observe<T>(
        &self,
        op: QueueOp,
        task: Option<TaskRef>,
        credentials: Option<&ClaimCredentials>,
        result: &Result<T, QueueError>,
    ) {
        self.sink.emit(DomainEvent::QueueCall {
            op,
            task,
            client_id: credentials.map(|c| c.client_id.clone()),
            result: match result {
                Ok(_) => CallResult::Ok,
                Err(e) => CallResult::Err(e.kind()),
            },
        });
    }
}

fn task_ref(task_id: &TaskId, run_id: RunId) -> Option<TaskRef> {
    Some(TaskRef::new(task_id.clone(), run_id))
}

#[async_trait]
impl QueueClient for ObservedQueueClient {
    async fn claim_task(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        worker: &WorkerInfo,
    ) -> Result<ClaimResponse, QueueError> {
        self.started(QueueOp::ClaimTask, task_ref(task_id, run_id), None);
        let result = self.inner.claim_task(task_id, run_id, worker).await;
        self.observe(QueueOp::ClaimTask, task_ref(task_id, run_id), None, &result);
        result
    }

    async fn reclaim_task(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
    ) -> Result<ReclaimResponse, QueueError> {
        self.started(QueueOp::ReclaimTask, task_ref(task_id, run_id), Some(credentials));
        let result = self.inner.reclaim_task(task_id, run_id, credentials).await;
        self.observe(QueueOp::ReclaimTask, task_ref(task_id, run_id), Some(credentials), &result);
        result
    }

    async fn report_completed(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
    ) -> Result<(), QueueError> {
        self.started(QueueOp::ReportCompleted, task_ref(task_id, run_id), Some(credentials));
        let result = self.inner.report_completed(task_id, run_id, credentials).await;
        self.observe(QueueOp::ReportCompleted, task_ref(task_id, run_id), Some(credentials), &result);
        result
    }

    async fn report_failed(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
    ) -> Result<(), QueueError> {
        self.started(QueueOp::ReportFailed, task_ref(task_id, run_id), Some(credentials));
        let result = self.inner.report_failed(task_id, run_id, credentials).await;
        self.observe(QueueOp::ReportFailed, task_ref(task_id, run_id), Some(credentials), &result);
        result
    }

    async fn report_exception(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
        reason: ExceptionReason,
    ) -> Result<(), QueueError> {
        self.started(QueueOp::ReportException, task_ref(task_id, run_id), Some(credentials));
        let result = self
            .inner
            .report_exception(task_id, run_id, credentials, reason)
            .await;
        self.observe(QueueOp::ReportException, task_ref(task_id, run_id), Some(credentials), &result);
        result
    }

    async fn create_artifact(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
        name: &str,
        request: &ArtifactRequest,
    ) -> Result<UploadTarget, QueueError> {
        self.started(QueueOp::CreateArtifact, task_ref(task_id, run_id), Some(credentials));
        let result = self
            .inner
            .create_artifact(task_id, run_id, credentials, name, request)
            .await;
        self.observe(QueueOp::CreateArtifact, task_ref(task_id, run_id), Some(credentials), &result);
        result
    }

    async fn poll_task_urls(&self, worker: &WorkerInfo) -> Result<Vec<TaskRef>, QueueError> {
        self.started(QueueOp::PollTaskUrls, None, None);
        let result = self.inner.poll_task_urls(worker).await;
        self.observe(QueueOp::PollTaskUrls, None, None, &result);
        result
    }
}
