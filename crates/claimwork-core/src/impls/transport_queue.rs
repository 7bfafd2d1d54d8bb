//! TransportQueueClient - Transport 上の JSON/REST キュークライアント
//!
//! Paths, relative to `base_url`:
//! - `POST /task/{taskId}/runs/{runId}/claim`
//! - `POST /task/{taskId}/runs/{runId}/reclaim`
//! - `POST /task/{taskId}/runs/{runId}/{completed|failed|exception}`
//! - `POST /task/{taskId}/runs/{runId}/artifacts/{name}`
//! - `GET  /poll-task-url/{provisionerId}/{workerType}`

use std::sync::Arc;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use crate::domain::{ClaimCredentials, ExceptionReason, RunId, TaskId, TaskRef, WorkerInfo};
use crate::ports::{
    ArtifactRequest, ClaimResponse, Method, QueueClient, QueueError, ReclaimResponse, Transport,
    TransportRequest, TransportResponse, UploadTarget,
};

/// Characters escaped inside one path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Percent-encode each `/`-separated segment of `path`, keeping the separators.
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolledTask {
    task_id: TaskId,
    run_id: RunId,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    tasks: Vec<PolledTask>,
}

pub struct TransportQueueClient {
    base_url: String,
    transport: Arc<dyn Transport>,
}

impl TransportQueueClient {
    pub fn new(base_url: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            transport,
        }
    }

    fn run_url(&self, task_id: &TaskId, run_id: RunId, tail: &str) -> String {
        let task_id = utf8_percent_encode(task_id.as_str(), SEGMENT);
        format!("{}/task/{task_id}/runs/{run_id}/{tail}", self.base_url)
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        credentials: Option<&ClaimCredentials>,
        body: Option<serde_json::Value>,
    ) -> Result<TransportResponse, QueueError> {
        let mut request = TransportRequest::new(method, url).header("accept", "application/json");
        if let Some(credentials) = credentials {
            request = request
                .header("authorization", format!("Bearer {}", credentials.access_token))
                .header("x-client-id", credentials.client_id.as_str());
        }
        if let Some(body) = body {
            request = request
                .header("content-type", "application/json")
                .body(body.to_string());
        }

        debug!(method = %request.method, url = %request.url, "queue request");
        let response = self
            .transport
            .request(request)
            .await
            .map_err(|e| QueueError::transport(e.to_string()))?;

        if !response.is_success() {
            let message = String::from_utf8_lossy(&response.body).into_owned();
            return Err(QueueError::from_status(response.status, message));
        }
        Ok(response)
    }

    fn parse<T: DeserializeOwned>(response: &TransportResponse) -> Result<T, QueueError> {
        serde_json::from_slice(&response.body).map_err(|e| QueueError::Malformed {
            status: Some(response.status),
            message: format!(
                "failed to parse response: {e}, body: {}",
                String::from_utf8_lossy(&response.body)
            ),
        })
    }
}

#[async_trait]
impl QueueClient for TransportQueueClient {
    async fn claim_task(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        worker: &WorkerInfo,
    ) -> Result<ClaimResponse, QueueError> {
        let body = json!({
            "workerGroup": worker.worker_group,
            "workerId": worker.worker_id,
        });
        let response = self
            .send(Method::Post, self.run_url(task_id, run_id, "claim"), None, Some(body))
            .await?;
        Self::parse(&response)
    }

    async fn reclaim_task(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
    ) -> Result<ReclaimResponse, QueueError> {
        let response = self
            .send(
                Method::Post,
                self.run_url(task_id, run_id, "reclaim"),
                Some(credentials),
                None,
            )
            .await?;
        Self::parse(&response)
    }

    async fn report_completed(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
    ) -> Result<(), QueueError> {
        self.send(
            Method::Post,
            self.run_url(task_id, run_id, "completed"),
            Some(credentials),
            None,
        )
        .await?;
        Ok(())
    }

    async fn report_failed(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
    ) -> Result<(), QueueError> {
        self.send(
            Method::Post,
            self.run_url(task_id, run_id, "failed"),
            Some(credentials),
            None,
        )
        .await?;
        Ok(())
    }

    async fn report_exception(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
        reason: ExceptionReason,
    ) -> Result<(), QueueError> {
        self.send(
            Method::Post,
            self.run_url(task_id, run_id, "exception"),
            Some(credentials),
            Some(json!({ "reason": reason })),
        )
        .await?;
        Ok(())
    }

    async fn create_artifact(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &ClaimCredentials,
        name: &str,
        request: &ArtifactRequest,
    ) -> Result<UploadTarget, QueueError> {
        let body = serde_json::to_value(request).map_err(|e| QueueError::malformed(e.to_string()))?;
        let response = self
            .send(
                Method::Post,
                self.run_url(task_id, run_id, &format!("artifacts/{}", encode_path(name))),
                Some(credentials),
                Some(body),
            )
            .await?;
        Self::parse(&response)
    }

    async fn poll_task_urls(&self, worker: &WorkerInfo) -> Result<Vec<TaskRef>, QueueError> {
        let url = format!(
            "{}/poll-task-url/{}/{}",
            self.base_url, worker.provisioner_id, worker.worker_type
        );
        let response = self.send(Method::Get, url, None, None).await?;
        let polled: PollResponse = Self::parse(&response)?;
        Ok(polled
            .tasks
            .into_iter()
            .map(|t| TaskRef::new(t.task_id, t.run_id))
            .collect())
    }
}
