//! End-to-end claim lifecycle scenarios on paused tokio time.
//!
//! Queue: `InMemoryQueueClient` (20 minute claims, fresh `client-{n}` per
//! claim/reclaim, stale credentials refused). Default config renews 4 minutes
//! before expiry and gives up 30 seconds before it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use claimwork_core::domain::{
    Artifact, CallResult, ErrorKind, ExceptionReason, Outcome, Phase, QueueOp, RunId, Task,
    TaskId, TaskRef, TaskStatus, WorkerInfo,
};
use claimwork_core::impls::{
    InMemoryQueueClient, ObservedQueueClient, RecordingEventSink, ScriptedTransport,
};
use claimwork_core::ports::{ExecutionError, ExecutionReport, QueueError, TaskExecutor, TokioClock};
use claimwork_core::trust::{DigestManifest, SignatureStatement, Sha256Digest, TrustedKeySet};
use claimwork_core::{
    ReportDisposition, TaskClaimManager, Worker, WorkerConfig, WorkerContext, WorkerContextBuilder,
};

const KEYS_JSON: &str = r#"{
    "docker@example.com": {
        "fingerprint": "F612354DFAF46BAADAE23801CD3C13EFBEAB7ED4",
        "keyid": "BEAB7ED4"
    },
    "scriptworker@example.com": {
        "fingerprint": "FB7765CD0FC616FF7AC961A1D9DC50F64C7D44CF",
        "keyid": "4C7D44CF"
    }
}"#;

const FOO_SHA: &str = "b5bb9d8014a0f9b1d61e21e796d78dccdf1352f23cd32812f4850b878ae4944c";

/// Works for `work`, then exits with `exit_code`. Stops early on cancel.
struct SleepyExecutor {
    work: Duration,
    exit_code: i32,
    artifacts: Vec<Artifact>,
}

impl SleepyExecutor {
    fn new(work: Duration) -> Self {
        Self {
            work,
            exit_code: 0,
            artifacts: Vec::new(),
        }
    }

    fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

#[async_trait]
impl TaskExecutor for SleepyExecutor {
    async fn execute(
        &self,
        _task: &Task,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport, ExecutionError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ExecutionError::new(ExceptionReason::WorkerShutdown, "cancelled")),
            _ = tokio::time::sleep(self.work) => Ok(ExecutionReport {
                exit_code: self.exit_code,
                artifacts: self.artifacts.clone(),
            }),
        }
    }
}

struct Harness {
    queue: Arc<InMemoryQueueClient>,
    transport: Arc<ScriptedTransport>,
    sink: Arc<RecordingEventSink>,
    ctx: Arc<WorkerContext>,
}

impl Harness {
    fn new(config: WorkerConfig) -> Self {
        Self::build(config, ScriptedTransport::new(), None)
    }

    fn build(config: WorkerConfig, transport: ScriptedTransport, manifest: Option<DigestManifest>) -> Self {
        let clock = Arc::new(TokioClock::new());
        let sink = Arc::new(RecordingEventSink::new());
        let queue = Arc::new(InMemoryQueueClient::new().with_clock(clock.clone()));
        let transport = Arc::new(transport);
        let mut builder = WorkerContextBuilder::new(
            Arc::new(ObservedQueueClient::new(queue.clone(), sink.clone())),
            WorkerInfo::new("test-provisioner", "test-worker-type", "group", "w1"),
        )
        .transport(transport.clone())
        .clock(clock)
        .event_sink(sink.clone())
        .trusted_keys(Arc::new(TrustedKeySet::from_json_str(KEYS_JSON).unwrap()))
        .config(config);
        if let Some(manifest) = manifest {
            builder = builder.manifest(manifest);
        }
        Self {
            queue,
            transport,
            sink,
            ctx: builder.build().unwrap(),
        }
    }

    fn worker(&self, executor: SleepyExecutor) -> Worker {
        Worker::new(self.ctx.clone(), Arc::new(executor))
    }

    async fn running(&self) -> TaskClaimManager {
        let manager = TaskClaimManager::claim_task(self.ctx.clone(), t1().task_id, t1().run_id)
            .await
            .unwrap();
        manager.start_work().unwrap();
        manager
    }

    fn calls(&self, op: QueueOp) -> Vec<(Option<String>, CallResult)> {
        self.sink
            .queue_calls()
            .into_iter()
            .filter(|(o, _, _)| *o == op)
            .map(|(_, client, result)| (client, result))
            .collect()
    }
}

fn t1() -> TaskRef {
    TaskRef::new(TaskId::new("t1"), RunId::new(0))
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

fn signed_foo(signer: &str, fingerprint: &str, keyid: &str) -> Artifact {
    let content = Bytes::from_static(b"foo\n");
    let statement = SignatureStatement::new(signer, fingerprint, keyid, &Sha256Digest::of(&content));
    Artifact::new("public/foo", "text/plain", content).with_signature(statement.to_bytes())
}

fn lifecycle_through_lost() -> Vec<(TaskStatus, TaskStatus)> {
    vec![
        (TaskStatus::Unclaimed, TaskStatus::Claimed),
        (TaskStatus::Claimed, TaskStatus::Running),
        (TaskStatus::Running, TaskStatus::Lost),
    ]
}

#[tokio::test(start_paused = true)]
async fn renewed_claim_reports_completed_with_fresh_credentials() {
    let h = Harness::new(WorkerConfig::default());
    let worker = h.worker(SleepyExecutor::new(minutes(17)).with_artifact(signed_foo(
        "scriptworker@example.com",
        "FB7765CD0FC616FF7AC961A1D9DC50F64C7D44CF",
        "4C7D44CF",
    )));

    let summary = worker.run_task(t1()).await;

    assert_eq!(summary.final_status, TaskStatus::ReportedCompleted);
    assert!(summary.error.is_none());
    assert_eq!(summary.uploaded[0].sha256.to_hex(), FOO_SHA);
    assert_eq!(summary.uploaded[0].signer.as_deref(), Some("scriptworker@example.com"));

    assert_eq!(h.calls(QueueOp::ReclaimTask), vec![(Some("client-1".to_string()), CallResult::Ok)]);
    assert_eq!(h.calls(QueueOp::CreateArtifact), vec![(Some("client-2".to_string()), CallResult::Ok)]);
    assert_eq!(h.calls(QueueOp::ReportCompleted), vec![(Some("client-2".to_string()), CallResult::Ok)]);
    assert_eq!(h.queue.resolution(&t1()), Some(QueueOp::ReportCompleted));

    // scheduler は止まっているので、これ以上の呼び出しはない
    let before = h.sink.issued_calls().len();
    tokio::time::sleep(minutes(120)).await;
    assert_eq!(h.sink.issued_calls().len(), before);
}

#[tokio::test(start_paused = true)]
async fn reclaim_conflict_loses_task_without_report() {
    let h = Harness::new(WorkerConfig::default());
    h.queue
        .fail_next(QueueOp::ReclaimTask, QueueError::from_status(409, "claimed elsewhere"));
    let worker = h.worker(SleepyExecutor::new(minutes(60)));

    let summary = worker.run_task(t1()).await;

    assert_eq!(summary.final_status, TaskStatus::Lost);
    let error = summary.error.unwrap();
    assert_eq!(error.kind(), ErrorKind::Conflict);
    assert_eq!(error.phase(), Phase::Reclaim);
    assert_eq!(h.sink.state_changes(&t1()), lifecycle_through_lost());
    for op in [QueueOp::ReportCompleted, QueueOp::ReportFailed, QueueOp::ReportException] {
        assert_eq!(h.sink.issued(op), 0);
    }

    tokio::time::sleep(minutes(120)).await;
    assert_eq!(h.sink.issued(QueueOp::ReclaimTask), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_upload_retries_fail_the_task() {
    let h = Harness::build(
        WorkerConfig::default(),
        ScriptedTransport::new().with_default_status(500),
        None,
    );
    let worker = h.worker(
        SleepyExecutor::new(minutes(1))
            .with_artifact(Artifact::new("public/foo", "text/plain", "foo\n")),
    );

    let summary = worker.run_task(t1()).await;

    assert_eq!(summary.final_status, TaskStatus::ReportedFailed);
    assert_eq!(summary.outcome, Some(Outcome::Failed));
    let error = summary.error.unwrap();
    assert_eq!(error.kind(), ErrorKind::Transient);
    assert_eq!(error.phase(), Phase::Upload);
    assert_eq!(h.sink.upload_attempts("public/foo"), vec![Some(500); 5]);
    assert_eq!(h.transport.requests().len(), 5);
    assert_eq!(h.sink.count(QueueOp::ReportFailed), 1);
    assert_eq!(h.sink.count(QueueOp::ReportCompleted), 0);
}

#[tokio::test(start_paused = true)]
async fn reclaim_always_uses_latest_credentials() {
    let h = Harness::new(WorkerConfig::default());
    let worker = h.worker(SleepyExecutor::new(minutes(50)));

    let summary = worker.run_task(t1()).await;

    assert_eq!(summary.final_status, TaskStatus::ReportedCompleted);
    let reclaims: Vec<_> = h
        .calls(QueueOp::ReclaimTask)
        .into_iter()
        .map(|(client, result)| {
            assert_eq!(result, CallResult::Ok);
            client.unwrap()
        })
        .collect();
    assert_eq!(reclaims, vec!["client-1", "client-2", "client-3"]);
    assert_eq!(h.calls(QueueOp::ReportCompleted), vec![(Some("client-4".to_string()), CallResult::Ok)]);
}

#[tokio::test(start_paused = true)]
async fn unresolved_transient_reclaims_expire_once() {
    let config = WorkerConfig {
        max_transient_reclaim_failures: 100,
        ..WorkerConfig::default()
    };
    let h = Harness::new(config);
    for _ in 0..50 {
        h.queue
            .fail_next(QueueOp::ReclaimTask, QueueError::from_status(503, "unavailable"));
    }
    let manager = h.running().await;

    tokio::time::timeout(minutes(60), manager.cancellation().cancelled())
        .await
        .unwrap();

    assert_eq!(manager.status(), TaskStatus::Lost);
    assert_eq!(manager.lost_reason().unwrap().kind(), ErrorKind::Expired);
    assert_eq!(h.sink.state_changes(&t1()), lifecycle_through_lost());
    let attempts = h.sink.issued(QueueOp::ReclaimTask);
    assert!(attempts > 1 && attempts < 50, "{attempts} reclaim attempts");

    // 期限内に確認できなかったので、期限を過ぎても呼び出しはない
    tokio::time::sleep(minutes(60)).await;
    assert_eq!(h.sink.issued(QueueOp::ReclaimTask), attempts);
    assert_eq!(
        manager.report_outcome(Outcome::Completed).await.unwrap(),
        ReportDisposition::AlreadyTerminal(TaskStatus::Lost)
    );
    assert_eq!(h.sink.issued(QueueOp::ReportCompleted), 0);
}

#[tokio::test(start_paused = true)]
async fn consecutive_transient_reclaims_are_bounded() {
    let config = WorkerConfig {
        max_transient_reclaim_failures: 2,
        ..WorkerConfig::default()
    };
    let h = Harness::new(config);
    h.queue.fail_next(QueueOp::ReclaimTask, QueueError::from_status(502, "bad gateway"));
    h.queue.fail_next(QueueOp::ReclaimTask, QueueError::transport("connection reset"));
    let manager = h.running().await;

    tokio::time::timeout(minutes(60), manager.cancellation().cancelled())
        .await
        .unwrap();

    assert_eq!(h.sink.issued(QueueOp::ReclaimTask), 2);
    assert_eq!(manager.lost_reason().unwrap().kind(), ErrorKind::Expired);
}

#[tokio::test(start_paused = true)]
async fn malformed_reclaim_is_a_hard_failure() {
    let h = Harness::new(WorkerConfig::default());
    h.queue
        .fail_next(QueueOp::ReclaimTask, QueueError::malformed("missing takenUntil"));
    let manager = h.running().await;

    tokio::time::timeout(minutes(60), manager.cancellation().cancelled())
        .await
        .unwrap();

    assert_eq!(h.sink.count(QueueOp::ReclaimTask), 1);
    assert_eq!(manager.lost_reason().unwrap().kind(), ErrorKind::Malformed);
}

#[tokio::test(start_paused = true)]
async fn hung_reclaim_times_out_and_is_retried() {
    let h = Harness::new(WorkerConfig::default());
    h.queue.hang_next(QueueOp::ReclaimTask);
    let manager = h.running().await;
    let original = manager.credentials().unwrap();

    tokio::time::sleep(minutes(17)).await;

    assert_eq!(manager.status(), TaskStatus::Running);
    let current = manager.credentials().unwrap();
    assert_ne!(current.client_id, original.client_id);
    assert_eq!(h.queue.current_client_id(&t1()), Some(current.client_id));
}

#[tokio::test(start_paused = true)]
async fn reclaim_in_flight_at_report_is_discarded() {
    let h = Harness::new(WorkerConfig::default());
    h.queue.hang_next(QueueOp::ReclaimTask);
    let worker = h.worker(SleepyExecutor::new(minutes(16) + Duration::from_secs(5)));

    let summary = worker.run_task(t1()).await;

    assert_eq!(summary.final_status, TaskStatus::ReportedCompleted);
    assert_eq!(h.calls(QueueOp::ReportCompleted), vec![(Some("client-1".to_string()), CallResult::Ok)]);

    // 16 分に出た reclaim は返ってこないまま破棄され、報告後の呼び出しはない
    let after_report = h.sink.issued_calls();
    assert_eq!(h.sink.issued(QueueOp::ReclaimTask), 1);
    tokio::time::sleep(minutes(120)).await;
    assert_eq!(h.sink.issued_calls(), after_report);
    assert_eq!(h.sink.count(QueueOp::ReclaimTask), 0);
    assert_eq!(h.queue.current_client_id(&t1()), Some("client-1".to_string()));
}

#[tokio::test(start_paused = true)]
async fn hung_report_loses_the_task_at_the_guard() {
    let config = WorkerConfig {
        queue_timeout_ms: 3 * 60 * 60 * 1000,
        ..WorkerConfig::default()
    };
    let h = Harness::new(config);
    h.queue.hang_next(QueueOp::ReportCompleted);
    let worker = h.worker(SleepyExecutor::new(minutes(1)));

    let summary = tokio::time::timeout(minutes(180), worker.run_task(t1()))
        .await
        .unwrap();

    assert_eq!(summary.final_status, TaskStatus::Lost);
    let error = summary.error.unwrap();
    assert_eq!(error.kind(), ErrorKind::Expired);
    assert_eq!(error.phase(), Phase::Report);
    assert_eq!(h.sink.state_changes(&t1()), lifecycle_through_lost());
    assert_eq!(h.sink.issued(QueueOp::ReportCompleted), 1);

    let before = h.sink.issued_calls();
    tokio::time::sleep(minutes(120)).await;
    assert_eq!(h.sink.issued_calls(), before);
}

#[tokio::test(start_paused = true)]
async fn manifest_mismatch_fails_without_upload() {
    let mut manifest = DigestManifest::new();
    manifest.insert("public/foo", Sha256Digest::from_hex(FOO_SHA).unwrap());
    let h = Harness::build(WorkerConfig::default(), ScriptedTransport::new(), Some(manifest));
    let worker = h.worker(
        SleepyExecutor::new(minutes(1))
            .with_artifact(Artifact::new("public/foo", "text/plain", "foo\r")),
    );

    let summary = worker.run_task(t1()).await;

    assert_eq!(summary.final_status, TaskStatus::ReportedFailed);
    assert_eq!(summary.error.unwrap().kind(), ErrorKind::Integrity);
    assert!(h.transport.requests().is_empty());
    assert_eq!(h.sink.issued(QueueOp::CreateArtifact), 0);
}

#[tokio::test(start_paused = true)]
async fn untrusted_signer_fails_the_task() {
    let h = Harness::new(WorkerConfig::default());
    let worker = h.worker(SleepyExecutor::new(minutes(1)).with_artifact(signed_foo(
        "unknown@example.com",
        "B45FE2F4035C3786120998174ACA2B25224905DA",
        "224905DA",
    )));

    let summary = worker.run_task(t1()).await;

    assert_eq!(summary.final_status, TaskStatus::ReportedFailed);
    let error = summary.error.unwrap();
    assert_eq!(error.kind(), ErrorKind::Untrusted);
    assert_eq!(error.phase(), Phase::Verify);
    assert!(h.transport.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn claim_of_taken_run_is_a_conflict() {
    let h = Harness::new(WorkerConfig::default());
    let _first = h.running().await;

    let summary = h.worker(SleepyExecutor::new(minutes(1))).run_task(t1()).await;

    assert_eq!(summary.final_status, TaskStatus::Unclaimed);
    assert_eq!(summary.error.unwrap().kind(), ErrorKind::Conflict);
    assert_eq!(h.sink.count(QueueOp::ClaimTask), 2);
}
