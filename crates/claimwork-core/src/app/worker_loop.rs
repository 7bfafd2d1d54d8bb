//! WorkerLoop - タスク実行ループ
//!
//! # フロー（1 タスク）
//! 1. TaskClaimManager::claim_task() で claim
//! 2. start_work() で Running + reclaim 開始
//! 3. TaskExecutor 実行（claim を失ったら cancel）
//! 4. 生成された artifact を ArtifactUploader でアップロード
//! 5. report_outcome() で終端状態を報告
//!
//! `WorkerGroup` は N 本のポーリングループを起動し、watch チャネルで停止する。

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::app::builder::WorkerContext;
use crate::app::claim_manager::{ReportDisposition, TaskClaimManager};
use crate::app::uploader::ArtifactUploader;
use crate::domain::{Outcome, TaskRef, TaskStatus, UploadedArtifact, WorkerError};
use crate::ports::TaskExecutor;

/// How one task run ended, from this worker's point of view.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRunSummary {
    pub task: TaskRef,
    pub final_status: TaskStatus,
    /// Outcome we tried to report, if the run got that far.
    pub outcome: Option<Outcome>,
    pub uploaded: Vec<UploadedArtifact>,
    /// First error that shaped the outcome.
    pub error: Option<WorkerError>,
}

impl TaskRunSummary {
    fn new(task: TaskRef) -> Self {
        Self {
            task,
            final_status: TaskStatus::Unclaimed,
            outcome: None,
            uploaded: Vec::new(),
            error: None,
        }
    }

    fn with_error(mut self, error: WorkerError) -> Self {
        self.error.get_or_insert(error);
        self
    }
}

/// Runs claimed tasks end to end.
pub struct Worker {
    ctx: Arc<WorkerContext>,
    executor: Arc<dyn TaskExecutor>,
    uploader: ArtifactUploader,
}

impl Worker {
    pub fn new(ctx: Arc<WorkerContext>, executor: Arc<dyn TaskExecutor>) -> Self {
        let uploader = ArtifactUploader::new(Arc::clone(&ctx));
        Self {
            ctx,
            executor,
            uploader,
        }
    }

    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.ctx
    }

    pub async fn run_task(&self, task: TaskRef) -> TaskRunSummary {
        let mut summary = TaskRunSummary::new(task.clone());

        let manager =
            match TaskClaimManager::claim_task(Arc::clone(&self.ctx), task.task_id, task.run_id).await {
                Ok(manager) => manager,
                Err(e) => return summary.with_error(e),
            };

        let cancel = match manager.start_work() {
            Ok(cancel) => cancel,
            Err(e) => {
                summary.final_status = manager.status();
                return summary.with_error(e);
            }
        };

        let snapshot = manager.task();
        let executed = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.executor.execute(&snapshot, cancel.clone()) => Some(result),
        };
        let Some(executed) = executed else {
            info!(task_id = %summary.task.task_id, run_id = %summary.task.run_id, "claim lost while working, abandoning");
            summary.final_status = manager.status();
            summary.error = manager.lost_reason();
            return summary;
        };

        let outcome = match executed {
            Ok(report) => {
                let mut outcome = Outcome::from_exit_code(report.exit_code);
                for artifact in &report.artifacts {
                    match self.uploader.upload_artifact(&manager, artifact).await {
                        Ok(uploaded) => summary.uploaded.push(uploaded),
                        Err(e) => {
                            warn!(
                                task_id = %summary.task.task_id,
                                run_id = %summary.task.run_id,
                                phase = %e.phase(),
                                artifact = artifact.name(),
                                error = %e,
                                "artifact not accepted, failing task"
                            );
                            summary.error = Some(e);
                            outcome = Outcome::Failed;
                            break;
                        }
                    }
                }
                outcome
            }
            Err(e) => {
                warn!(
                    task_id = %summary.task.task_id,
                    run_id = %summary.task.run_id,
                    reason = %e.reason,
                    error = %e,
                    "payload did not run"
                );
                Outcome::Exception(e.reason)
            }
        };
        summary.outcome = Some(outcome);

        match manager.report_outcome(outcome).await {
            Ok(ReportDisposition::Suppressed { reason }) => {
                summary = summary.with_error(reason);
            }
            Ok(disposition) => {
                debug!(task_id = %summary.task.task_id, run_id = %summary.task.run_id, ?disposition, "report finished");
            }
            Err(e) => {
                summary = summary.with_error(e);
            }
        }
        summary.final_status = manager.status();
        summary
    }
}

/// Worker group handle.
/// - `request_shutdown()` で新しいタスクの取得を止める（実行中のタスクは最後まで走る）
/// - `shutdown_and_join()` で全ループの終了を待ち、残りの summary を回収する
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    summaries: mpsc::UnboundedReceiver<TaskRunSummary>,
}

impl WorkerGroup {
    /// Spawn `worker_count` polling loops sharing `worker`.
    pub fn spawn(worker: Arc<Worker>) -> Self {
        let n = worker.ctx.config().worker_count;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (summary_tx, summaries) = mpsc::unbounded_channel();

        let mut joins = Vec::with_capacity(n);
        for slot in 0..n {
            let worker = Arc::clone(&worker);
            let rx = shutdown_rx.clone();
            let tx = summary_tx.clone();
            let span = info_span!("worker", slot, worker_id = %worker.ctx.worker().worker_id);
            joins.push(tokio::spawn(poll_loop(worker, rx, tx).instrument(span)));
        }

        Self {
            shutdown_tx,
            joins,
            summaries,
        }
    }

    /// Next finished task, in completion order.
    pub async fn next_summary(&mut self) -> Option<TaskRunSummary> {
        self.summaries.recv().await
    }

    pub fn request_shutdown(&self) {
        // receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown, wait for all loops, and return summaries not yet taken.
    pub async fn shutdown_and_join(mut self) -> Vec<TaskRunSummary> {
        self.request_shutdown();
        for join in self.joins.drain(..) {
            let _ = join.await;
        }
        let mut rest = Vec::new();
        while let Ok(summary) = self.summaries.try_recv() {
            rest.push(summary);
        }
        rest
    }
}

/// `interval` plus up to 10% random slack, so idle workers drift apart.
fn jittered(interval: Duration) -> Duration {
    let slack = (interval.as_millis() / 10) as u64;
    if slack == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::thread_rng().gen_range(0..=slack))
}

async fn poll_loop(
    worker: Arc<Worker>,
    mut shutdown_rx: watch::Receiver<bool>,
    summaries: mpsc::UnboundedSender<TaskRunSummary>,
) {
    let ctx = Arc::clone(&worker.ctx);
    let interval = ctx.config().poll_interval();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let polled = tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender が drop された場合も停止
                if changed.is_err() {
                    break;
                }
                continue;
            }
            polled = ctx.queue().poll_task_urls(ctx.worker()) => polled,
        };

        let candidates = match polled {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "poll failed");
                Vec::new()
            }
        };

        if candidates.is_empty() {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(jittered(interval)) => {}
            }
            continue;
        }

        for task in candidates {
            if *shutdown_rx.borrow() {
                break;
            }
            let span = info_span!("task", task_id = %task.task_id, run_id = %task.run_id);
            let summary = worker.run_task(task).instrument(span).await;
            let _ = summaries.send(summary);
        }
    }
}
