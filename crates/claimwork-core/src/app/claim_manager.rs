//! TaskClaimManager - 1 タスク分の claim ライフサイクル
//!
//! # 状態遷移
//! ```text
//! Unclaimed --claim ok--> Claimed --start_work--> Running
//! Running --reclaim conflict / expiry--> Lost
//! Running --report ok--> ReportedCompleted | ReportedFailed | ReportedException
//! ```
//!
//! # 設計原則
//! - Task の書き込みはこのモジュールだけ（ReclaimScheduler はイベントを送るだけ）
//! - Lost / Reported* に入ったら以後キュー呼び出しは一切しない
//! - ロックを握ったまま await しない

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::builder::WorkerContext;
use crate::app::reclaim_scheduler::{ReclaimEvent, ReclaimScheduler};
use crate::domain::{
    ClaimCredentials, DomainEvent, ErrorKind, Outcome, Phase, RunId, Task, TaskId, TaskRef,
    TaskStatus, WorkerError,
};
use crate::ports::QueueError;

/// How a `report_outcome` call was resolved without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportDisposition {
    /// The queue acknowledged the report.
    Reported(TaskStatus),

    /// Nothing sent: the task was already terminal.
    AlreadyTerminal(TaskStatus),

    /// Nothing sent: another report for this task is in progress.
    InFlight,

    /// The claim was gone (rejected by the queue, or already expired). The
    /// task is now `Lost`.
    Suppressed { reason: WorkerError },
}

struct TaskRecord {
    task: Task,
    report_in_flight: bool,
    lost_reason: Option<WorkerError>,
}

struct Shared {
    ctx: Arc<WorkerContext>,
    task_ref: TaskRef,
    record: Mutex<TaskRecord>,
    /// Fires once the task reaches `Lost`.
    lost: CancellationToken,
    scheduler: Mutex<Option<ReclaimScheduler>>,
}

impl Shared {
    fn record(&self) -> MutexGuard<'_, TaskRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_scheduler(&self) {
        let guard = self.scheduler.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(scheduler) = guard.as_ref() {
            scheduler.cancel();
        }
    }

    fn state_changed(&self, from: TaskStatus, to: TaskStatus) {
        self.ctx.events().emit(DomainEvent::StateChanged {
            task: self.task_ref.clone(),
            from,
            to,
        });
    }

    /// Move to `Lost` unless already terminal. Returns whether this call made
    /// the transition.
    fn mark_lost(&self, reason: WorkerError) -> bool {
        let from = {
            let mut rec = self.record();
            if rec.task.status.is_terminal() {
                return false;
            }
            let from = rec.task.status;
            rec.task.mark_lost();
            rec.report_in_flight = false;
            rec.lost_reason = Some(reason.clone());
            from
        };

        self.cancel_scheduler();
        self.lost.cancel();
        warn!(
            task_id = %self.task_ref.task_id,
            run_id = %self.task_ref.run_id,
            phase = %reason.phase(),
            error = %reason,
            "task lost"
        );
        self.state_changed(from, TaskStatus::Lost);
        true
    }

    /// Last moment a call under this claim may still be waited on.
    fn call_deadline(&self, taken_until: DateTime<Utc>) -> DateTime<Utc> {
        let guard = chrono::Duration::from_std(self.ctx.config().expiry_guard())
            .unwrap_or(chrono::Duration::zero());
        taken_until - guard
    }

    /// `Lost` with kind `Expired`; returns the recorded reason.
    fn expire(&self, phase: Phase, message: String) -> WorkerError {
        let reason = WorkerError::new(ErrorKind::Expired, phase, &self.task_ref, message);
        self.mark_lost(reason.clone());
        reason
    }

    fn on_reclaim_event(&self, event: ReclaimEvent) {
        match event {
            ReclaimEvent::Renewed {
                credentials,
                taken_until,
            } => {
                let client_id = credentials.client_id.clone();
                {
                    let mut rec = self.record();
                    // 終端状態のタスクを遅れて届いた結果で復活させない
                    if rec.task.status.is_terminal() {
                        return;
                    }
                    rec.task.renew(credentials, taken_until);
                }
                self.ctx.events().emit(DomainEvent::ClaimRenewed {
                    task: self.task_ref.clone(),
                    client_id,
                    taken_until,
                });
            }
            ReclaimEvent::Retrying { failures, .. } => {
                debug!(
                    task_id = %self.task_ref.task_id,
                    run_id = %self.task_ref.run_id,
                    attempt = failures,
                    "reclaim retry pending"
                );
            }
            ReclaimEvent::Lost(reason) => {
                {
                    // report 中は report 側の結果に任せる
                    let mut rec = self.record();
                    if rec.report_in_flight {
                        rec.lost_reason = Some(reason);
                        return;
                    }
                }
                self.mark_lost(reason);
            }
        }
    }
}

async fn monitor(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<ReclaimEvent>) {
    while let Some(event) = events.recv().await {
        shared.on_reclaim_event(event);
    }
}

/// Owns one claimed task run from claim to terminal state.
///
/// # 使用例
/// ```ignore
/// let manager = TaskClaimManager::claim_task(ctx, task_id, run_id).await?;
/// let cancel = manager.start_work()?;
/// // ... run the payload, aborting when `cancel` fires ...
/// manager.report_outcome(Outcome::Completed).await?;
/// ```
pub struct TaskClaimManager {
    shared: Arc<Shared>,
}

impl TaskClaimManager {
    /// Claim `(task_id, run_id)` for this worker.
    ///
    /// Transient failures are retried up to `claim_attempts`; Conflict,
    /// Unavailable and Malformed are returned straight away.
    pub async fn claim_task(
        ctx: Arc<WorkerContext>,
        task_id: TaskId,
        run_id: RunId,
    ) -> Result<Self, WorkerError> {
        let task_ref = TaskRef::new(task_id.clone(), run_id);
        let config = ctx.config();

        let mut attempt: u32 = 0;
        let resp = loop {
            attempt += 1;
            let call = ctx.queue().claim_task(&task_id, run_id, ctx.worker());
            let result = match tokio::time::timeout(config.queue_timeout(), call).await {
                Ok(result) => result,
                Err(_) => Err(QueueError::transport("claim timed out")),
            };
            match result {
                Ok(resp) => break resp,
                Err(e) if e.kind().is_retryable() && attempt < config.claim_attempts => {
                    let delay = config.retry.next_delay(attempt);
                    warn!(
                        task_id = %task_id,
                        run_id = %run_id,
                        phase = %Phase::Claim,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "claim failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    debug!(task_id = %task_id, run_id = %run_id, error = %e, "claim failed");
                    return Err(WorkerError::new(e.kind(), Phase::Claim, &task_ref, e.to_string()));
                }
            }
        };

        let mut task = Task::unclaimed(task_id, run_id);
        task.mark_claimed(resp.task, resp.credentials, resp.taken_until);
        info!(
            task_id = %task_ref.task_id,
            run_id = %task_ref.run_id,
            taken_until = %resp.taken_until,
            "task claimed"
        );

        let shared = Arc::new(Shared {
            ctx: Arc::clone(&ctx),
            task_ref,
            record: Mutex::new(TaskRecord {
                task,
                report_in_flight: false,
                lost_reason: None,
            }),
            lost: CancellationToken::new(),
            scheduler: Mutex::new(None),
        });
        shared.state_changed(TaskStatus::Unclaimed, TaskStatus::Claimed);
        Ok(Self { shared })
    }

    /// Claimed -> Running, and start renewing the claim in the background.
    ///
    /// Returns the token that fires if the claim is lost while working.
    /// Must be called from within a tokio runtime.
    pub fn start_work(&self) -> Result<CancellationToken, WorkerError> {
        let shared = &self.shared;
        let now = shared.ctx.clock().now();

        let (credentials, taken_until) = {
            let mut rec = shared.record();
            if rec.task.status != TaskStatus::Claimed {
                return Err(WorkerError::new(
                    ErrorKind::InvalidState,
                    Phase::Work,
                    &shared.task_ref,
                    format!("cannot start work from {}", rec.task.status),
                ));
            }
            match (rec.task.credentials.clone(), rec.task.taken_until) {
                (Some(credentials), Some(until)) if !rec.task.is_expired_at(now) => {
                    rec.task.mark_running();
                    (credentials, until)
                }
                _ => {
                    drop(rec);
                    let err = WorkerError::new(
                        ErrorKind::Expired,
                        Phase::Work,
                        &shared.task_ref,
                        "claim expired before work started",
                    );
                    shared.mark_lost(err.clone());
                    return Err(err);
                }
            }
        };
        shared.state_changed(TaskStatus::Claimed, TaskStatus::Running);

        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = ReclaimScheduler::spawn(
            Arc::clone(&shared.ctx),
            shared.task_ref.clone(),
            credentials,
            taken_until,
            tx,
        );
        *shared.scheduler.lock().unwrap_or_else(PoisonError::into_inner) = Some(scheduler);
        tokio::spawn(monitor(Arc::clone(shared), rx));

        // start_work と並行して終端に入っていた場合
        if shared.record().task.status.is_terminal() {
            shared.cancel_scheduler();
        }

        Ok(shared.lost.clone())
    }

    /// Send the one terminal report for this run.
    ///
    /// - already terminal, or another report in progress: no call
    /// - inside `expiry_guard` of `takenUntil`: `Lost` (Expired), no call
    /// - each call bounded by `queue_timeout` and by the guard; a call still
    ///   pending when the guard is reached leaves the task `Lost` (Expired)
    /// - Conflict / Unavailable from the queue: logged, `Lost`, not retried
    /// - Transient: retried within the claim window up to `report_attempts`,
    ///   then `Lost` and an error
    pub async fn report_outcome(&self, outcome: Outcome) -> Result<ReportDisposition, WorkerError> {
        let shared = &self.shared;
        let ctx = &shared.ctx;
        let task_ref = &shared.task_ref;

        let (credentials, taken_until) = {
            let mut rec = shared.record();
            if rec.task.status.is_terminal() {
                debug!(task_id = %task_ref.task_id, run_id = %task_ref.run_id, status = %rec.task.status, "report skipped, task already terminal");
                return Ok(ReportDisposition::AlreadyTerminal(rec.task.status));
            }
            if rec.report_in_flight {
                return Ok(ReportDisposition::InFlight);
            }
            match (rec.task.credentials.clone(), rec.task.taken_until) {
                (Some(credentials), Some(until)) => {
                    rec.report_in_flight = true;
                    (credentials, until)
                }
                _ => {
                    return Err(WorkerError::new(
                        ErrorKind::InvalidState,
                        Phase::Report,
                        task_ref,
                        format!("cannot report from {}", rec.task.status),
                    ));
                }
            }
        };
        shared.cancel_scheduler();

        let config = ctx.config();
        let deadline = shared.call_deadline(taken_until);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let budget = ctx.clock().until(deadline);
            if budget.is_zero() {
                let reason = shared.expire(
                    Phase::Report,
                    format!("claim expires at {taken_until}, too late to report the outcome"),
                );
                return Ok(ReportDisposition::Suppressed { reason });
            }

            let queue = ctx.queue();
            let call = async {
                match outcome {
                    Outcome::Completed => {
                        queue.report_completed(&task_ref.task_id, task_ref.run_id, &credentials).await
                    }
                    Outcome::Failed => {
                        queue.report_failed(&task_ref.task_id, task_ref.run_id, &credentials).await
                    }
                    Outcome::Exception(reason) => {
                        queue
                            .report_exception(&task_ref.task_id, task_ref.run_id, &credentials, reason)
                            .await
                    }
                }
            };
            let capped = budget < config.queue_timeout();
            let result = match tokio::time::timeout(budget.min(config.queue_timeout()), call).await {
                Ok(result) => result,
                Err(_) if capped => {
                    let reason = shared.expire(
                        Phase::Report,
                        format!("report still unanswered when the claim window closed ({taken_until})"),
                    );
                    return Ok(ReportDisposition::Suppressed { reason });
                }
                Err(_) => Err(QueueError::transport("report timed out")),
            };

            let err = match result {
                Ok(()) => {
                    let to = outcome.reported_status();
                    let from = {
                        let mut rec = shared.record();
                        let from = rec.task.status;
                        rec.task.mark_reported(to);
                        rec.report_in_flight = false;
                        from
                    };
                    info!(task_id = %task_ref.task_id, run_id = %task_ref.run_id, status = %to, "outcome reported");
                    shared.state_changed(from, to);
                    return Ok(ReportDisposition::Reported(to));
                }
                Err(e) => e,
            };

            if err.kind().is_claim_gone() {
                warn!(
                    task_id = %task_ref.task_id,
                    run_id = %task_ref.run_id,
                    phase = %Phase::Report,
                    error = %err,
                    "report rejected, claim no longer recognized"
                );
                let reason = WorkerError::new(err.kind(), Phase::Report, task_ref, err.to_string());
                shared.mark_lost(reason.clone());
                return Ok(ReportDisposition::Suppressed { reason });
            }

            if err.kind().is_retryable() && attempt < config.report_attempts {
                let delay = config.retry.next_delay(attempt);
                if delay < ctx.clock().until(deadline) {
                    warn!(
                        task_id = %task_ref.task_id,
                        run_id = %task_ref.run_id,
                        phase = %Phase::Report,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "report failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            let error = WorkerError::new(
                err.kind(),
                Phase::Report,
                task_ref,
                format!("report gave up after {attempt} attempt(s): {err}"),
            );
            shared.mark_lost(error.clone());
            return Err(error);
        }
    }

    /// Fires when the task becomes `Lost`.
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.lost.clone()
    }

    /// Credentials from the latest claim/reclaim response.
    pub fn credentials(&self) -> Option<ClaimCredentials> {
        self.shared.record().task.credentials.clone()
    }

    /// Snapshot of the task record.
    pub fn task(&self) -> Task {
        self.shared.record().task.clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.shared.record().task.status
    }

    pub fn task_ref(&self) -> &TaskRef {
        &self.shared.task_ref
    }

    /// Why the task was lost, if it was.
    pub fn lost_reason(&self) -> Option<WorkerError> {
        self.shared.record().lost_reason.clone()
    }

    /// `takenUntil - expiry_guard` for the current claim.
    pub(crate) fn call_deadline(&self) -> Option<DateTime<Utc>> {
        let taken_until = self.shared.record().task.taken_until?;
        Some(self.shared.call_deadline(taken_until))
    }

    /// Give the claim up as expired. No queue call is made.
    pub(crate) fn expire(&self, phase: Phase, message: String) -> WorkerError {
        self.shared.expire(phase, message)
    }

    pub(crate) fn context(&self) -> &Arc<WorkerContext> {
        &self.shared.ctx
    }

    /// Give the claim up locally (e.g. the queue rejected an artifact call
    /// with Conflict). No queue call is made.
    pub(crate) fn mark_lost(&self, reason: WorkerError) -> bool {
        self.shared.mark_lost(reason)
    }
}

impl Drop for TaskClaimManager {
    fn drop(&mut self) {
        self.shared.cancel_scheduler();
    }
}
