//! ReclaimScheduler - claim の更新タイマー
//!
//! # フロー
//! 1. `takenUntil - reclaim_margin` まで sleep（cancel と select）
//! 2. reclaimTask を `reclaim_timeout` 付きで呼ぶ
//! 3. 成功 → credentials/takenUntil を差し替えて Renewed を送信、1 に戻る
//! 4. Transient → `takenUntil - expiry_guard` までの範囲で backoff リトライ
//! 5. それ以外 / 期限切れ → Lost を送信して終了
//!
//! The scheduler never writes the task. Everything it learns goes to the
//! owning manager over an mpsc channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::builder::WorkerContext;
use crate::domain::{ClaimCredentials, ErrorKind, Phase, TaskRef, WorkerError};
use crate::ports::QueueError;

/// What the scheduler reports back to its manager.
#[derive(Debug, Clone)]
pub enum ReclaimEvent {
    /// Reclaim succeeded; these are now the current credentials.
    Renewed {
        credentials: ClaimCredentials,
        taken_until: DateTime<Utc>,
    },

    /// A transient failure; another attempt follows after `delay`.
    Retrying {
        failures: u32,
        delay: Duration,
        error: WorkerError,
    },

    /// The claim is gone. Always the last event.
    Lost(WorkerError),
}

/// Handle to one task's renewal loop.
///
/// Dropping the handle cancels the loop.
pub struct ReclaimScheduler {
    cancel: CancellationToken,
}

impl ReclaimScheduler {
    pub fn spawn(
        ctx: Arc<WorkerContext>,
        task: TaskRef,
        credentials: ClaimCredentials,
        taken_until: DateTime<Utc>,
        events: mpsc::UnboundedSender<ReclaimEvent>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let renewal = Renewal {
            ctx,
            task,
            credentials,
            taken_until,
            events,
            cancel: cancel.clone(),
        };
        tokio::spawn(renewal.run());
        Self { cancel }
    }

    /// Stop scheduling. A reclaim already in flight finishes, but its result
    /// is dropped.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ReclaimScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Stop {
    Cancelled,
    Lost,
}

struct Renewal {
    ctx: Arc<WorkerContext>,
    task: TaskRef,
    credentials: ClaimCredentials,
    taken_until: DateTime<Utc>,
    events: mpsc::UnboundedSender<ReclaimEvent>,
    cancel: CancellationToken,
}

impl Renewal {
    async fn run(mut self) {
        let margin = chrono::Duration::from_std(self.ctx.config().reclaim_margin())
            .unwrap_or(chrono::Duration::zero());

        loop {
            let wait = self.ctx.clock().until(self.taken_until - margin);
            debug!(
                task_id = %self.task.task_id,
                run_id = %self.task.run_id,
                wait_ms = wait.as_millis() as u64,
                "next reclaim scheduled"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            match self.renew().await {
                Ok(()) => continue,
                Err(Stop::Cancelled) => {
                    debug!(task_id = %self.task.task_id, run_id = %self.task.run_id, "reclaim cancelled");
                    return;
                }
                Err(Stop::Lost) => return,
            }
        }
    }

    /// One renewal cycle, including transient retries.
    async fn renew(&mut self) -> Result<(), Stop> {
        let ctx = Arc::clone(&self.ctx);
        let config = ctx.config();
        let guard = chrono::Duration::from_std(config.expiry_guard()).unwrap_or(chrono::Duration::zero());
        let mut failures: u32 = 0;

        loop {
            let deadline = self.taken_until - guard;
            let budget = ctx.clock().until(deadline);
            if budget.is_zero() {
                return Err(self.lost(
                    ErrorKind::Expired,
                    format!("claim could not be renewed before {}", self.taken_until),
                ));
            }

            let call = ctx.queue().reclaim_task(
                &self.task.task_id,
                self.task.run_id,
                &self.credentials,
            );
            let result = tokio::time::timeout(budget.min(config.reclaim_timeout()), call).await;

            if self.cancel.is_cancelled() {
                return Err(Stop::Cancelled);
            }

            let err = match result {
                Ok(Ok(resp)) => {
                    self.credentials = resp.credentials.clone();
                    self.taken_until = resp.taken_until;
                    debug!(
                        task_id = %self.task.task_id,
                        run_id = %self.task.run_id,
                        client_id = %resp.credentials.client_id,
                        taken_until = %resp.taken_until,
                        "claim renewed"
                    );
                    self.send(ReclaimEvent::Renewed {
                        credentials: resp.credentials,
                        taken_until: resp.taken_until,
                    });
                    return Ok(());
                }
                Ok(Err(e)) => e,
                Err(_) => QueueError::transport("reclaim timed out"),
            };

            if !err.kind().is_retryable() {
                return Err(self.lost(err.kind(), err.to_string()));
            }

            failures += 1;
            if failures >= config.max_transient_reclaim_failures {
                return Err(self.lost(
                    ErrorKind::Expired,
                    format!("{failures} consecutive transient reclaim failures, last: {err}"),
                ));
            }

            let delay = config.retry.next_delay(failures);
            if delay >= ctx.clock().until(deadline) {
                return Err(self.lost(
                    ErrorKind::Expired,
                    format!("no time left to retry reclaim before expiry, last: {err}"),
                ));
            }

            let error = WorkerError::new(ErrorKind::Transient, Phase::Reclaim, &self.task, err.to_string());
            warn!(
                task_id = %self.task.task_id,
                run_id = %self.task.run_id,
                phase = %Phase::Reclaim,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "reclaim failed, retrying"
            );
            self.send(ReclaimEvent::Retrying {
                failures,
                delay,
                error,
            });

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn lost(&self, kind: ErrorKind, message: String) -> Stop {
        let error = WorkerError::new(kind, Phase::Reclaim, &self.task, message);
        warn!(
            task_id = %self.task.task_id,
            run_id = %self.task.run_id,
            phase = %Phase::Reclaim,
            error = %error,
            "claim lost"
        );
        self.send(ReclaimEvent::Lost(error));
        Stop::Lost
    }

    fn send(&self, event: ReclaimEvent) {
        // manager が先に終了している場合は受信側がいない
        let _ = self.events.send(event);
    }
}
