//! ArtifactUploader - artifact の検証とアップロード
//!
//! # パイプライン
//! 1. sha256 を計算
//! 2. manifest に載っていれば期待値と突き合わせ（不一致は Integrity、アップロードしない）
//! 3. 署名があれば（または必須なら）TrustVerifier で検証
//! 4. createArtifact でアップロード先を取得
//! 5. Transport で PUT（リトライ付き）
//!
//! Errors keep their phase: a queue refusal of `createArtifact` is
//! `Phase::Artifact`, a failed transfer is `Phase::Upload`, digest and signer
//! rejections are `Phase::Verify`.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::app::builder::WorkerContext;
use crate::app::claim_manager::TaskClaimManager;
use crate::domain::{
    Artifact, DomainEvent, ErrorKind, Phase, TaskRef, UploadedArtifact, WorkerError,
};
use crate::ports::{
    ArtifactRequest, Method, QueueError, TransportError, TransportRequest, UploadTarget,
};
use crate::trust::Sha256Digest;

pub struct ArtifactUploader {
    ctx: Arc<WorkerContext>,
}

impl ArtifactUploader {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    /// Ask the queue where to put `name`.
    ///
    /// Uses the manager's current credentials. A queue refusal comes back with
    /// `Phase::Artifact` and the queue error's kind; Conflict/Unavailable also
    /// mark the task lost.
    pub async fn create_artifact(
        &self,
        manager: &TaskClaimManager,
        name: &str,
        content_type: &str,
    ) -> Result<UploadTarget, WorkerError> {
        let task_ref = manager.task_ref();
        let status = manager.status();
        let (credentials, deadline) = match (manager.credentials(), manager.call_deadline()) {
            (Some(credentials), Some(deadline)) if status.holds_claim() => (credentials, deadline),
            _ => {
                return Err(WorkerError::new(
                    ErrorKind::InvalidState,
                    Phase::Artifact,
                    task_ref,
                    format!("cannot create artifact {name} while {status}"),
                ));
            }
        };

        let budget = self.ctx.clock().until(deadline);
        if budget.is_zero() {
            return Err(manager.expire(
                Phase::Artifact,
                format!("claim too close to expiry to create artifact {name}"),
            ));
        }

        let request = ArtifactRequest {
            content_type: content_type.to_string(),
            expires: self.expiry(),
        };
        let queue_timeout = self.ctx.config().queue_timeout();
        let call = self.ctx.queue().create_artifact(
            &task_ref.task_id,
            task_ref.run_id,
            &credentials,
            name,
            &request,
        );
        let result = match tokio::time::timeout(budget.min(queue_timeout), call).await {
            Ok(result) => result,
            // 待っている間に reclaim で延長されていれば、ただのタイムアウト扱い
            Err(_) if manager
                .call_deadline()
                .is_none_or(|current| self.ctx.clock().until(current).is_zero()) =>
            {
                return Err(manager.expire(
                    Phase::Artifact,
                    format!("createArtifact {name} still unanswered when the claim window closed"),
                ));
            }
            Err(_) => Err(QueueError::transport(format!("createArtifact {name} timed out"))),
        };

        result.map_err(|e| {
            let err = WorkerError::new(
                e.kind(),
                Phase::Artifact,
                task_ref,
                format!("artifact {name} rejected: {e}"),
            );
            if e.kind().is_claim_gone() {
                manager.mark_lost(err.clone());
            }
            err
        })
    }

    /// PUT `content` to `target`, retrying up to `upload_attempts`.
    ///
    /// Before every attempt the bytes about to be sent are hashed again and
    /// compared with `expected`.
    pub async fn upload(
        &self,
        task: &TaskRef,
        name: &str,
        target: &UploadTarget,
        content: &Bytes,
        expected: &Sha256Digest,
    ) -> Result<(), WorkerError> {
        let config = self.ctx.config();
        let attempts = config.upload_attempts;
        let mut last_failure = String::new();

        for attempt in 1..=attempts {
            let body = content.clone();
            let sent = Sha256Digest::of(&body);
            if sent != *expected {
                return Err(WorkerError::new(
                    ErrorKind::Integrity,
                    Phase::Upload,
                    task,
                    format!("{name}: content changed before transfer (expected {expected}, sending {sent})"),
                ));
            }

            let request = TransportRequest::new(Method::Put, target.upload_destination.as_str())
                .header("content-type", target.content_type.as_str())
                .header("content-length", body.len().to_string())
                .body(body);
            let result =
                tokio::time::timeout(config.upload_timeout(), self.ctx.transport().request(request)).await;

            let status = match result {
                Ok(Ok(resp)) if resp.is_success() => {
                    self.attempted(task, name, attempt, Some(resp.status));
                    debug!(task_id = %task.task_id, run_id = %task.run_id, artifact = name, attempt, "upload ok");
                    return Ok(());
                }
                Ok(Ok(resp)) => {
                    last_failure = format!("HTTP {}", resp.status);
                    Some(resp.status)
                }
                Ok(Err(e)) => {
                    last_failure = e.to_string();
                    None
                }
                Err(_) => {
                    last_failure = TransportError::Timeout.to_string();
                    None
                }
            };
            self.attempted(task, name, attempt, status);

            if attempt < attempts {
                let delay = config.retry.next_delay(attempt);
                warn!(
                    task_id = %task.task_id,
                    run_id = %task.run_id,
                    phase = %Phase::Upload,
                    artifact = name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_failure,
                    "upload failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(WorkerError::new(
            ErrorKind::Transient,
            Phase::Upload,
            task,
            format!("upload of {name} failed after {attempts} attempt(s), last: {last_failure}"),
        ))
    }

    /// Digest, verify and upload one artifact for a running task.
    pub async fn upload_artifact(
        &self,
        manager: &TaskClaimManager,
        artifact: &Artifact,
    ) -> Result<UploadedArtifact, WorkerError> {
        let task_ref = manager.task_ref();
        let name = artifact.name();
        let digest = artifact.digest();

        if let Some(expected) = self.ctx.manifest().and_then(|m| m.expected(name))
            && *expected != digest
        {
            return Err(WorkerError::new(
                ErrorKind::Integrity,
                Phase::Verify,
                task_ref,
                format!("{name}: sha256 {digest} does not match manifest {expected}"),
            ));
        }

        let signer = match artifact.signature() {
            Some(signature) => {
                let identity = self
                    .ctx
                    .verifier()
                    .verify_signature(&digest, signature)
                    .map_err(|e| {
                        WorkerError::new(e.kind(), Phase::Verify, task_ref, format!("{name}: {e}"))
                    })?;
                Some(identity)
            }
            None if self.ctx.config().require_signed_artifacts => {
                return Err(WorkerError::new(
                    ErrorKind::Untrusted,
                    Phase::Verify,
                    task_ref,
                    format!("{name}: unsigned artifact"),
                ));
            }
            None => None,
        };

        let target = self
            .create_artifact(manager, name, artifact.content_type())
            .await?;

        let lost = manager.cancellation();
        tokio::select! {
            biased;
            _ = lost.cancelled() => {
                let reason = manager.lost_reason().unwrap_or_else(|| {
                    WorkerError::new(ErrorKind::Expired, Phase::Upload, task_ref, "claim lost during upload")
                });
                return Err(reason);
            }
            result = self.upload(task_ref, name, &target, artifact.content(), &digest) => result?,
        }

        info!(
            task_id = %task_ref.task_id,
            run_id = %task_ref.run_id,
            artifact = name,
            sha256 = %digest,
            signer = signer.as_deref().unwrap_or("-"),
            "artifact uploaded"
        );
        Ok(UploadedArtifact {
            name: name.to_string(),
            content_type: artifact.content_type().to_string(),
            sha256: digest,
            size: artifact.len(),
            signer,
        })
    }

    fn expiry(&self) -> DateTime<Utc> {
        let now = self.ctx.clock().now();
        chrono::Duration::from_std(self.ctx.config().artifact_expiry())
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn attempted(&self, task: &TaskRef, name: &str, attempt: u32, status: Option<u16>) {
        self.ctx.events().emit(DomainEvent::UploadAttempt {
            task: task.clone(),
            name: name.to_string(),
            attempt,
            status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::builder::WorkerContextBuilder;
    use crate::config::WorkerConfig;
    use crate::domain::{QueueOp, RunId, TaskId, TaskStatus, WorkerInfo};
    use crate::impls::{InMemoryQueueClient, ObservedQueueClient, RecordingEventSink, ScriptedTransport};
    use crate::ports::{QueueError, TokioClock, TransportResponse};
    use crate::trust::keyset::fixtures::GOOD_KEYS_JSON;
    use crate::trust::{DigestManifest, SignatureStatement, TrustedKeySet};

    const FOO_SHA: &str = "b5bb9d8014a0f9b1d61e21e796d78dccdf1352f23cd32812f4850b878ae4944c";

    struct Harness {
        queue: Arc<InMemoryQueueClient>,
        transport: Arc<ScriptedTransport>,
        sink: Arc<RecordingEventSink>,
        ctx: Arc<WorkerContext>,
    }

    fn harness(config: WorkerConfig, manifest: Option<DigestManifest>) -> Harness {
        let clock = Arc::new(TokioClock::new());
        let sink = Arc::new(RecordingEventSink::new());
        let queue = Arc::new(InMemoryQueueClient::new().with_clock(clock.clone()));
        let transport = Arc::new(ScriptedTransport::new());
        let keys = TrustedKeySet::from_json_str(GOOD_KEYS_JSON).unwrap();
        let mut builder = WorkerContextBuilder::new(
            Arc::new(ObservedQueueClient::new(queue.clone(), sink.clone())),
            WorkerInfo::new("prov", "type", "group", "w1"),
        )
        .transport(transport.clone())
        .clock(clock)
        .event_sink(sink.clone())
        .trusted_keys(Arc::new(keys))
        .config(config);
        if let Some(manifest) = manifest {
            builder = builder.manifest(manifest);
        }
        Harness {
            queue,
            transport,
            sink,
            ctx: builder.build().unwrap(),
        }
    }

    async fn running(h: &Harness) -> TaskClaimManager {
        let manager = TaskClaimManager::claim_task(h.ctx.clone(), TaskId::new("t1"), RunId::new(0))
            .await
            .unwrap();
        manager.start_work().unwrap();
        manager
    }

    fn signed_foo(signer: &str, fingerprint: &str, keyid: &str) -> Artifact {
        let content = Bytes::from_static(b"foo\n");
        let statement =
            SignatureStatement::new(signer, fingerprint, keyid, &Sha256Digest::of(&content));
        Artifact::new("public/foo", "text/plain", content).with_signature(statement.to_bytes())
    }

    #[tokio::test(start_paused = true)]
    async fn uploads_signed_artifact() {
        let h = harness(WorkerConfig::default(), None);
        let manager = running(&h).await;
        let uploader = ArtifactUploader::new(h.ctx.clone());
        let artifact = signed_foo(
            "scriptworker@example.com",
            "FB7765CD0FC616FF7AC961A1D9DC50F64C7D44CF",
            "4C7D44CF",
        );

        let uploaded = uploader.upload_artifact(&manager, &artifact).await.unwrap();

        assert_eq!(uploaded.sha256.to_hex(), FOO_SHA);
        assert_eq!(uploaded.signer.as_deref(), Some("scriptworker@example.com"));
        let requests = h.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::Put);
        assert_eq!(requests[0].body.as_ref(), b"foo\n");
        assert_eq!(h.sink.count(QueueOp::CreateArtifact), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_retries_then_gives_up() {
        let config = WorkerConfig {
            upload_attempts: 3,
            ..WorkerConfig::default()
        };
        let h = harness(config, None);
        let manager = running(&h).await;
        for _ in 0..3 {
            h.transport.push_response(TransportResponse::new(503, ""));
        }
        let uploader = ArtifactUploader::new(h.ctx.clone());

        let err = uploader
            .upload_artifact(&manager, &Artifact::new("public/foo", "text/plain", "foo\n"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.phase(), Phase::Upload);
        assert_eq!(h.transport.requests().len(), 3);
        assert_eq!(h.sink.upload_attempts("public/foo"), vec![Some(503); 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_is_retried() {
        let h = harness(WorkerConfig::default(), None);
        let manager = running(&h).await;
        h.transport
            .push_error(TransportError::Connection("reset by peer".into()));
        let uploader = ArtifactUploader::new(h.ctx.clone());

        uploader
            .upload_artifact(&manager, &Artifact::new("public/foo", "text/plain", "foo\n"))
            .await
            .unwrap();

        assert_eq!(h.sink.upload_attempts("public/foo"), vec![None, Some(200)]);
    }

    #[tokio::test(start_paused = true)]
    async fn manifest_mismatch_skips_upload() {
        let mut manifest = DigestManifest::new();
        manifest.insert("public/foo", Sha256Digest::from_hex(FOO_SHA).unwrap());
        let h = harness(WorkerConfig::default(), Some(manifest));
        let manager = running(&h).await;
        let uploader = ArtifactUploader::new(h.ctx.clone());

        let err = uploader
            .upload_artifact(&manager, &Artifact::new("public/foo", "text/plain", "fob\n"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(h.transport.requests().is_empty());
        assert_eq!(h.sink.count(QueueOp::CreateArtifact), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_rechecks_sent_bytes() {
        let h = harness(WorkerConfig::default(), None);
        let manager = running(&h).await;
        let uploader = ArtifactUploader::new(h.ctx.clone());
        let target = uploader
            .create_artifact(&manager, "public/foo", "text/plain")
            .await
            .unwrap();

        let err = uploader
            .upload(
                manager.task_ref(),
                "public/foo",
                &target,
                &Bytes::from_static(b"foo!"),
                &Sha256Digest::from_hex(FOO_SHA).unwrap(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_signer_is_untrusted() {
        let h = harness(WorkerConfig::default(), None);
        let manager = running(&h).await;
        let uploader = ArtifactUploader::new(h.ctx.clone());
        let artifact = signed_foo(
            "unknown@example.com",
            "B45FE2F4035C3786120998174ACA2B25224905DA",
            "224905DA",
        );

        let err = uploader.upload_artifact(&manager, &artifact).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Untrusted);
        assert_eq!(err.phase(), Phase::Verify);
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unsigned_rejected_when_signatures_required() {
        let config = WorkerConfig {
            require_signed_artifacts: true,
            ..WorkerConfig::default()
        };
        let h = harness(config, None);
        let manager = running(&h).await;
        let uploader = ArtifactUploader::new(h.ctx.clone());

        let err = uploader
            .upload_artifact(&manager, &Artifact::new("public/foo", "text/plain", "foo\n"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Untrusted);
    }

    #[tokio::test(start_paused = true)]
    async fn create_conflict_marks_task_lost() {
        let h = harness(WorkerConfig::default(), None);
        let manager = running(&h).await;
        h.queue
            .fail_next(QueueOp::CreateArtifact, QueueError::from_status(409, "gone"));
        let uploader = ArtifactUploader::new(h.ctx.clone());

        let err = uploader
            .upload_artifact(&manager, &Artifact::new("public/foo", "text/plain", "foo\n"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.phase(), Phase::Artifact);
        assert_eq!(manager.status(), TaskStatus::Lost);
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_create_artifact_times_out() {
        let h = harness(WorkerConfig::default(), None);
        let manager = running(&h).await;
        h.queue.hang_next(QueueOp::CreateArtifact);
        let uploader = ArtifactUploader::new(h.ctx.clone());

        let err = uploader
            .create_artifact(&manager, "public/foo", "text/plain")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.phase(), Phase::Artifact);
        assert_eq!(manager.status(), TaskStatus::Running);
        assert_eq!(h.sink.issued(QueueOp::CreateArtifact), 1);
        assert_eq!(h.sink.count(QueueOp::CreateArtifact), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn create_artifact_outlasting_the_claim_loses_it() {
        let config = WorkerConfig {
            queue_timeout_ms: 3 * 60 * 60 * 1000,
            ..WorkerConfig::default()
        };
        let h = harness(config, None);
        let manager = running(&h).await;
        // reclaim も失敗させて延長されないようにする
        h.queue
            .fail_next(QueueOp::ReclaimTask, QueueError::malformed("no takenUntil"));
        h.queue.hang_next(QueueOp::CreateArtifact);
        let uploader = ArtifactUploader::new(h.ctx.clone());

        let err = uploader
            .create_artifact(&manager, "public/foo", "text/plain")
            .await
            .unwrap_err();

        assert_eq!(manager.status(), TaskStatus::Lost);
        assert!(manager.cancellation().is_cancelled());
        assert_eq!(err.kind(), ErrorKind::Expired);
        assert_eq!(err.phase(), Phase::Artifact);
    }
}
