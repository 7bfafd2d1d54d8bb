//! WorkerContextBuilder - 共有コンポーネントの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - build() 時に設定の整合性をチェック
//! - 署名必須なのに trusted key が空、などは起動時に BuildError

use std::sync::Arc;

use crate::config::{ConfigError, WorkerConfig};
use crate::domain::WorkerInfo;
use crate::ports::{Clock, EventSink, NoopEventSink, QueueClient, SystemClock, Transport};
use crate::trust::{DigestManifest, TrustVerifier, TrustedKeySet};

/// Everything a task's claim manager, uploader and worker loop share.
///
/// Built once, then only read (`Arc<WorkerContext>`). The trusted key set is
/// the only trust state and is never mutated per task.
pub struct WorkerContext {
    queue: Arc<dyn QueueClient>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    verifier: TrustVerifier,
    manifest: Option<Arc<DigestManifest>>,
    config: WorkerConfig,
    worker: WorkerInfo,
}

impl WorkerContext {
    pub fn queue(&self) -> &Arc<dyn QueueClient> {
        &self.queue
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn events(&self) -> &dyn EventSink {
        self.events.as_ref()
    }

    pub fn verifier(&self) -> &TrustVerifier {
        &self.verifier
    }

    pub fn manifest(&self) -> Option<&DigestManifest> {
        self.manifest.as_deref()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn worker(&self) -> &WorkerInfo {
        &self.worker
    }
}

/// BuildError は WorkerContext 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no upload transport configured")]
    MissingTransport,

    #[error("signed artifacts are required but the trusted key set is empty")]
    EmptyTrustedKeys,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// # 使用例
/// ```ignore
/// let ctx = WorkerContextBuilder::new(queue, worker_info)
///     .transport(transport)
///     .trusted_keys(Arc::new(keys))
///     .config(config)
///     .build()?;
/// ```
pub struct WorkerContextBuilder {
    queue: Arc<dyn QueueClient>,
    worker: WorkerInfo,
    transport: Option<Arc<dyn Transport>>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    keys: Arc<TrustedKeySet>,
    manifest: Option<Arc<DigestManifest>>,
    config: WorkerConfig,
}

impl WorkerContextBuilder {
    pub fn new(queue: Arc<dyn QueueClient>, worker: WorkerInfo) -> Self {
        Self {
            queue,
            worker,
            transport: None,
            clock: Arc::new(SystemClock),
            events: Arc::new(NoopEventSink),
            keys: Arc::new(TrustedKeySet::default()),
            manifest: None,
            config: WorkerConfig::default(),
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn trusted_keys(mut self, keys: Arc<TrustedKeySet>) -> Self {
        self.keys = keys;
        self
    }

    pub fn manifest(mut self, manifest: DigestManifest) -> Self {
        self.manifest = Some(Arc::new(manifest));
        self
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Arc<WorkerContext>, BuildError> {
        self.config.validate()?;
        let transport = self.transport.ok_or(BuildError::MissingTransport)?;
        if self.config.require_signed_artifacts && self.keys.is_empty() {
            return Err(BuildError::EmptyTrustedKeys);
        }
        Ok(Arc::new(WorkerContext {
            queue: self.queue,
            transport,
            clock: self.clock,
            events: self.events,
            verifier: TrustVerifier::new(self.keys),
            manifest: self.manifest,
            config: self.config,
            worker: self.worker,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryQueueClient, ScriptedTransport};

    fn builder() -> WorkerContextBuilder {
        WorkerContextBuilder::new(
            Arc::new(InMemoryQueueClient::new()),
            WorkerInfo::new("prov", "type", "group", "w1"),
        )
    }

    #[test]
    fn test_build_success() {
        let ctx = builder().transport(Arc::new(ScriptedTransport::new())).build();
        assert!(ctx.is_ok());
    }

    #[test]
    fn test_build_missing_transport() {
        assert!(matches!(builder().build(), Err(BuildError::MissingTransport)));
    }

    #[test]
    fn test_build_requires_keys_for_signed_artifacts() {
        let config = WorkerConfig {
            require_signed_artifacts: true,
            ..WorkerConfig::default()
        };
        let result = builder()
            .transport(Arc::new(ScriptedTransport::new()))
            .config(config)
            .build();
        assert!(matches!(result, Err(BuildError::EmptyTrustedKeys)));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = WorkerConfig {
            claim_attempts: 0,
            ..WorkerConfig::default()
        };
        let result = builder()
            .transport(Arc::new(ScriptedTransport::new()))
            .config(config)
            .build();
        assert!(matches!(result, Err(BuildError::Config(_))));
    }
}
