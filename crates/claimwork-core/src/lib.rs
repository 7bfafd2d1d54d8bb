//! claimwork-core
//!
//! Worker-side core of a distributed task-execution system: claim a task run
//! from a coordination queue, keep the claim alive while the payload runs,
//! verify and upload the artifacts it produced, and report exactly one
//! terminal outcome.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, state, outcome, artifact, errors, events）
//! - **trust**: artifact の chain of trust（digest, trusted keys, signature 検証）
//! - **ports**: 抽象化レイヤー（QueueClient, Transport, Clock, EventSink, TaskExecutor）
//! - **app**: アプリケーションロジック（TaskClaimManager, ReclaimScheduler, ArtifactUploader, Worker）
//! - **impls**: ports の実装（REST クライアント、開発・テスト用の in-memory 実装）
//! - **config**: WorkerConfig

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod trust;

pub use app::{
    ArtifactUploader, BuildError, ReportDisposition, TaskClaimManager, TaskRunSummary, Worker,
    WorkerContext, WorkerContextBuilder, WorkerGroup,
};
pub use config::{ConfigError, WorkerConfig};
pub use domain::{ErrorKind, Outcome, Phase, TaskStatus, WorkerError};
pub use trust::{TrustVerifier, TrustedKeySet};
