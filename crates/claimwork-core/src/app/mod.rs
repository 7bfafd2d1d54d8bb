//! App - アプリケーション層
//!
//! ports を組み合わせて claim のライフサイクルを実装する。
//!
//! # 主要コンポーネント
//! - **WorkerContextBuilder**: 共有コンポーネントの構築とワイヤリング
//! - **TaskClaimManager**: 1 タスクの claim → 実行 → 報告
//! - **ReclaimScheduler**: claim の更新タイマー（タスクごと）
//! - **ArtifactUploader**: artifact の検証とアップロード
//! - **Worker / WorkerGroup**: ポーリングと実行ループ
//! - **RetryPolicy**: 一時的な失敗の backoff

pub mod builder;
pub mod claim_manager;
pub mod reclaim_scheduler;
pub mod retry;
pub mod uploader;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, WorkerContext, WorkerContextBuilder};
pub use self::claim_manager::{ReportDisposition, TaskClaimManager};
pub use self::reclaim_scheduler::{ReclaimEvent, ReclaimScheduler};
pub use self::retry::RetryPolicy;
pub use self::uploader::ArtifactUploader;
pub use self::worker_loop::{TaskRunSummary, Worker, WorkerGroup};
