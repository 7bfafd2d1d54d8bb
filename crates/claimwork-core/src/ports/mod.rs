//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。キュー、HTTP 転送、時計、イベント記録、
//! payload 実行はすべて trait の向こう側にあり、このクレートは実装を持たない
//! （開発・テスト用の実装は `impls` にある）。

pub mod clock;
pub mod event_sink;
pub mod executor;
pub mod queue_client;
pub mod transport;

pub use self::clock::{Clock, SystemClock, TokioClock};
pub use self::event_sink::{EventSink, NoopEventSink};
pub use self::executor::{ExecutionError, ExecutionReport, TaskExecutor};
pub use self::queue_client::{
    ArtifactRequest, ClaimResponse, QueueClient, QueueError, ReclaimResponse, UploadTarget,
};
pub use self::transport::{Method, Transport, TransportError, TransportRequest, TransportResponse};
