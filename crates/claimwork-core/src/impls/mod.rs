//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **TransportQueueClient**: Transport 上の JSON/REST キュークライアント
//! - **ObservedQueueClient**: 呼び出しを EventSink に流すデコレータ
//! - **InMemoryQueueClient**: 開発・テスト用のキュー
//! - **ScriptedTransport**: 台本どおりに応答するテスト用 Transport
//! - **RecordingEventSink**: イベントを記録する EventSink
//!
//! 本番の HTTP クライアント（Transport 実装）は埋め込み側が用意する。

pub mod inmem_queue;
pub mod observed_queue;
pub mod recording_sink;
pub mod scripted_transport;
pub mod transport_queue;

pub use self::inmem_queue::{InMemoryQueueClient, Reply};
pub use self::observed_queue::ObservedQueueClient;
pub use self::recording_sink::RecordingEventSink;
pub use self::scripted_transport::ScriptedTransport;
pub use self::transport_queue::TransportQueueClient;
