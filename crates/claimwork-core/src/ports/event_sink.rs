//! EventSink port - イベント記録の抽象化

use crate::domain::DomainEvent;

/// EventSink はドメインイベントを記録
///
/// `emit` must not block: it is called from the claim and reclaim paths.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: DomainEvent) {}
}
