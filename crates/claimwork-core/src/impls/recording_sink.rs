//! RecordingEventSink - イベントを全部記録する EventSink
//!
//! Test assertions read the recorded stream through the helpers below.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::domain::{CallResult, DomainEvent, QueueOp, TaskRef, TaskStatus};
use crate::ports::EventSink;

#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn events_mut(&self) -> MutexGuard<'_, Vec<DomainEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events_mut().clone()
    }

    pub fn clear(&self) {
        self.events_mut().clear();
    }

    /// `(op, client_id, result)` for every queue call, in order.
    pub fn queue_calls(&self) -> Vec<(QueueOp, Option<String>, CallResult)> {
        self.events_mut()
            .iter()
            .filter_map(|event| match event {
                DomainEvent::QueueCall {
                    op,
                    client_id,
                    result,
                    ..
                } => Some((*op, client_id.clone(), result.clone())),
                _ => None,
            })
            .collect()
    }

    /// `(op, client_id)` for every queue call sent, including ones that never
    /// returned.
    pub fn issued_calls(&self) -> Vec<(QueueOp, Option<String>)> {
        self.events_mut()
            .iter()
            .filter_map(|event| match event {
                DomainEvent::QueueCallStarted { op, client_id, .. } => Some((*op, client_id.clone())),
                _ => None,
            })
            .collect()
    }

    /// Number of `op` calls sent.
    pub fn issued(&self, op: QueueOp) -> usize {
        self.issued_calls().iter().filter(|(o, _)| *o == op).count()
    }

    /// Number of calls of `op` that returned, successful or not.
    pub fn count(&self, op: QueueOp) -> usize {
        self.queue_calls().iter().filter(|(o, _, _)| *o == op).count()
    }

    /// Local transitions of `task`, in order.
    pub fn state_changes(&self, task: &TaskRef) -> Vec<(TaskStatus, TaskStatus)> {
        self.events_mut()
            .iter()
            .filter_map(|event| match event {
                DomainEvent::StateChanged { task: t, from, to } if t == task => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    /// Response status of each upload attempt for artifact `name`.
    pub fn upload_attempts(&self, name: &str) -> Vec<Option<u16>> {
        self.events_mut()
            .iter()
            .filter_map(|event| match event {
                DomainEvent::UploadAttempt {
                    name: n, status, ..
                } if n == name => Some(*status),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: DomainEvent) {
        self.events_mut().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, RunId, TaskId};

    #[test]
    fn filters_by_kind() {
        let sink = RecordingEventSink::new();
        let task = TaskRef::new(TaskId::new("t1"), RunId::new(0));
        sink.emit(DomainEvent::QueueCallStarted {
            op: QueueOp::ReclaimTask,
            task: Some(task.clone()),
            client_id: Some("client-1".into()),
        });
        sink.emit(DomainEvent::QueueCallStarted {
            op: QueueOp::ReclaimTask,
            task: Some(task.clone()),
            client_id: Some("client-1".into()),
        });
        sink.emit(DomainEvent::QueueCall {
            op: QueueOp::ReclaimTask,
            task: Some(task.clone()),
            client_id: Some("client-1".into()),
            result: CallResult::Err(ErrorKind::Conflict),
        });
        sink.emit(DomainEvent::StateChanged {
            task: task.clone(),
            from: TaskStatus::Running,
            to: TaskStatus::Lost,
        });

        assert_eq!(sink.count(QueueOp::ReclaimTask), 1);
        assert_eq!(sink.issued(QueueOp::ReclaimTask), 2);
        assert_eq!(sink.count(QueueOp::ReportCompleted), 0);
        assert_eq!(
            sink.state_changes(&task),
            vec![(TaskStatus::Running, TaskStatus::Lost)]
        );
        sink.clear();
        assert!(sink.events().is_empty());
    }
}
