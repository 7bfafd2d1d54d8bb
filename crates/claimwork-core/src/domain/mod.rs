//! Domain model (IDs, task record, outcomes, artifacts, errors, events).

pub mod artifact;
pub mod errors;
pub mod events;
pub mod ids;
pub mod outcome;
pub mod state;
pub mod task;

pub use artifact::{Artifact, UploadedArtifact};
pub use errors::{ErrorKind, Phase, WorkerError};
pub use events::{CallResult, DomainEvent, QueueOp};
pub use ids::{RunId, TaskId, TaskRef, WorkerInfo};
pub use outcome::{ExceptionReason, Outcome};
pub use state::TaskStatus;
pub use task::{ClaimCredentials, Task};
