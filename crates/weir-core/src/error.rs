//! Error taxonomy for the execution core.

use uuid::Uuid;

use weir_api::client::OrchestrationError;
use weir_api::storage::ResultError;

use crate::inputs::ResolveError;

/// An upstream dependency of a task run has not finished successfully.
///
/// Raised during parameter resolution; it is not a failure of the dependent
/// task. The engine answers it by parking the run as `Pending{NotReady}`
/// without invoking the task function.
#[derive(Debug, Clone, thiserror::Error)]
#[error("upstream task run {task_run_id} did not reach a Completed state: {reason}")]
pub struct UpstreamTaskError {
    pub task_run_id: Uuid,
    pub reason: String,
}

/// Errors surfaced by [`run_task`](crate::engine::run_task).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The run reached a non-Completed final state and a result was
    /// requested. Carries the stored failure message.
    #[error("{message}")]
    Failed { message: String },

    /// The server refused a state transition; the run is over.
    #[error("run was aborted by the orchestration server: {0}")]
    Aborted(String),

    /// The run was paused with reschedule semantics; it will be resumed by
    /// external action.
    #[error("run was paused and rescheduled; it must be resumed externally")]
    Paused,

    /// A result was requested but the run never reached a final state.
    #[error("the task run is not finished")]
    Unfinished,

    #[error("failed to resolve task inputs")]
    Resolution(#[source] ResolveError),

    #[error(transparent)]
    Result(#[from] ResultError),

    #[error(transparent)]
    Client(OrchestrationError),
}

impl From<OrchestrationError> for EngineError {
    fn from(err: OrchestrationError) -> Self {
        match err {
            OrchestrationError::Abort { reason } => Self::Aborted(reason),
            OrchestrationError::Pause { .. } => Self::Paused,
            other => Self::Client(other),
        }
    }
}
