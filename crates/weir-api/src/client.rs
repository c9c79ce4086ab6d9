//! The typed facade over the remote state-management API.

use async_trait::async_trait;
use uuid::Uuid;

use crate::filters::FlowRunFilter;
use crate::models::{
    Deployment, DeploymentCreate, FlowRun, FlowRunCreate, State, TaskRun, TaskRunCreate,
};

/// Errors surfaced by orchestration calls.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    /// The server refuses the proposed transition; the run must stop.
    #[error("server aborted the state transition: {reason}")]
    Abort { reason: String },

    /// The server is parking the run. Carries the Paused state when the
    /// server supplied one.
    #[error("server paused the run")]
    Pause { state: Option<State> },

    #[error("object not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Typed facade over the orchestration API.
///
/// State proposals (`set_task_run_state`, `set_flow_run_state`) return the
/// state the server accepted, which may differ from the proposal: the server
/// can substitute a cached Completed state, or answer Pending when it is not
/// ready to let the run proceed. `force` bypasses orchestration rules and is
/// used for transitions that must land (Retrying, Crashed, forced renames of
/// a Pending state).
#[async_trait]
pub trait OrchestrationClient: Send + Sync {
    async fn create_task_run(&self, create: TaskRunCreate) -> Result<TaskRun, OrchestrationError>;

    async fn read_task_run(&self, id: Uuid) -> Result<TaskRun, OrchestrationError>;

    async fn set_task_run_name(&self, id: Uuid, name: &str) -> Result<(), OrchestrationError>;

    async fn set_task_run_state(
        &self,
        id: Uuid,
        state: State,
        force: bool,
    ) -> Result<State, OrchestrationError>;

    async fn create_flow_run(&self, create: FlowRunCreate) -> Result<FlowRun, OrchestrationError>;

    async fn read_flow_run(&self, id: Uuid) -> Result<FlowRun, OrchestrationError>;

    async fn read_flow_runs(
        &self,
        filter: &FlowRunFilter,
    ) -> Result<Vec<FlowRun>, OrchestrationError>;

    async fn set_flow_run_state(
        &self,
        id: Uuid,
        state: State,
        force: bool,
    ) -> Result<State, OrchestrationError>;

    async fn create_deployment(
        &self,
        create: DeploymentCreate,
    ) -> Result<Deployment, OrchestrationError>;

    async fn read_deployment(&self, id: Uuid) -> Result<Deployment, OrchestrationError>;

    async fn update_schedule(
        &self,
        deployment_id: Uuid,
        active: bool,
    ) -> Result<(), OrchestrationError>;
}
