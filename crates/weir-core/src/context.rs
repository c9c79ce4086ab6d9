//! The per-attempt run context.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use weir_api::client::OrchestrationClient;
use weir_api::models::TaskRun;

use crate::inputs::ResolvedParameters;
use crate::results::ResultFactory;
use crate::task::Task;

/// Everything a task function can see while it runs.
///
/// The engine builds a fresh context for each attempt (with the task run
/// re-read from the API) and hands it to the function. The context is
/// explicitly threaded; there is no ambient global.
pub struct TaskRunContext {
    pub task: Arc<Task>,
    pub task_run: TaskRun,
    pub parameters: ResolvedParameters,
    pub result_factory: ResultFactory,
    pub client: Arc<dyn OrchestrationClient>,
    /// Whether plain output from the task should be routed to the run log.
    pub log_prints: bool,
}

impl TaskRunContext {
    pub fn task_run_id(&self) -> Uuid {
        self.task_run.id
    }

    pub fn flow_run_id(&self) -> Option<Uuid> {
        self.task_run.flow_run_id
    }

    /// Look up a resolved parameter by name.
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }
}

impl fmt::Debug for TaskRunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunContext")
            .field("task", &self.task.name)
            .field("task_run_id", &self.task_run.id)
            .field("parameters", &self.parameters)
            .field("log_prints", &self.log_prints)
            .finish_non_exhaustive()
    }
}
