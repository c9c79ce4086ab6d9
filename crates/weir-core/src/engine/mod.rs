//! The task engine: drives one task invocation through its state machine.
//!
//! An engine owns exactly one task run. It proposes every state transition
//! to the orchestration client, so the sequence of states any observer sees
//! is totally ordered. State changes are event-driven on return from user
//! code, with one exception: the initial Running proposal is re-polled with
//! clamped Poisson backoff while the server answers Pending or Paused.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use uuid::Uuid;

use weir_api::client::{OrchestrationClient, OrchestrationError};
use weir_api::models::{State, StateDetails, TaskRun, TaskRunCreate, TaskRunInput};

use crate::context::TaskRunContext;
use crate::error::EngineError;
use crate::inputs::{
    Parameters, ResolveError, ResolvedParameters, TaskFuture, collect_futures,
    resolve_parameters, wait_for_dependencies,
};
use crate::math::clamped_poisson_interval;
use crate::results::ResultFactory;
use crate::settings::Settings;
use crate::task::{Task, render_run_name};

/// The poll interval while waiting out a Pending/Paused answer grows
/// 1, 2, … up to this many seconds on average.
pub const BACKOFF_MAX: u32 = 10;

const POLL_JITTER: f64 = 0.3;

/// What [`run_task`] should yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnType {
    /// The unwrapped result value; a non-Completed final state re-raises
    /// the stored failure.
    #[default]
    Result,
    /// The final state itself, whatever it is.
    State,
}

/// Outcome of a task run, per the requested [`ReturnType`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Value(Value),
    State(State),
}

impl RunOutcome {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::State(_) => None,
        }
    }

    pub fn into_state(self) -> Option<State> {
        match self {
            Self::State(state) => Some(state),
            Self::Value(_) => None,
        }
    }
}

/// Inputs to [`run_task`] beyond the task itself.
#[derive(Default)]
pub struct RunTaskOptions {
    /// Pre-allocated id for the task run to create.
    pub task_run_id: Option<Uuid>,
    /// An existing task run to drive instead of creating one.
    pub task_run: Option<TaskRun>,
    pub parameters: Parameters,
    /// Upstream runs to block on without consuming their values.
    pub wait_for: Vec<TaskFuture>,
    /// Extra task inputs to record, keyed like `task_inputs`.
    pub dependencies: HashMap<String, Vec<TaskRunInput>>,
    pub return_type: ReturnType,
    pub settings: Settings,
}

struct TaskRunEngine {
    task: Arc<Task>,
    client: Arc<dyn OrchestrationClient>,
    settings: Settings,
    parameters: Parameters,
    wait_for: Vec<TaskFuture>,
    task_run: TaskRun,
    resolved: ResolvedParameters,
    retries_used: u32,
    task_name_set: bool,
}

impl TaskRunEngine {
    /// Enter the client context, creating the task run when none was given.
    async fn start(
        client: Arc<dyn OrchestrationClient>,
        task: Arc<Task>,
        options: RunTaskOptions,
    ) -> Result<Self, EngineError> {
        let task_run = match options.task_run {
            Some(task_run) => task_run,
            None => {
                let mut task_inputs: HashMap<String, Vec<TaskRunInput>> = HashMap::new();
                for (name, parameter) in &options.parameters {
                    let mut ids = Vec::new();
                    collect_futures(parameter, &mut ids);
                    if !ids.is_empty() {
                        task_inputs.insert(
                            name.clone(),
                            ids.into_iter().map(|id| TaskRunInput { id }).collect(),
                        );
                    }
                }
                if !options.wait_for.is_empty() {
                    task_inputs
                        .entry("wait_for".to_owned())
                        .or_default()
                        .extend(
                            options
                                .wait_for
                                .iter()
                                .map(|future| TaskRunInput { id: future.task_run_id }),
                        );
                }
                for (name, inputs) in options.dependencies {
                    task_inputs.entry(name).or_default().extend(inputs);
                }

                client
                    .create_task_run(TaskRunCreate {
                        id: options.task_run_id,
                        name: task.name.clone(),
                        task_key: task.name.clone(),
                        flow_run_id: None,
                        task_inputs,
                    })
                    .await?
            }
        };

        tracing::info!(
            task_run_id = %task_run.id,
            task_run_name = %task_run.name,
            task_name = %task.name,
            "Created task run"
        );

        Ok(Self {
            task,
            client,
            settings: options.settings,
            parameters: options.parameters,
            wait_for: options.wait_for,
            task_run,
            resolved: ResolvedParameters::new(),
            retries_used: 0,
            task_name_set: false,
        })
    }

    fn is_running(&self) -> bool {
        self.task_run.state.is_running()
    }

    fn result_store(&self) -> Option<Arc<weir_api::storage::LocalResultStore>> {
        ResultFactory::from_task(&self.task).store
    }

    fn build_context(&self) -> TaskRunContext {
        TaskRunContext {
            task: Arc::clone(&self.task),
            task_run: self.task_run.clone(),
            parameters: self.resolved.clone(),
            result_factory: ResultFactory::from_task(&self.task),
            client: Arc::clone(&self.client),
            log_prints: self.task.log_prints,
        }
    }

    /// Cache metadata for a proposed state. `cache_expiration` is computed
    /// only for the terminal Completed state.
    fn compute_state_details(&self, include_cache_expiration: bool) -> StateDetails {
        let cache_key = self.task.cache_key_fn.as_ref().and_then(|cache_key_fn| {
            let ctx = self.build_context();
            cache_key_fn(&ctx, &self.resolved)
        });
        let refresh_cache = self
            .task
            .refresh_cache
            .unwrap_or(self.settings.tasks_refresh_cache);
        let cache_expiration = if include_cache_expiration {
            self.task.cache_expiration.map(|expiration| Utc::now() + expiration)
        } else {
            None
        };
        StateDetails {
            cache_key,
            refresh_cache,
            cache_expiration,
            pause_reschedule: false,
        }
    }

    /// Propose a state and record what the server accepted.
    ///
    /// A pause signal without reschedule is treated as an in-process pause:
    /// the Paused state is adopted and polling continues. With reschedule
    /// the engine exits immediately.
    async fn set_state(&mut self, state: State, force: bool) -> Result<State, EngineError> {
        let proposed_type = state.state_type;
        let proposed_data = state.data.clone();
        match self
            .client
            .set_task_run_state(self.task_run.id, state, force)
            .await
        {
            Ok(mut accepted) => {
                // The server strips in-memory payloads; keep our reference
                // so the result stays readable in this process.
                if accepted.data.is_none() && accepted.state_type == proposed_type {
                    accepted.data = proposed_data;
                }
                self.task_run.state = accepted.clone();
                Ok(accepted)
            }
            Err(OrchestrationError::Pause { state }) => {
                let paused = state.unwrap_or_else(|| State::paused(false));
                if paused.details.pause_reschedule {
                    return Err(EngineError::Paused);
                }
                self.task_run.state = paused.clone();
                Ok(paused)
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Resolve inputs and drive the run into Running.
    async fn begin_run(&mut self) -> Result<(), EngineError> {
        let store = self.result_store();
        let resolution = async {
            let resolved =
                resolve_parameters(self.client.as_ref(), store.as_deref(), &self.parameters)
                    .await?;
            wait_for_dependencies(self.client.as_ref(), &self.wait_for).await?;
            Ok::<_, ResolveError>(resolved)
        }
        .await;

        match resolution {
            Ok(resolved) => self.resolved = resolved,
            Err(ResolveError::Upstream(upstream)) => {
                // Not a failure of this task; park it and let the caller
                // re-run once the upstream finishes. Force the rename when
                // the run is already pending.
                let force = self.task_run.state.is_pending();
                let not_ready = State::pending()
                    .with_name("NotReady")
                    .with_message(upstream.to_string());
                self.set_state(not_ready, force).await?;
                return Ok(());
            }
            Err(other) => return Err(EngineError::Resolution(other)),
        }

        let details = self.compute_state_details(false);
        let running = State::running().with_details(details);
        let mut state = self.set_state(running.clone(), false).await?;

        let mut backoff_count: u32 = 0;
        while state.is_pending() || state.is_paused() {
            if backoff_count < BACKOFF_MAX {
                backoff_count += 1;
            }
            let interval = clamped_poisson_interval(f64::from(backoff_count), POLL_JITTER);
            tokio::time::sleep(Duration::from_secs_f64(interval)).await;
            state = self.set_state(running.clone(), false).await?;
        }
        Ok(())
    }

    /// Refresh the task run from the API and open a new attempt context.
    /// The run name is rendered from its template exactly once per run.
    async fn enter_attempt(&mut self) -> Result<Arc<TaskRunContext>, EngineError> {
        self.task_run = self.client.read_task_run(self.task_run.id).await?;

        if !self.task_name_set {
            if let Some(template) = self.task.task_run_name.clone() {
                let name = render_run_name(&template, &self.resolved);
                self.client
                    .set_task_run_name(self.task_run.id, &name)
                    .await?;
                tracing::debug!(
                    task_run_id = %self.task_run.id,
                    from = %self.task_run.name,
                    to = %name,
                    "renamed task run"
                );
                self.task_run.name = name;
                self.task_name_set = true;
            }
        }

        Ok(Arc::new(self.build_context()))
    }

    async fn handle_success(&mut self, value: Value) -> Result<(), EngineError> {
        let factory = ResultFactory::from_task(&self.task);
        let details = self.compute_state_details(true);
        let payload = factory.create(&value, details.cache_key.as_deref())?;
        let terminal = State::completed().with_data(payload).with_details(details);
        self.set_state(terminal, false).await?;
        Ok(())
    }

    fn can_retry(&self) -> bool {
        let Some(condition) = &self.task.retry_condition else {
            return true;
        };
        tracing::debug!(task_name = %self.task.name, "running retry condition check");
        match condition(&self.task, &self.task_run, &self.task_run.state) {
            Ok(should_retry) => should_retry,
            Err(error) => {
                tracing::error!(
                    task_name = %self.task.name,
                    error = %error,
                    "error while evaluating the retry condition; not retrying"
                );
                false
            }
        }
    }

    /// Consume a retry if one is available and the condition allows it.
    async fn handle_retry(&mut self) -> Result<bool, EngineError> {
        if self.retries_used < self.task.retries && self.can_retry() {
            self.set_state(State::retrying(), true).await?;
            self.retries_used += 1;
            return Ok(true);
        }
        Ok(false)
    }

    async fn handle_exception(&mut self, error: anyhow::Error) -> Result<(), EngineError> {
        if self.handle_retry().await? {
            return Ok(());
        }
        let failed = State::failed(format!("Task run encountered an exception: {error:#}"));
        self.set_state(failed, false).await?;
        Ok(())
    }

    /// Timeouts always fail; the retry condition is never consulted.
    async fn handle_timeout(&mut self) -> Result<(), EngineError> {
        let seconds = self
            .task
            .timeout
            .map(|timeout| timeout.as_secs_f64())
            .unwrap_or_default();
        let message = format!("Task run exceeded timeout of {seconds} seconds");
        tracing::error!(task_run_id = %self.task_run.id, "{message}");
        let timed_out = State::failed(message).with_name("TimedOut");
        self.set_state(timed_out, false).await?;
        Ok(())
    }

    async fn handle_crash(&mut self, message: &str) -> Result<(), EngineError> {
        let state = State::crashed(format!(
            "Execution was interrupted by an unexpected failure: {message}"
        ));
        tracing::error!(
            task_run_id = %self.task_run.id,
            "Crash detected! {}",
            state.message.as_deref().unwrap_or_default()
        );
        self.set_state(state, true).await?;
        Ok(())
    }

    async fn run_hooks(&self) {
        let state = self.task_run.state.clone();
        let hooks = if state.is_failed() {
            self.task.on_failure.clone()
        } else if state.is_completed() {
            self.task.on_completion.clone()
        } else {
            Vec::new()
        };

        for (index, hook) in hooks.into_iter().enumerate() {
            tracing::info!(
                task_run_id = %self.task_run.id,
                hook = index,
                "Running hook in response to entering state {}",
                state.name
            );
            match hook(Arc::clone(&self.task), self.task_run.clone(), state.clone()).await {
                Ok(()) => tracing::info!(
                    task_run_id = %self.task_run.id,
                    hook = index,
                    "Hook finished running successfully"
                ),
                Err(error) => tracing::error!(
                    task_run_id = %self.task_run.id,
                    hook = index,
                    error = %error,
                    "An error was encountered while running hook"
                ),
            }
        }
    }

    fn result(&self, raise_on_failure: bool) -> Result<Value, EngineError> {
        let state = &self.task_run.state;
        if state.is_completed() {
            let store = self.result_store();
            return state.result(store.as_deref()).map_err(EngineError::from);
        }
        if !state.is_final() {
            return Err(EngineError::Unfinished);
        }
        if raise_on_failure {
            return Err(EngineError::Failed {
                message: state
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("task run finished in state {state}")),
            });
        }
        Err(weir_api::storage::ResultError::Missing.into())
    }

    fn log_finished(&self) {
        let state = &self.task_run.state;
        let state_display = if self.settings.debug_mode {
            format!("{state:?}")
        } else {
            state.to_string()
        };
        if state.is_completed() {
            tracing::info!(task_run_id = %self.task_run.id, "Finished in state {state_display}");
        } else {
            tracing::error!(task_run_id = %self.task_run.id, "Finished in state {state_display}");
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Run one task invocation to its final state.
///
/// Ordinary errors from the task function become retries or a Failed state;
/// timeouts become `Failed{TimedOut}` without consulting the retry
/// condition; panics are recorded as a forced Crashed state and then
/// resumed so the host process exits non-zero. Abort and pause-reschedule
/// signals from the server surface as [`EngineError`] variants.
pub async fn run_task(
    client: Arc<dyn OrchestrationClient>,
    task: Arc<Task>,
    options: RunTaskOptions,
) -> Result<RunOutcome, EngineError> {
    let return_type = options.return_type;
    let mut engine = TaskRunEngine::start(client, task, options).await?;

    let unwound = {
        let body = async {
            engine.begin_run().await?;

            while engine.is_running() {
                let ctx = engine.enter_attempt().await?;
                let timeout = engine.task.timeout;
                let call = engine.task.call(ctx);
                let attempt = match timeout {
                    Some(limit) => tokio::time::timeout(limit, call).await,
                    None => Ok(call.await),
                };
                match attempt {
                    Ok(Ok(value)) => engine.handle_success(value).await?,
                    Ok(Err(error)) => engine.handle_exception(error).await?,
                    Err(_elapsed) => engine.handle_timeout().await?,
                }
            }

            Ok::<(), EngineError>(())
        };
        AssertUnwindSafe(body).catch_unwind().await
    };

    match unwound {
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            if let Err(error) = engine.handle_crash(&message).await {
                tracing::error!(
                    task_run_id = %engine.task_run.id,
                    error = %error,
                    "failed to report the crashed state"
                );
            }
            engine.log_finished();
            std::panic::resume_unwind(payload);
        }
        Ok(Err(error)) => {
            engine.log_finished();
            Err(error)
        }
        Ok(Ok(())) => {
            if engine.task_run.state.is_final() {
                engine.run_hooks().await;
            }
            engine.log_finished();
            match return_type {
                ReturnType::State => Ok(RunOutcome::State(engine.task_run.state.clone())),
                ReturnType::Result => engine.result(true).map(RunOutcome::Value),
            }
        }
    }
}
