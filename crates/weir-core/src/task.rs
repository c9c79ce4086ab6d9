//! The immutable task specification.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use weir_api::models::{State, TaskRun};
use weir_api::storage::LocalResultStore;

use crate::context::TaskRunContext;
use crate::inputs::ResolvedParameters;

/// The typed function handle a task executes. Resolved parameters arrive
/// through the context (`ctx.parameters`).
pub type TaskFn =
    Arc<dyn Fn(Arc<TaskRunContext>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// A completion or failure hook. Hooks are cooperative futures; errors are
/// logged by the engine and never affect the final state.
pub type HookFn = Arc<
    dyn Fn(Arc<Task>, TaskRun, State) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
>;

/// Decides whether a caught error should consume a retry. An error raised
/// by the predicate itself is logged and treated as "do not retry".
pub type RetryConditionFn =
    Arc<dyn Fn(&Task, &TaskRun, &State) -> anyhow::Result<bool> + Send + Sync>;

/// Computes the cache key for an invocation, or `None` to skip caching.
pub type CacheKeyFn =
    Arc<dyn Fn(&TaskRunContext, &ResolvedParameters) -> Option<String> + Send + Sync>;

/// Immutable specification of a unit of work.
#[derive(Clone)]
pub struct Task {
    pub name: String,
    run_fn: TaskFn,
    pub retries: u32,
    pub retry_condition: Option<RetryConditionFn>,
    pub cache_key_fn: Option<CacheKeyFn>,
    pub cache_expiration: Option<chrono::Duration>,
    /// Per-task override of the global refresh-cache setting.
    pub refresh_cache: Option<bool>,
    pub timeout: Option<Duration>,
    /// Template for the task-run name, e.g. `"load {table}"`. Placeholders
    /// are substituted from the resolved parameters, once per run.
    pub task_run_name: Option<String>,
    pub persist_result: bool,
    pub result_storage: Option<Arc<LocalResultStore>>,
    /// Route plain task output to the run log.
    pub log_prints: bool,
    pub on_completion: Vec<HookFn>,
    pub on_failure: Vec<HookFn>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("retries", &self.retries)
            .field("timeout", &self.timeout)
            .field("persist_result", &self.persist_result)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub fn new<F, Fut>(name: impl Into<String>, run_fn: F) -> Self
    where
        F: Fn(Arc<TaskRunContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run_fn: Arc::new(move |ctx| Box::pin(run_fn(ctx))),
            retries: 0,
            retry_condition: None,
            cache_key_fn: None,
            cache_expiration: None,
            refresh_cache: None,
            timeout: None,
            task_run_name: None,
            persist_result: false,
            result_storage: None,
            log_prints: false,
            on_completion: Vec::new(),
            on_failure: Vec::new(),
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Task, &TaskRun, &State) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.retry_condition = Some(Arc::new(condition));
        self
    }

    pub fn with_cache_key_fn<F>(mut self, cache_key_fn: F) -> Self
    where
        F: Fn(&TaskRunContext, &ResolvedParameters) -> Option<String> + Send + Sync + 'static,
    {
        self.cache_key_fn = Some(Arc::new(cache_key_fn));
        self
    }

    pub fn with_cache_expiration(mut self, expiration: chrono::Duration) -> Self {
        self.cache_expiration = Some(expiration);
        self
    }

    pub fn with_refresh_cache(mut self, refresh: bool) -> Self {
        self.refresh_cache = Some(refresh);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_run_name_template(mut self, template: impl Into<String>) -> Self {
        self.task_run_name = Some(template.into());
        self
    }

    pub fn with_persist_result(mut self, persist: bool) -> Self {
        self.persist_result = persist;
        self
    }

    pub fn with_result_storage(mut self, storage: Arc<LocalResultStore>) -> Self {
        self.result_storage = Some(storage);
        self
    }

    pub fn with_log_prints(mut self, log_prints: bool) -> Self {
        self.log_prints = log_prints;
        self
    }

    pub fn on_completion<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Task>, TaskRun, State) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_completion
            .push(Arc::new(move |task, run, state| Box::pin(hook(task, run, state))));
        self
    }

    pub fn on_failure<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Task>, TaskRun, State) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_failure
            .push(Arc::new(move |task, run, state| Box::pin(hook(task, run, state))));
        self
    }

    /// Invoke the task function.
    pub fn call(&self, ctx: Arc<TaskRunContext>) -> BoxFuture<'static, anyhow::Result<Value>> {
        (self.run_fn)(ctx)
    }
}

/// Substitute `{name}` placeholders in a run-name template from the
/// resolved parameters. String values are inserted unquoted; other values
/// use their JSON rendering. Unknown placeholders are left in place.
pub fn render_run_name(template: &str, parameters: &ResolvedParameters) -> String {
    let mut rendered = template.to_owned();
    for (name, value) in parameters {
        let placeholder = format!("{{{name}}}");
        if !rendered.contains(&placeholder) {
            continue;
        }
        let replacement = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&placeholder, &replacement);
    }
    rendered
}
