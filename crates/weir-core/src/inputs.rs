//! Task inputs: the parameter value tree and upstream-result resolution.
//!
//! Parameters handed to a task are a tagged value tree: plain JSON values,
//! lists, maps, and futures referencing upstream task runs. Before a task
//! function is invoked, the tree is walked and every future is replaced by
//! the final result of the run it references. `wait_for` futures are walked
//! the same way but act purely as synchronization barriers: their values are
//! discarded.

use std::collections::{BTreeMap, HashMap};

use futures::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use weir_api::client::{OrchestrationClient, OrchestrationError};
use weir_api::storage::{LocalResultStore, ResultError};

use crate::error::UpstreamTaskError;

/// Resolution never recurses deeper than this. Owned trees cannot cycle,
/// but adversarially nested inputs are cut off instead of blowing the stack.
pub const MAX_RESOLUTION_DEPTH: usize = 64;

/// A handle on the eventual result of an upstream task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskFuture {
    pub task_run_id: Uuid,
}

impl TaskFuture {
    pub fn new(task_run_id: Uuid) -> Self {
        Self { task_run_id }
    }
}

/// One node of the parameter value tree.
#[derive(Debug, Clone)]
pub enum Parameter {
    Value(Value),
    Future(TaskFuture),
    List(Vec<Parameter>),
    Map(BTreeMap<String, Parameter>),
}

impl From<Value> for Parameter {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<TaskFuture> for Parameter {
    fn from(future: TaskFuture) -> Self {
        Self::Future(future)
    }
}

/// Unresolved parameters, keyed by parameter name.
pub type Parameters = HashMap<String, Parameter>;

/// Parameters after every future has been replaced by its result.
pub type ResolvedParameters = HashMap<String, Value>;

/// Errors raised while resolving parameter trees.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Upstream(#[from] UpstreamTaskError),

    #[error("parameter nesting exceeds {MAX_RESOLUTION_DEPTH} levels")]
    TooDeep,

    #[error(transparent)]
    Client(#[from] OrchestrationError),

    #[error(transparent)]
    Result(#[from] ResultError),
}

/// Collect the upstream task-run ids referenced anywhere in a parameter.
pub fn collect_futures(parameter: &Parameter, out: &mut Vec<Uuid>) {
    match parameter {
        Parameter::Value(_) => {}
        Parameter::Future(future) => out.push(future.task_run_id),
        Parameter::List(items) => {
            for item in items {
                collect_futures(item, out);
            }
        }
        Parameter::Map(entries) => {
            for item in entries.values() {
                collect_futures(item, out);
            }
        }
    }
}

/// Fetch the final result of the task run a future references.
///
/// The run must be in a Completed state; anything else raises
/// [`UpstreamTaskError`]. Persisted payloads are read through `store`.
pub async fn resolve_to_final_result(
    client: &dyn OrchestrationClient,
    store: Option<&LocalResultStore>,
    future: &TaskFuture,
) -> Result<Value, ResolveError> {
    let task_run = client.read_task_run(future.task_run_id).await?;
    if !task_run.state.is_completed() {
        return Err(UpstreamTaskError {
            task_run_id: future.task_run_id,
            reason: format!("state is {}", task_run.state),
        }
        .into());
    }
    Ok(task_run.state.result(store)?)
}

fn resolve_node<'a>(
    client: &'a dyn OrchestrationClient,
    store: Option<&'a LocalResultStore>,
    parameter: &'a Parameter,
    depth: usize,
) -> BoxFuture<'a, Result<Value, ResolveError>> {
    Box::pin(async move {
        if depth > MAX_RESOLUTION_DEPTH {
            return Err(ResolveError::TooDeep);
        }
        match parameter {
            Parameter::Value(value) => Ok(value.clone()),
            Parameter::Future(future) => resolve_to_final_result(client, store, future).await,
            Parameter::List(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(resolve_node(client, store, item, depth + 1).await?);
                }
                Ok(Value::Array(resolved))
            }
            Parameter::Map(entries) => {
                let mut resolved = serde_json::Map::with_capacity(entries.len());
                for (key, item) in entries {
                    resolved.insert(key.clone(), resolve_node(client, store, item, depth + 1).await?);
                }
                Ok(Value::Object(resolved))
            }
        }
    })
}

/// Resolve a full parameter map, replacing every future with its result.
pub async fn resolve_parameters(
    client: &dyn OrchestrationClient,
    store: Option<&LocalResultStore>,
    parameters: &Parameters,
) -> Result<ResolvedParameters, ResolveError> {
    let mut resolved = HashMap::with_capacity(parameters.len());
    for (name, parameter) in parameters {
        resolved.insert(name.clone(), resolve_node(client, store, parameter, 0).await?);
    }
    Ok(resolved)
}

/// Block on `wait_for` dependencies, discarding their values.
pub async fn wait_for_dependencies(
    client: &dyn OrchestrationClient,
    wait_for: &[TaskFuture],
) -> Result<(), ResolveError> {
    for future in wait_for {
        resolve_to_final_result(client, None, future).await?;
    }
    Ok(())
}
