//! In-memory orchestration backend.
//!
//! Implements [`OrchestrationClient`] without a server: state lives in the
//! process. This is the backend used when no API URL is configured, and the
//! backend every integration test runs against. It applies the same
//! orchestration rules a server would: final states are terminal unless
//! forced, literal result payloads never survive a round trip, and Running
//! proposals are answered from the result cache when a live entry matches.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::client::{OrchestrationClient, OrchestrationError};
use crate::filters::FlowRunFilter;
use crate::models::{
    Deployment, DeploymentCreate, FlowRun, FlowRunCreate, ResultPayload, State, StateType, TaskRun,
    TaskRunCreate,
};

#[derive(Debug, Clone)]
struct CacheEntry {
    state: State,
    expires: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    task_runs: HashMap<Uuid, TaskRun>,
    flow_runs: HashMap<Uuid, FlowRun>,
    deployments: HashMap<Uuid, Deployment>,
    cache: HashMap<String, CacheEntry>,
    /// Per task run: how many further Running proposals to answer with
    /// Pending before letting the run proceed.
    reject_running: HashMap<Uuid, u32>,
    /// Per task run: answer the next proposal with a pause signal carrying
    /// this reschedule flag.
    pause_next: HashMap<Uuid, bool>,
}

/// The in-memory orchestration backend.
#[derive(Default)]
pub struct EphemeralOrchestrator {
    inner: Mutex<Inner>,
}

impl EphemeralOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next `count` Running proposals for `task_run_id` with
    /// Pending, as a server applying admission control would.
    pub async fn reject_running(&self, task_run_id: Uuid, count: u32) {
        self.inner
            .lock()
            .await
            .reject_running
            .insert(task_run_id, count);
    }

    /// Answer the next state proposal for `task_run_id` with a pause signal.
    pub async fn pause_next_proposal(&self, task_run_id: Uuid, reschedule: bool) {
        self.inner
            .lock()
            .await
            .pause_next
            .insert(task_run_id, reschedule);
    }
}

/// The recorded copy of a state: literal result payloads do not cross the
/// wire, persisted references do.
fn recorded_copy(state: &State) -> State {
    let mut recorded = state.clone();
    if matches!(recorded.data, Some(ResultPayload::Literal(_))) {
        recorded.data = None;
    }
    recorded
}

#[async_trait]
impl OrchestrationClient for EphemeralOrchestrator {
    async fn create_task_run(&self, create: TaskRunCreate) -> Result<TaskRun, OrchestrationError> {
        let mut inner = self.inner.lock().await;
        let id = create.id.unwrap_or_else(Uuid::new_v4);
        let task_run = TaskRun {
            id,
            name: create.name,
            task_key: create.task_key,
            flow_run_id: create.flow_run_id,
            state: State::pending(),
            task_inputs: create.task_inputs,
            created: Utc::now(),
        };
        inner.task_runs.insert(id, task_run.clone());
        Ok(task_run)
    }

    async fn read_task_run(&self, id: Uuid) -> Result<TaskRun, OrchestrationError> {
        let inner = self.inner.lock().await;
        inner
            .task_runs
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestrationError::NotFound(format!("task run {id}")))
    }

    async fn set_task_run_name(&self, id: Uuid, name: &str) -> Result<(), OrchestrationError> {
        let mut inner = self.inner.lock().await;
        let task_run = inner
            .task_runs
            .get_mut(&id)
            .ok_or_else(|| OrchestrationError::NotFound(format!("task run {id}")))?;
        task_run.name = name.to_owned();
        Ok(())
    }

    async fn set_task_run_state(
        &self,
        id: Uuid,
        state: State,
        force: bool,
    ) -> Result<State, OrchestrationError> {
        let mut inner = self.inner.lock().await;

        if let Some(reschedule) = inner.pause_next.remove(&id) {
            return Err(OrchestrationError::Pause {
                state: Some(State::paused(reschedule)),
            });
        }

        let current = inner
            .task_runs
            .get(&id)
            .map(|run| run.state.clone())
            .ok_or_else(|| OrchestrationError::NotFound(format!("task run {id}")))?;

        if !force && current.is_final() {
            return Err(OrchestrationError::Abort {
                reason: format!("run is already in a final state: {current}"),
            });
        }

        if !force && state.is_running() {
            // Admission control injected by tests.
            if let Some(remaining) = inner.reject_running.get_mut(&id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(State::pending());
                }
                inner.reject_running.remove(&id);
            }

            // Cache retrieval: substitute a live cached Completed state.
            if let Some(key) = state.details.cache_key.clone() {
                if !state.details.refresh_cache {
                    let live = match inner.cache.get(&key) {
                        Some(entry) => match entry.expires {
                            Some(expires) if expires <= Utc::now() => None,
                            _ => Some(entry.state.clone()),
                        },
                        None => None,
                    };
                    match live {
                        Some(cached) => {
                            let cached = cached.with_name("Cached");
                            if let Some(run) = inner.task_runs.get_mut(&id) {
                                run.state = cached.clone();
                            }
                            return Ok(cached);
                        }
                        None => {
                            inner.cache.remove(&key);
                        }
                    }
                }
            }
        }

        let recorded = recorded_copy(&state);

        if recorded.is_completed() {
            if let Some(key) = recorded.details.cache_key.clone() {
                inner.cache.insert(
                    key,
                    CacheEntry {
                        state: recorded.clone(),
                        expires: recorded.details.cache_expiration,
                    },
                );
            }
        }

        if let Some(run) = inner.task_runs.get_mut(&id) {
            run.state = recorded.clone();
        }
        Ok(recorded)
    }

    async fn create_flow_run(&self, create: FlowRunCreate) -> Result<FlowRun, OrchestrationError> {
        let mut inner = self.inner.lock().await;
        let id = Uuid::new_v4();
        let flow_run = FlowRun {
            id,
            name: create.name,
            deployment_id: create.deployment_id,
            state: State::scheduled(),
            next_scheduled_start_time: create.next_scheduled_start_time,
            created: Utc::now(),
        };
        inner.flow_runs.insert(id, flow_run.clone());
        Ok(flow_run)
    }

    async fn read_flow_run(&self, id: Uuid) -> Result<FlowRun, OrchestrationError> {
        let inner = self.inner.lock().await;
        inner
            .flow_runs
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestrationError::NotFound(format!("flow run {id}")))
    }

    async fn read_flow_runs(
        &self,
        filter: &FlowRunFilter,
    ) -> Result<Vec<FlowRun>, OrchestrationError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .flow_runs
            .values()
            .filter(|run| filter.matches(run))
            .cloned()
            .collect())
    }

    async fn set_flow_run_state(
        &self,
        id: Uuid,
        state: State,
        force: bool,
    ) -> Result<State, OrchestrationError> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .flow_runs
            .get(&id)
            .map(|run| run.state.clone())
            .ok_or_else(|| OrchestrationError::NotFound(format!("flow run {id}")))?;

        if !force && current.is_final() {
            return Err(OrchestrationError::Abort {
                reason: format!("run is already in a final state: {current}"),
            });
        }

        // A Pending proposal races other runners: only a Scheduled run may
        // move to Pending. Answer with the current state otherwise.
        if !force && state.is_pending() && current.state_type != StateType::Scheduled {
            return Ok(current);
        }

        let recorded = recorded_copy(&state);
        if let Some(run) = inner.flow_runs.get_mut(&id) {
            run.state = recorded.clone();
        }
        Ok(recorded)
    }

    async fn create_deployment(
        &self,
        create: DeploymentCreate,
    ) -> Result<Deployment, OrchestrationError> {
        let mut inner = self.inner.lock().await;
        let id = Uuid::new_v4();
        let deployment = Deployment {
            id,
            name: create.name,
            flow_name: create.flow_name,
            storage_block_id: create.storage_block_id,
            schedule: create.schedule,
            schedule_active: true,
        };
        inner.deployments.insert(id, deployment.clone());
        Ok(deployment)
    }

    async fn read_deployment(&self, id: Uuid) -> Result<Deployment, OrchestrationError> {
        let inner = self.inner.lock().await;
        inner
            .deployments
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestrationError::NotFound(format!("deployment {id}")))
    }

    async fn update_schedule(
        &self,
        deployment_id: Uuid,
        active: bool,
    ) -> Result<(), OrchestrationError> {
        let mut inner = self.inner.lock().await;
        let deployment = inner
            .deployments
            .get_mut(&deployment_id)
            .ok_or_else(|| OrchestrationError::NotFound(format!("deployment {deployment_id}")))?;
        deployment.schedule_active = active;
        Ok(())
    }
}
