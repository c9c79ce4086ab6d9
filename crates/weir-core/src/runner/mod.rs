//! The runner: a long-lived agent for remotely initiated flow runs.
//!
//! A runner polls the orchestration backend for scheduled flow runs on its
//! deployments, launches each as a child process under a concurrency limit,
//! heartbeats, and watches for out-of-band cancellation. Three supervised
//! loops drive it: submit, heartbeat, and cancellation, each jittered so a
//! fleet of runners de-synchronizes against the backend.

pub mod process;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use weir_api::client::{OrchestrationClient, OrchestrationError};
use weir_api::filters::FlowRunFilter;
use weir_api::models::{Deployment, DeploymentCreate, FlowRun, State, StateType};

use crate::services::critical_service_loop;
use crate::settings::Settings;

use process::{
    ProcessError, ProcessRunnerResult, exit_code_help, exit_status_code, kill_process,
};

/// Environment variable carrying the flow-run id into child processes.
pub const ENV_FLOW_RUN_ID: &str = "WEIR__FLOW_RUN_ID";

/// Jitter factor applied to every supervised loop interval.
const LOOP_JITTER: f64 = 0.3;

/// Configuration for a [`Runner`].
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Runner name; random when omitted. Must not contain `/` or `%`.
    pub name: Option<String>,
    /// Deployments to poll for scheduled flow runs.
    pub deployment_ids: Vec<Uuid>,
    /// How far ahead of schedule to claim runs; defaults to the setting.
    pub prefetch_seconds: Option<f64>,
    /// Maximum concurrent flow runs; unlimited when `None`.
    pub limit: Option<usize>,
    /// Pause deployment schedules during teardown.
    pub pause_on_shutdown: bool,
    /// Command (argv) for flow-run child processes.
    pub entrypoint: Vec<String>,
    /// Grace period between SIGTERM and SIGKILL when cancelling.
    pub kill_grace_seconds: u64,
    /// How long a cancelled flow-run id keeps suppressing duplicate
    /// cancellation calls while the backend may serve stale state.
    pub cancelled_id_retention: Duration,
    pub settings: Settings,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: None,
            deployment_ids: Vec::new(),
            prefetch_seconds: None,
            limit: None,
            pause_on_shutdown: true,
            entrypoint: vec!["weir-engine".to_owned()],
            kill_grace_seconds: 30,
            cancelled_id_retention: Duration::from_secs(600),
            settings: Settings::default(),
        }
    }
}

/// Mutable bookkeeping shared across the runner's loops.
struct RunnerState {
    /// Flow runs whose submission is in flight.
    submitting: HashSet<Uuid>,
    /// Flow runs being (or recently) cancelled.
    cancelling: HashSet<Uuid>,
    /// Live child processes by flow-run id.
    process_map: HashMap<Uuid, u32>,
    last_polled: DateTime<Utc>,
}

/// Distinguishes a process that never started from one that failed while
/// being monitored: only the former crashes the flow run.
#[derive(Debug)]
enum FlowProcessError {
    Start(anyhow::Error),
    Monitor(anyhow::Error),
}

/// The long-lived execution agent.
pub struct Runner {
    name: String,
    pause_on_shutdown: bool,
    prefetch_seconds: f64,
    query_seconds: f64,
    heartbeat_seconds: f64,
    entrypoint: Vec<String>,
    kill_grace_seconds: u64,
    cancelled_id_retention: Duration,
    settings: Settings,
    client: Arc<dyn OrchestrationClient>,
    limit: Option<usize>,
    limiter: Option<Arc<Semaphore>>,
    deployment_ids: Mutex<Vec<Uuid>>,
    state: Mutex<RunnerState>,
    scheduled_task_scopes: Mutex<HashMap<Uuid, CancellationToken>>,
    tracker: TaskTracker,
    is_setup: AtomicBool,
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Runner {
    pub fn new(config: RunnerConfig, client: Arc<dyn OrchestrationClient>) -> Result<Self> {
        let name = match config.name {
            Some(name) => {
                if name.is_empty() {
                    bail!("runner name must not be empty");
                }
                if name.contains('/') || name.contains('%') {
                    bail!("runner name cannot contain '/' or '%'");
                }
                name
            }
            None => format!("runner-{}", Uuid::new_v4()),
        };

        let settings = config.settings;
        Ok(Self {
            name,
            pause_on_shutdown: config.pause_on_shutdown,
            prefetch_seconds: config
                .prefetch_seconds
                .unwrap_or(settings.worker_prefetch_seconds),
            query_seconds: settings.worker_query_seconds,
            heartbeat_seconds: settings.worker_heartbeat_seconds,
            entrypoint: config.entrypoint,
            kill_grace_seconds: config.kill_grace_seconds,
            cancelled_id_retention: config.cancelled_id_retention,
            settings,
            client,
            limit: config.limit,
            limiter: config.limit.map(|limit| Arc::new(Semaphore::new(limit))),
            deployment_ids: Mutex::new(config.deployment_ids),
            state: Mutex::new(RunnerState {
                submitting: HashSet::new(),
                cancelling: HashSet::new(),
                process_map: HashMap::new(),
                last_polled: Utc::now(),
            }),
            scheduled_task_scopes: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            is_setup: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Basic info about this runner.
    pub fn get_status(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "settings": {
                "prefetch_seconds": self.prefetch_seconds,
            },
        })
    }

    fn is_setup(&self) -> bool {
        self.is_setup.load(Ordering::SeqCst)
    }

    /// Flow runs with a live child process.
    pub async fn tracked_flow_runs(&self) -> Vec<Uuid> {
        let state = self.state.lock().await;
        state.process_map.keys().copied().collect()
    }

    /// Flow runs currently suppressed from duplicate cancellation calls.
    pub async fn cancelling_flow_run_ids(&self) -> Vec<Uuid> {
        let state = self.state.lock().await;
        state.cancelling.iter().copied().collect()
    }

    /// Prepare the runner to run.
    pub async fn setup(&self) {
        tracing::debug!(runner = %self.name, "setting up runner");
        self.is_setup.store(true, Ordering::SeqCst);
    }

    /// Clean up after the runner stops: pause schedules when configured,
    /// cancel scheduled-task scopes, and drain the task group.
    pub async fn teardown(&self) -> Result<()> {
        tracing::debug!(runner = %self.name, "tearing down runner");
        if self.pause_on_shutdown {
            if let Err(error) = self.pause_schedules().await {
                tracing::warn!(
                    runner = %self.name,
                    error = %error,
                    "failed to pause deployment schedules during teardown"
                );
            }
        }
        self.is_setup.store(false, Ordering::SeqCst);

        let scopes: Vec<CancellationToken> = {
            let mut scopes = self.scheduled_task_scopes.lock().await;
            scopes.drain().map(|(_, token)| token).collect()
        };
        for token in scopes {
            token.cancel();
        }

        self.tracker.close();
        self.tracker.wait().await;
        Ok(())
    }

    /// Pause the schedule of every managed deployment.
    pub async fn pause_schedules(&self) -> Result<()> {
        let deployment_ids = self.deployment_ids.lock().await.clone();
        for deployment_id in deployment_ids {
            self.client
                .update_schedule(deployment_id, false)
                .await
                .with_context(|| {
                    format!("failed to pause schedule for deployment {deployment_id}")
                })?;
        }
        Ok(())
    }

    /// Register a deployment and start polling it for scheduled work.
    ///
    /// Warns when a schedule is requested but no API URL is configured:
    /// the ephemeral backend has no scheduler.
    pub async fn create_deployment(
        &self,
        flow_name: &str,
        name: Option<&str>,
        schedule: Option<String>,
    ) -> Result<Deployment> {
        if schedule.is_some() && self.settings.api_url.is_none() {
            tracing::warn!(
                "cannot schedule flows without an orchestration API; set WEIR_API_URL to enable scheduling"
            );
        }
        let deployment = self
            .client
            .create_deployment(DeploymentCreate {
                name: name.unwrap_or(&self.name).to_owned(),
                flow_name: flow_name.to_owned(),
                storage_block_id: None,
                schedule,
            })
            .await?;
        self.deployment_ids.lock().await.push(deployment.id);
        Ok(deployment)
    }

    /// Heartbeat against the backend.
    pub async fn sync_with_backend(&self) -> Result<()> {
        // Liveness only; there is no further state to reconcile yet.
        tracing::debug!(runner = %self.name, "runner synchronized with the orchestration backend");
        Ok(())
    }

    /// Whether a scheduled-run poll landed within `30 * query_interval`.
    /// Health endpoints call this to decide if the runner needs a restart.
    pub async fn is_runner_still_polling(&self, query_interval_seconds: f64) -> bool {
        let last_polled = self.state.lock().await.last_polled;
        let threshold_seconds = query_interval_seconds * 30.0;
        let seconds_since_last_poll =
            (Utc::now() - last_polled).num_milliseconds() as f64 / 1000.0;

        let is_still_polling = seconds_since_last_poll <= threshold_seconds;
        if !is_still_polling {
            tracing::error!(
                runner = %self.name,
                seconds_since_last_poll,
                "runner has not polled recently and should be restarted"
            );
        }
        is_still_polling
    }

    /// Main entrypoint: run the submit, heartbeat, and cancellation loops
    /// until `cancel` fires, then tear down.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        self.setup().await;
        self.sync_with_backend().await?;

        let submit_runner = Arc::clone(&self);
        let submit_loop = tokio::spawn(critical_service_loop(
            move || {
                let runner = Arc::clone(&submit_runner);
                async move { runner.get_and_submit_flow_runs().await.map(|_| ()) }
            },
            Duration::from_secs_f64(self.query_seconds),
            Some(LOOP_JITTER),
            cancel.child_token(),
        ));

        let heartbeat_runner = Arc::clone(&self);
        let heartbeat_loop = tokio::spawn(critical_service_loop(
            move || {
                let runner = Arc::clone(&heartbeat_runner);
                async move { runner.sync_with_backend().await }
            },
            Duration::from_secs_f64(self.heartbeat_seconds),
            Some(LOOP_JITTER),
            cancel.child_token(),
        ));

        let cancel_runner = Arc::clone(&self);
        let cancellation_loop = tokio::spawn(critical_service_loop(
            move || {
                let runner = Arc::clone(&cancel_runner);
                async move { runner.check_for_cancelled_flow_runs().await.map(|_| ()) }
            },
            Duration::from_secs_f64(self.query_seconds * 2.0),
            Some(LOOP_JITTER),
            cancel.child_token(),
        ));

        cancel.cancelled().await;
        for handle in [submit_loop, heartbeat_loop, cancellation_loop] {
            let _ = handle.await;
        }
        self.teardown().await
    }

    /// One-shot execution of a single flow run, with cancellation watched
    /// for the duration of the child process.
    pub async fn execute_flow_run(self: Arc<Self>, flow_run_id: Uuid) -> Result<()> {
        self.setup().await;
        self.state.lock().await.submitting.insert(flow_run_id);

        let flow_run = self.client.read_flow_run(flow_run_id).await?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let submit_runner = Arc::clone(&self);
        let submitted = {
            let flow_run = flow_run.clone();
            self.tracker.spawn(async move {
                submit_runner
                    .submit_run_and_capture_errors(flow_run, ready_tx, None)
                    .await;
            })
        };
        let _ = ready_rx.await;

        let watch_cancel = CancellationToken::new();
        let watch_runner = Arc::clone(&self);
        let watcher = tokio::spawn(critical_service_loop(
            move || {
                let runner = Arc::clone(&watch_runner);
                async move { runner.check_for_cancelled_flow_runs().await.map(|_| ()) }
            },
            Duration::from_secs_f64(self.query_seconds * 2.0),
            Some(LOOP_JITTER),
            watch_cancel.clone(),
        ));

        let _ = submitted.await;
        watch_cancel.cancel();
        let _ = watcher.await;

        self.state.lock().await.submitting.remove(&flow_run_id);
        self.teardown().await
    }

    /// Poll for scheduled flow runs and submit them in schedule order.
    pub async fn get_and_submit_flow_runs(self: Arc<Self>) -> Result<Vec<FlowRun>> {
        let runs = self.get_scheduled_flow_runs().await?;
        self.state.lock().await.last_polled = Utc::now();
        self.submit_scheduled_flow_runs(runs).await
    }

    async fn get_scheduled_flow_runs(&self) -> Result<Vec<FlowRun>> {
        let scheduled_before =
            Utc::now() + chrono::Duration::milliseconds((self.prefetch_seconds * 1000.0) as i64);
        tracing::debug!(
            runner = %self.name,
            scheduled_before = %scheduled_before,
            "querying for scheduled flow runs"
        );

        let deployment_ids = self.deployment_ids.lock().await.clone();
        let submitting: Vec<Uuid> = {
            let state = self.state.lock().await;
            state.submitting.iter().copied().collect()
        };

        let filter = FlowRunFilter::default()
            .deployment_id_any(deployment_ids)
            .state_type_any(vec![StateType::Scheduled])
            .next_scheduled_before(scheduled_before)
            .id_not_any(submitting);
        let runs = self.client.read_flow_runs(&filter).await?;
        tracing::debug!(runner = %self.name, count = runs.len(), "discovered scheduled flow runs");
        Ok(runs)
    }

    /// Submit candidates in ascending schedule order, stopping at the
    /// capacity limit. Returns the runs that entered submission.
    async fn submit_scheduled_flow_runs(
        self: Arc<Self>,
        mut runs: Vec<FlowRun>,
    ) -> Result<Vec<FlowRun>> {
        runs.sort_by_key(|run| run.next_scheduled_start_time);

        for flow_run in &runs {
            let already_submitting = {
                let state = self.state.lock().await;
                state.submitting.contains(&flow_run.id)
            };
            if already_submitting {
                continue;
            }

            // Admission control: never block the submit loop on capacity.
            let permit = match &self.limiter {
                Some(limiter) => match Arc::clone(limiter).try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        let in_flight = self
                            .limit
                            .unwrap_or_default()
                            .saturating_sub(limiter.available_permits());
                        tracing::info!(
                            runner = %self.name,
                            in_flight,
                            "flow run limit reached; deferring the remaining candidates"
                        );
                        break;
                    }
                },
                None => None,
            };

            tracing::info!(
                runner = %self.name,
                flow_run_id = %flow_run.id,
                "submitting flow run"
            );
            self.state.lock().await.submitting.insert(flow_run.id);

            let submit_runner = Arc::clone(&self);
            let flow_run = flow_run.clone();
            self.tracker
                .spawn(async move { submit_runner.submit_run(flow_run, permit).await });
        }

        let state = self.state.lock().await;
        Ok(runs
            .into_iter()
            .filter(|run| state.submitting.contains(&run.id))
            .collect())
    }

    /// Reject flow runs from deployments that use remote storage; this
    /// runner only executes locally stored flows.
    async fn check_flow_run(&self, flow_run: &FlowRun) -> Result<()> {
        if let Some(deployment_id) = flow_run.deployment_id {
            let deployment = self.client.read_deployment(deployment_id).await?;
            if deployment.storage_block_id.is_some() {
                bail!(
                    "flow run {} was created from deployment {:?} which is configured with a \
                     storage block; runners only support local storage",
                    flow_run.id,
                    deployment.name
                );
            }
        }
        Ok(())
    }

    async fn submit_run(
        self: Arc<Self>,
        flow_run: FlowRun,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        if let Err(error) = self.check_flow_run(&flow_run).await {
            tracing::error!(
                flow_run_id = %flow_run.id,
                error = %error,
                "flow run did not pass checks and will not be submitted for execution"
            );
            self.state.lock().await.submitting.remove(&flow_run.id);
            return;
        }

        if self.propose_pending_state(&flow_run).await {
            let (ready_tx, ready_rx) = oneshot::channel();
            let capture_runner = Arc::clone(&self);
            {
                let flow_run = flow_run.clone();
                self.tracker.spawn(async move {
                    capture_runner
                        .submit_run_and_capture_errors(flow_run, ready_tx, permit)
                        .await;
                });
            }

            match ready_rx.await {
                Ok(pid) => {
                    tracing::info!(
                        flow_run_id = %flow_run.id,
                        pid,
                        "completed submission of flow run"
                    );
                }
                Err(_) => {
                    // The process never started; the capture task reported it.
                }
            }
        } else {
            // Not ready to submit: give the capacity slot back.
            drop(permit);
        }

        self.state.lock().await.submitting.remove(&flow_run.id);
    }

    async fn submit_run_and_capture_errors(
        self: Arc<Self>,
        flow_run: FlowRun,
        ready_tx: oneshot::Sender<u32>,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let result = self.run(&flow_run, ready_tx).await;

        // Release the capacity slot and drop the pid mapping on every path.
        drop(permit);
        self.state.lock().await.process_map.remove(&flow_run.id);

        match result {
            Ok(result) => {
                if !result.succeeded() {
                    self.propose_crashed_state(
                        &flow_run,
                        &format!(
                            "Flow run process exited with non-zero status code {}.",
                            result.status_code
                        ),
                    )
                    .await;
                }
            }
            Err(FlowProcessError::Start(error)) => {
                tracing::error!(
                    flow_run_id = %flow_run.id,
                    error = %error,
                    "failed to start process for flow run"
                );
                self.propose_crashed_state(&flow_run, "Flow run process could not be started")
                    .await;
            }
            Err(FlowProcessError::Monitor(error)) => {
                tracing::error!(
                    flow_run_id = %flow_run.id,
                    error = %error,
                    "an error occurred while monitoring flow run; the flow run will not be \
                     marked as failed, but an issue may have occurred"
                );
            }
        }
    }

    /// Spawn the flow-run child process, publish its pid, stream its output
    /// to the run log, and wait for it to exit.
    async fn run(
        &self,
        flow_run: &FlowRun,
        ready_tx: oneshot::Sender<u32>,
    ) -> Result<ProcessRunnerResult, FlowProcessError> {
        let Some((program, args)) = self.entrypoint.split_first() else {
            return Err(FlowProcessError::Start(anyhow!(
                "flow run entrypoint command is empty"
            )));
        };

        tracing::info!(flow_run_id = %flow_run.id, "opening process");

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(self.settings.to_environment_variables())
            .env(ENV_FLOW_RUN_ID, flow_run.id.simple().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = command.spawn().map_err(|error| {
            FlowProcessError::Start(
                anyhow::Error::new(error)
                    .context(format!("failed to spawn flow run entrypoint {program:?}")),
            )
        })?;
        let Some(pid) = child.id() else {
            return Err(FlowProcessError::Start(anyhow!("child process has no pid")));
        };
        // Track the pid before anyone can observe the process as started,
        // so the cancellation loop can always find it.
        self.state.lock().await.process_map.insert(flow_run.id, pid);
        let _ = ready_tx.send(pid);

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(flow_run_id = %flow_run.id, pid, "{line}");
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|error| FlowProcessError::Monitor(error.into()))?;
        let status_code = exit_status_code(&status);

        if status_code == 0 {
            tracing::info!(flow_run_id = %flow_run.id, pid, "process exited cleanly");
        } else {
            match exit_code_help(status_code) {
                Some(help) => tracing::error!(
                    flow_run_id = %flow_run.id,
                    pid,
                    "process exited with status code: {status_code}; {help}"
                ),
                None => tracing::error!(
                    flow_run_id = %flow_run.id,
                    pid,
                    "process exited with status code: {status_code}"
                ),
            }
        }

        Ok(ProcessRunnerResult {
            identifier: pid.to_string(),
            status_code,
        })
    }

    /// Query for flow runs awaiting cancellation and spawn a cancellation
    /// task for each.
    ///
    /// Two queries are issued and concatenated: state type CANCELLED with
    /// state name "Cancelling", and state type CANCELLING. Both shapes are
    /// observed from the backend; keep both until it guarantees a single
    /// canonical representation.
    pub async fn check_for_cancelled_flow_runs(self: Arc<Self>) -> Result<Vec<FlowRun>> {
        if !self.is_setup() {
            bail!("runner is not set up; run it inside its lifecycle");
        }

        let watchable: Vec<Uuid> = {
            let state = self.state.lock().await;
            let deployment_ids = self.deployment_ids.lock().await;
            if state.process_map.is_empty() && deployment_ids.is_empty() {
                bail!("no flow runs or deployments to watch for cancellation");
            }
            state
                .process_map
                .keys()
                .filter(|id| !state.cancelling.contains(id))
                .copied()
                .collect()
        };

        tracing::debug!(runner = %self.name, "checking for cancelled flow runs");

        let named_cancelling = self
            .client
            .read_flow_runs(
                &FlowRunFilter::default()
                    .state_type_any(vec![StateType::Cancelled])
                    .state_name_any(vec!["Cancelling".to_owned()])
                    .id_any(watchable.clone()),
            )
            .await?;
        let typed_cancelling = self
            .client
            .read_flow_runs(
                &FlowRunFilter::default()
                    .state_type_any(vec![StateType::Cancelling])
                    .id_any(watchable),
            )
            .await?;

        let mut cancelling_flow_runs = named_cancelling;
        cancelling_flow_runs.extend(typed_cancelling);

        if !cancelling_flow_runs.is_empty() {
            tracing::info!(
                runner = %self.name,
                count = cancelling_flow_runs.len(),
                "found flow runs awaiting cancellation"
            );
        }

        for flow_run in &cancelling_flow_runs {
            self.state.lock().await.cancelling.insert(flow_run.id);
            let cancel_runner = Arc::clone(&self);
            let flow_run = flow_run.clone();
            self.tracker
                .spawn(async move { cancel_runner.cancel_run(flow_run).await });
        }

        Ok(cancelling_flow_runs)
    }

    /// Kill the process hosting a flow run and mark the run cancelled.
    ///
    /// A missing pid mapping means cancellation is best-effort: the run is
    /// marked cancelled with a note. Unexpected kill failures leave the id
    /// out of the cancelling set so the next tick retries.
    pub async fn cancel_run(self: Arc<Self>, flow_run: FlowRun) {
        let pid = {
            let state = self.state.lock().await;
            state.process_map.get(&flow_run.id).copied()
        };

        let Some(pid) = pid else {
            Arc::clone(&self)
                .mark_flow_run_as_cancelled(
                    &flow_run,
                    Some(
                        "Could not find process ID for flow run and cancellation cannot be \
                         guaranteed.",
                    ),
                )
                .await;
            return;
        };

        match kill_process(pid, self.kill_grace_seconds).await {
            Ok(()) => {
                Arc::clone(&self)
                    .mark_flow_run_as_cancelled(&flow_run, None)
                    .await;
                tracing::info!(flow_run_id = %flow_run.id, "cancelled flow run");
            }
            Err(error @ ProcessError::NotFound { .. }) => {
                tracing::warn!(
                    flow_run_id = %flow_run.id,
                    "{error} Marking flow run as cancelled."
                );
                Arc::clone(&self)
                    .mark_flow_run_as_cancelled(&flow_run, None)
                    .await;
            }
            Err(error) => {
                tracing::error!(
                    flow_run_id = %flow_run.id,
                    error = %error,
                    "encountered exception while killing process for flow run; flow run may \
                     not be cancelled"
                );
                // Retry on the next cancellation tick.
                self.state.lock().await.cancelling.remove(&flow_run.id);
            }
        }
    }

    /// Force the flow run into Cancelled, then schedule removal of its id
    /// from the cancelling set. The id is kept for a retention window
    /// because the backend caches read responses and a prompt removal
    /// would duplicate cancellation calls.
    async fn mark_flow_run_as_cancelled(
        self: Arc<Self>,
        flow_run: &FlowRun,
        message: Option<&str>,
    ) {
        let mut state = State::cancelled();
        if let Some(message) = message {
            state = state.with_message(message);
        }

        if let Err(error) = self
            .client
            .set_flow_run_state(flow_run.id, state, true)
            .await
        {
            tracing::warn!(
                flow_run_id = %flow_run.id,
                error = %error,
                "failed to mark flow run as cancelled"
            );
        }

        let retention = self.cancelled_id_retention;
        let flow_run_id = flow_run.id;
        let state_runner = Arc::clone(&self);
        self.schedule_task(retention, move || async move {
            state_runner
                .state
                .lock()
                .await
                .cancelling
                .remove(&flow_run_id);
        })
        .await;
    }

    /// Run `task_fn` after `delay`, or immediately when the runner is
    /// shutting down. The delay is cancellable through the scheduled-task
    /// scopes; cancellation still runs the function.
    async fn schedule_task<F, Fut>(self: Arc<Self>, delay: Duration, task_fn: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.is_setup() {
            task_fn().await;
            return;
        }

        let scope_id = Uuid::new_v4();
        let token = CancellationToken::new();
        self.scheduled_task_scopes
            .lock()
            .await
            .insert(scope_id, token.clone());

        let scope_runner = Arc::clone(&self);
        self.tracker.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => {}
            }
            scope_runner
                .scheduled_task_scopes
                .lock()
                .await
                .remove(&scope_id);
            task_fn().await;
        });
    }

    /// Propose Pending for a flow run about to be submitted. Returns true
    /// iff the server accepted; an abort signal or a non-pending answer
    /// declines submission without raising.
    async fn propose_pending_state(&self, flow_run: &FlowRun) -> bool {
        match self
            .client
            .set_flow_run_state(flow_run.id, State::pending(), false)
            .await
        {
            Ok(state) if state.is_pending() => true,
            Ok(state) => {
                tracing::info!(
                    flow_run_id = %flow_run.id,
                    "aborted submission of flow run: server returned a non-pending state {}",
                    state.state_type
                );
                false
            }
            Err(OrchestrationError::Abort { reason }) => {
                tracing::info!(
                    flow_run_id = %flow_run.id,
                    "aborted submission of flow run: server sent an abort signal: {reason}"
                );
                false
            }
            Err(error) => {
                tracing::error!(
                    flow_run_id = %flow_run.id,
                    error = %error,
                    "failed to update state of flow run"
                );
                false
            }
        }
    }

    /// Fire-and-forget Crashed proposal; an abort means the run already
    /// reached a final state and needs no report.
    async fn propose_crashed_state(&self, flow_run: &FlowRun, message: &str) {
        match self
            .client
            .set_flow_run_state(flow_run.id, State::crashed(message), false)
            .await
        {
            Ok(state) => {
                if state.is_crashed() {
                    tracing::info!(
                        flow_run_id = %flow_run.id,
                        "reported flow run as crashed: {message}"
                    );
                }
            }
            Err(OrchestrationError::Abort { .. }) => {}
            Err(error) => {
                tracing::error!(
                    flow_run_id = %flow_run.id,
                    error = %error,
                    "failed to update state of flow run"
                );
            }
        }
    }
}
