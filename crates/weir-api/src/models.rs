//! Core records exchanged with the orchestration backend.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{LocalResultStore, ResultError};

// ---------------------------------------------------------------------------
// State types
// ---------------------------------------------------------------------------

/// The canonical type of a [`State`].
///
/// `Retrying` is not a distinct type: the backend represents it as a
/// `Running` state named `"Retrying"`, which is what keeps a task engine's
/// attempt loop live across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    Scheduled,
    Pending,
    Running,
    Paused,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
    Crashed,
}

impl StateType {
    /// A state type is final when no further transitions are expected.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Crashed | Self::Cancelled
        )
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scheduled => "SCHEDULED",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Cancelling => "CANCELLING",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Crashed => "CRASHED",
        };
        f.write_str(s)
    }
}

impl FromStr for StateType {
    type Err = StateTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(Self::Scheduled),
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "CANCELLING" => Ok(Self::Cancelling),
            "CANCELLED" => Ok(Self::Cancelled),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CRASHED" => Ok(Self::Crashed),
            other => Err(StateTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`StateType`] string.
#[derive(Debug, Clone)]
pub struct StateTypeParseError(pub String);

impl fmt::Display for StateTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid state type: {:?}", self.0)
    }
}

impl std::error::Error for StateTypeParseError {}

// ---------------------------------------------------------------------------
// State details and result payloads
// ---------------------------------------------------------------------------

/// Orchestration metadata attached to every state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDetails {
    /// User-computed cache key; lets the backend substitute a prior
    /// Completed result for a new invocation.
    pub cache_key: Option<String>,
    /// When true, a cached result for `cache_key` is ignored.
    pub refresh_cache: bool,
    /// Set only on the terminal Completed state, never on an interim one.
    pub cache_expiration: Option<DateTime<Utc>>,
    /// On a Paused state: whether the run should exit and be resumed by
    /// external action instead of polling in-process.
    pub pause_reschedule: bool,
}

/// The result carried by a state.
///
/// `Literal` payloads live only in the proposing process; the backend strips
/// them when recording a state (results do not cross the wire). `Persisted`
/// references point into a [`LocalResultStore`] and survive a round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultPayload {
    Literal(serde_json::Value),
    Persisted { storage_key: String },
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// One point in a run's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub id: Uuid,
    pub state_type: StateType,
    /// Display name; usually the capitalized type ("Running") but carries
    /// orchestration meaning in places: "Retrying", "Cached", "TimedOut",
    /// "NotReady", "Cancelling".
    pub name: String,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub data: Option<ResultPayload>,
    pub details: StateDetails,
}

impl State {
    fn new(state_type: StateType, name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            state_type,
            name: name.to_owned(),
            message: None,
            timestamp: Utc::now(),
            data: None,
            details: StateDetails::default(),
        }
    }

    pub fn scheduled() -> Self {
        Self::new(StateType::Scheduled, "Scheduled")
    }

    pub fn pending() -> Self {
        Self::new(StateType::Pending, "Pending")
    }

    pub fn running() -> Self {
        Self::new(StateType::Running, "Running")
    }

    /// A retry is a Running state named "Retrying".
    pub fn retrying() -> Self {
        Self::new(StateType::Running, "Retrying")
    }

    pub fn paused(reschedule: bool) -> Self {
        let mut state = Self::new(StateType::Paused, "Paused");
        state.details.pause_reschedule = reschedule;
        state
    }

    pub fn cancelling() -> Self {
        Self::new(StateType::Cancelling, "Cancelling")
    }

    pub fn cancelled() -> Self {
        Self::new(StateType::Cancelled, "Cancelled")
    }

    pub fn completed() -> Self {
        Self::new(StateType::Completed, "Completed")
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let mut state = Self::new(StateType::Failed, "Failed");
        state.message = Some(message.into());
        state
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        let mut state = Self::new(StateType::Crashed, "Crashed");
        state.message = Some(message.into());
        state
    }

    /// Override the display name, keeping the type.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: ResultPayload) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_details(mut self, details: StateDetails) -> Self {
        self.details = details;
        self
    }

    pub fn is_scheduled(&self) -> bool {
        self.state_type == StateType::Scheduled
    }

    pub fn is_pending(&self) -> bool {
        self.state_type == StateType::Pending
    }

    pub fn is_running(&self) -> bool {
        self.state_type == StateType::Running
    }

    pub fn is_paused(&self) -> bool {
        self.state_type == StateType::Paused
    }

    pub fn is_cancelled(&self) -> bool {
        self.state_type == StateType::Cancelled
    }

    pub fn is_completed(&self) -> bool {
        self.state_type == StateType::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.state_type == StateType::Failed
    }

    pub fn is_crashed(&self) -> bool {
        self.state_type == StateType::Crashed
    }

    pub fn is_final(&self) -> bool {
        self.state_type.is_final()
    }

    /// Extract the result value carried by this state.
    ///
    /// Literal payloads are returned directly; persisted payloads are read
    /// from `store`. A state without a surviving payload (e.g. read back
    /// from the backend with result persistence disabled) yields
    /// [`ResultError::Missing`].
    pub fn result(
        &self,
        store: Option<&LocalResultStore>,
    ) -> Result<serde_json::Value, ResultError> {
        match &self.data {
            Some(ResultPayload::Literal(value)) => Ok(value.clone()),
            Some(ResultPayload::Persisted { storage_key }) => match store {
                Some(store) => store.read(storage_key),
                None => Err(ResultError::Missing),
            },
            None => Err(ResultError::Missing),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}({})", self.name, message),
            None => f.write_str(&self.name),
        }
    }
}

// ---------------------------------------------------------------------------
// Task runs
// ---------------------------------------------------------------------------

/// A reference to an upstream task run recorded as a task input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRunInput {
    pub id: Uuid,
}

/// Mutable record of one execution attempt of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub name: String,
    /// Stable key of the task definition this run executes.
    pub task_key: String,
    pub flow_run_id: Option<Uuid>,
    pub state: State,
    /// Upstream dependencies, keyed by parameter name (or "wait_for" for
    /// pure synchronization barriers).
    pub task_inputs: HashMap<String, Vec<TaskRunInput>>,
    pub created: DateTime<Utc>,
}

/// Fields needed to create a [`TaskRun`].
#[derive(Debug, Clone, Default)]
pub struct TaskRunCreate {
    pub id: Option<Uuid>,
    pub name: String,
    pub task_key: String,
    pub flow_run_id: Option<Uuid>,
    pub task_inputs: HashMap<String, Vec<TaskRunInput>>,
}

// ---------------------------------------------------------------------------
// Flow runs
// ---------------------------------------------------------------------------

/// One invocation of a workflow, tracked end-to-end by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRun {
    pub id: Uuid,
    pub name: String,
    pub deployment_id: Option<Uuid>,
    pub state: State,
    pub next_scheduled_start_time: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
}

/// Fields needed to create a [`FlowRun`].
#[derive(Debug, Clone, Default)]
pub struct FlowRunCreate {
    pub name: String,
    pub deployment_id: Option<Uuid>,
    pub next_scheduled_start_time: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Deployments
// ---------------------------------------------------------------------------

/// Server-side binding of a workflow to a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub name: String,
    pub flow_name: String,
    /// Set when the deployment's code lives in remote storage. Runners only
    /// support local storage and refuse to submit such flow runs.
    pub storage_block_id: Option<Uuid>,
    /// Opaque schedule expression, interpreted by the backend's scheduler.
    pub schedule: Option<String>,
    pub schedule_active: bool,
}

/// Fields needed to create a [`Deployment`].
#[derive(Debug, Clone, Default)]
pub struct DeploymentCreate {
    pub name: String,
    pub flow_name: String,
    pub storage_block_id: Option<Uuid>,
    pub schedule: Option<String>,
}
