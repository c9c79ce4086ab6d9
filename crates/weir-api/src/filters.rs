//! Query filters for flow-run reads.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{FlowRun, StateType};

/// Filter over flow runs for [`read_flow_runs`](crate::client::OrchestrationClient::read_flow_runs).
///
/// Every term is conjunctive. An any-of term that is present but empty
/// (`Some(vec![])`) matches nothing; an absent term (`None`) matches
/// everything.
#[derive(Debug, Clone, Default)]
pub struct FlowRunFilter {
    pub deployment_id_any: Option<Vec<Uuid>>,
    pub state_type_any: Option<Vec<StateType>>,
    pub state_name_any: Option<Vec<String>>,
    pub next_scheduled_before: Option<DateTime<Utc>>,
    pub id_any: Option<Vec<Uuid>>,
    pub id_not_any: Option<Vec<Uuid>>,
}

impl FlowRunFilter {
    pub fn deployment_id_any(mut self, ids: Vec<Uuid>) -> Self {
        self.deployment_id_any = Some(ids);
        self
    }

    pub fn state_type_any(mut self, types: Vec<StateType>) -> Self {
        self.state_type_any = Some(types);
        self
    }

    pub fn state_name_any(mut self, names: Vec<String>) -> Self {
        self.state_name_any = Some(names);
        self
    }

    pub fn next_scheduled_before(mut self, before: DateTime<Utc>) -> Self {
        self.next_scheduled_before = Some(before);
        self
    }

    pub fn id_any(mut self, ids: Vec<Uuid>) -> Self {
        self.id_any = Some(ids);
        self
    }

    pub fn id_not_any(mut self, ids: Vec<Uuid>) -> Self {
        self.id_not_any = Some(ids);
        self
    }

    /// Whether `flow_run` satisfies every present term.
    pub fn matches(&self, flow_run: &FlowRun) -> bool {
        if let Some(ids) = &self.deployment_id_any {
            match flow_run.deployment_id {
                Some(deployment_id) if ids.contains(&deployment_id) => {}
                _ => return false,
            }
        }
        if let Some(types) = &self.state_type_any {
            if !types.contains(&flow_run.state.state_type) {
                return false;
            }
        }
        if let Some(names) = &self.state_name_any {
            if !names.iter().any(|name| name == &flow_run.state.name) {
                return false;
            }
        }
        if let Some(before) = self.next_scheduled_before {
            match flow_run.next_scheduled_start_time {
                Some(at) if at <= before => {}
                _ => return false,
            }
        }
        if let Some(ids) = &self.id_any {
            if !ids.contains(&flow_run.id) {
                return false;
            }
        }
        if let Some(ids) = &self.id_not_any {
            if ids.contains(&flow_run.id) {
                return false;
            }
        }
        true
    }
}
