//! Process engine facade.
//!
//! The lifecycle adapter drives processes exclusively through [`ProcessEngine`].
//! Lookups that may legitimately find nothing return `Option`; errors are kept
//! for real engine failures.

pub mod delegates;
pub mod memory;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::ProcessModel;
use crate::types::{SortDirection, WorkflowFormProperty};
use crate::vars::Variables;

pub use delegates::{ExecutionContext, TaskDelegate};
pub use memory::MemoryProcessEngine;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub name: Option<String>,
    /// Id of the user task node in the process definition.
    pub task_definition_key: String,
    pub process_instance_id: String,
    pub process_definition_id: String,
    pub process_definition_key: String,
    pub form_key: Option<String>,
    pub owner: Option<String>,
    pub assignee: Option<String>,
    pub candidate_users: Vec<String>,
    pub candidate_groups: Vec<String>,
    pub create_time: DateTime<Utc>,
    pub due_date: Option<DateTime<Utc>>,
}

impl TaskInfo {
    pub fn is_candidate(&self, username: &str) -> bool {
        self.assignee.as_deref() == Some(username)
            || self.candidate_users.iter().any(|u| u == username)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricActivity {
    pub id: String,
    pub process_instance_id: String,
    pub activity_id: String,
    /// BPMN element name of the activity, e.g. `userTask`.
    pub activity_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Form definition of a pending task with current values filled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskForm {
    pub form_key: Option<String>,
    pub properties: Vec<WorkflowFormProperty>,
}

impl TaskForm {
    pub fn is_empty(&self) -> bool {
        self.form_key.is_none() && self.properties.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOrderField {
    TaskId,
    CreateTime,
    DueDate,
    Owner,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskQuery {
    /// Tasks assigned to, owned by or offered to this user.
    pub candidate_or_assigned: Option<String>,
    /// Tasks offered to any of these groups.
    pub candidate_groups: Vec<String>,
    /// Only tasks flagged with the `taskIsForm` local variable.
    pub form_tasks_only: bool,
    pub order_by: Vec<(TaskOrderField, SortDirection)>,
    pub first: usize,
    pub max: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPage {
    /// Matching tasks before paging.
    pub total: usize,
    pub tasks: Vec<TaskInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deployment {
    pub name: String,
    pub resources: BTreeMap<String, Vec<u8>>,
}

impl Deployment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: BTreeMap::new(),
        }
    }

    pub fn with_resource(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.resources.insert(name.into(), bytes.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDefinitionInfo {
    pub id: String,
    pub key: String,
    pub name: Option<String>,
    pub version: u32,
    pub deployment_id: String,
    pub resource_name: String,
    pub diagram_resource_name: Option<String>,
}

/// Editable diagram model paired with a process definition key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditorModel {
    pub id: String,
    pub key: String,
    pub name: Option<String>,
    pub deployment_id: Option<String>,
    /// Editor JSON document.
    pub source: Value,
}

#[async_trait]
pub trait ProcessEngine: Send + Sync {
    // ── Runtime ──

    /// Start the latest version of `process_key`; returns the instance id.
    async fn start_process(&self, process_key: &str, variables: Variables) -> Result<String>;
    async fn pending_tasks(&self, instance_id: &str) -> Result<Vec<TaskInfo>>;
    async fn task(&self, task_id: &str) -> Result<Option<TaskInfo>>;
    /// Merge `variables` into the process and continue past the task.
    async fn complete_task(&self, task_id: &str, variables: Variables) -> Result<()>;
    async fn variable(&self, instance_id: &str, name: &str) -> Result<Option<Value>>;
    async fn variables(&self, instance_id: &str) -> Result<Variables>;
    async fn set_variable(&self, instance_id: &str, name: &str, value: Value) -> Result<()>;
    async fn remove_variable(&self, instance_id: &str, name: &str) -> Result<()>;
    async fn set_task_local_variable(&self, task_id: &str, name: &str, value: Value)
        -> Result<()>;
    async fn task_local_variable(&self, task_id: &str, name: &str) -> Result<Option<Value>>;
    /// Remove an instance with its tasks, variables and history.
    async fn delete_process_instance(&self, instance_id: &str) -> Result<()>;
    /// Zero once the instance has ended or is unknown.
    async fn active_execution_count(&self, instance_id: &str) -> Result<usize>;

    // ── Forms and task service ──

    async fn task_form(&self, task_id: &str) -> Result<Option<TaskForm>>;
    /// Convert and store the submitted values together with `variables`, then
    /// complete the task. Nothing is stored when the values are rejected.
    async fn submit_task_form(
        &self,
        task_id: &str,
        values: BTreeMap<String, String>,
        variables: Variables,
    ) -> Result<()>;
    async fn set_task_owner(&self, task_id: &str, owner: &str) -> Result<()>;
    async fn query_tasks(&self, query: &TaskQuery) -> Result<TaskPage>;

    // ── History ──

    async fn historic_activities(&self, instance_id: &str) -> Result<Vec<HistoricActivity>>;
    /// Drop history and, for ended instances, their variables.
    async fn purge_history(&self, instance_id: &str) -> Result<()>;

    // ── Repository ──

    async fn deploy(&self, deployment: Deployment) -> Result<Vec<ProcessDefinitionInfo>>;
    async fn undeploy(&self, deployment_id: &str) -> Result<()>;
    /// Latest version of every deployed key, ordered by key.
    async fn latest_definitions(&self) -> Result<Vec<ProcessDefinitionInfo>>;
    async fn resource(&self, deployment_id: &str, resource_name: &str)
        -> Result<Option<Vec<u8>>>;
    async fn process_model(&self, definition_id: &str) -> Result<Option<ProcessModel>>;
    /// Store or replace the editor model for `model.key`; returns its id.
    async fn save_model(&self, model: EditorModel) -> Result<String>;
    async fn model(&self, process_key: &str) -> Result<Option<EditorModel>>;
    async fn delete_model(&self, process_key: &str) -> Result<()>;
}
