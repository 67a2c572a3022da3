//! Embedded process engine interpreting [`ProcessModel`] graphs.
//!
//! A process run works on a copy of the one instance it drives and is committed
//! only when the run succeeds, so a failing delegate leaves no partial progress.
//! Other writes check everything they need before touching the state.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use super::delegates::{lifecycle_delegates, ExecutionContext, TaskDelegate};
use super::{
    Deployment, EditorModel, HistoricActivity, ProcessDefinitionInfo, ProcessEngine, TaskForm,
    TaskInfo, TaskOrderField, TaskPage, TaskQuery,
};
use crate::error::DomainViolation;
use crate::model::{bpmn_xml, delegate_name, FormPropertyDef, NodeKind, ProcessModel};
use crate::types::{FormPropertyKind, SortDirection, WorkflowFormProperty};
use crate::vars::{self, Variables};

/// Upper bound on nodes visited by one call before the run is aborted.
const MAX_STEPS: usize = 10_000;

const DEFAULT_DATE_PATTERN: &str = "%Y-%m-%d";

// ── State ──

#[derive(Debug, Clone)]
struct DefinitionRecord {
    info: ProcessDefinitionInfo,
    model: Arc<ProcessModel>,
}

#[derive(Debug, Clone)]
struct DeploymentRecord {
    name: String,
    resources: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
struct InstanceRecord {
    definition_id: String,
    variables: Variables,
    ended: bool,
}

#[derive(Debug, Clone)]
struct TaskRecord {
    id: String,
    instance_id: String,
    node_id: String,
    owner: Option<String>,
    create_time: DateTime<Utc>,
    local: Variables,
}

#[derive(Debug, Clone, Default)]
struct EngineState {
    deployments: BTreeMap<String, DeploymentRecord>,
    definitions: Vec<DefinitionRecord>,
    models: BTreeMap<String, EditorModel>,
    instances: HashMap<String, InstanceRecord>,
    tasks: BTreeMap<String, TaskRecord>,
    history: Vec<HistoricActivity>,
}

/// Working copy of one instance while it executes.
struct Run {
    instance_id: String,
    model: Arc<ProcessModel>,
    instance: InstanceRecord,
    completed: Option<(TaskRecord, DateTime<Utc>)>,
    created: Vec<TaskRecord>,
    history: Vec<HistoricActivity>,
}

impl Run {
    fn resume(state: &EngineState, instance_id: &str) -> Result<Self> {
        Ok(Self {
            instance_id: instance_id.to_string(),
            model: state.model_of(instance_id)?,
            instance: state.instance(instance_id)?.clone(),
            completed: None,
            created: Vec::new(),
            history: Vec::new(),
        })
    }

    fn commit(self, state: &mut EngineState) {
        if let Some((task, ended_at)) = self.completed {
            state.tasks.remove(&task.id);
            if let Some(entry) = state.history.iter_mut().rev().find(|h| {
                h.process_instance_id == task.instance_id
                    && h.activity_id == task.node_id
                    && h.end_time.is_none()
            }) {
                entry.end_time = Some(ended_at);
            }
        }
        for task in self.created {
            state.tasks.insert(task.id.clone(), task);
        }
        state.history.extend(self.history);
        state.instances.insert(self.instance_id, self.instance);
    }
}

impl EngineState {
    fn definition(&self, id: &str) -> Option<&DefinitionRecord> {
        self.definitions.iter().find(|d| d.info.id == id)
    }

    fn latest(&self, key: &str) -> Option<&DefinitionRecord> {
        self.definitions
            .iter()
            .filter(|d| d.info.key == key)
            .max_by_key(|d| d.info.version)
    }

    fn instance(&self, id: &str) -> Result<&InstanceRecord> {
        self.instances
            .get(id)
            .ok_or_else(|| anyhow!("Process instance not found: {}", id))
    }

    fn instance_mut(&mut self, id: &str) -> Result<&mut InstanceRecord> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| anyhow!("Process instance not found: {}", id))
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut TaskRecord> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| anyhow!("Task not found: {}", id))
    }

    fn model_of(&self, instance_id: &str) -> Result<Arc<ProcessModel>> {
        let instance = self.instance(instance_id)?;
        self.definition(&instance.definition_id)
            .map(|d| d.model.clone())
            .ok_or_else(|| anyhow!("Process definition not found: {}", instance.definition_id))
    }

    fn task_info(&self, task: &TaskRecord) -> Option<TaskInfo> {
        let instance = self.instances.get(&task.instance_id)?;
        let definition = self.definition(&instance.definition_id)?;
        let node = definition.model.node(&task.node_id)?;
        let def = match &node.kind {
            NodeKind::UserTask(def) => def,
            _ => return None,
        };
        Some(TaskInfo {
            id: task.id.clone(),
            name: node.name.clone(),
            task_definition_key: node.id.clone(),
            process_instance_id: task.instance_id.clone(),
            process_definition_id: definition.info.id.clone(),
            process_definition_key: definition.info.key.clone(),
            form_key: def.form_key.clone(),
            owner: task.owner.clone(),
            assignee: def.assignee.clone(),
            candidate_users: def.candidate_users.clone(),
            candidate_groups: def.candidate_groups.clone(),
            create_time: task.create_time,
            due_date: None,
        })
    }
}

// ── Engine ──

pub struct MemoryProcessEngine {
    state: RwLock<EngineState>,
    delegates: HashMap<String, Arc<dyn TaskDelegate>>,
}

impl MemoryProcessEngine {
    /// Engine with the lifecycle delegates bound.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(EngineState::default()),
            delegates: lifecycle_delegates(),
        }
    }

    /// Engine with no delegates bound.
    pub fn bare() -> Self {
        Self {
            state: RwLock::new(EngineState::default()),
            delegates: HashMap::new(),
        }
    }

    pub fn with_delegate(mut self, name: impl Into<String>, delegate: Arc<dyn TaskDelegate>) -> Self {
        self.delegates.insert(name.into(), delegate);
        self
    }

    fn read<T>(&self, f: impl FnOnce(&EngineState) -> Result<T>) -> Result<T> {
        let state = self.state.read().map_err(|e| anyhow!("Lock: {}", e))?;
        f(&state)
    }

    fn write<T>(&self, f: impl FnOnce(&mut EngineState) -> Result<T>) -> Result<T> {
        let mut state = self.state.write().map_err(|e| anyhow!("Lock: {}", e))?;
        f(&mut state)
    }

    // ── Execution ──

    fn enter(&self, run: &mut Run, node_id: &str) -> Result<()> {
        let model = run.model.clone();
        let mut current = node_id.to_string();

        for _ in 0..MAX_STEPS {
            let node = model
                .node(&current)
                .ok_or_else(|| anyhow!("Unknown node '{}' in process '{}'", current, model.key))?;
            let now = Utc::now();
            let waits = matches!(node.kind, NodeKind::UserTask(_));
            run.history.push(HistoricActivity {
                id: Uuid::new_v4().to_string(),
                process_instance_id: run.instance_id.clone(),
                activity_id: node.id.clone(),
                activity_type: node.kind.element_name().to_string(),
                start_time: now,
                end_time: (!waits).then_some(now),
            });

            let next = match &node.kind {
                NodeKind::EndEvent => {
                    run.instance.ended = true;
                    tracing::debug!(instance = %run.instance_id, node = %node.id, "Process ended");
                    return Ok(());
                }
                NodeKind::UserTask(_) => {
                    run.created.push(TaskRecord {
                        id: Uuid::new_v4().to_string(),
                        instance_id: run.instance_id.clone(),
                        node_id: node.id.clone(),
                        owner: None,
                        create_time: now,
                        local: Variables::new(),
                    });
                    tracing::debug!(instance = %run.instance_id, task = %node.id, "Waiting at user task");
                    return Ok(());
                }
                NodeKind::ServiceTask { delegate_expression } => {
                    self.invoke(run, &node.id, delegate_expression)?;
                    leave(&model, &run.instance.variables, &node.id)?
                }
                NodeKind::ExclusiveGateway { default_flow } => {
                    choose(&model, &run.instance.variables, &node.id, default_flow.as_deref())?
                }
                NodeKind::StartEvent => leave(&model, &run.instance.variables, &node.id)?,
            };
            current = next;
        }
        bail!(
            "Process '{}' exceeded {} steps in instance {}",
            model.key,
            MAX_STEPS,
            run.instance_id
        )
    }

    fn invoke(&self, run: &mut Run, activity_id: &str, expression: &str) -> Result<()> {
        let name = delegate_name(expression)
            .ok_or_else(|| anyhow!("Invalid delegate expression '{}'", expression))?;
        let delegate = self
            .delegates
            .get(name)
            .ok_or_else(|| anyhow!("No delegate bound to '{}'", name))?
            .clone();
        let mut ctx = ExecutionContext {
            instance_id: &run.instance_id,
            activity_id,
            variables: &mut run.instance.variables,
        };
        delegate
            .execute(&mut ctx)
            .with_context(|| format!("Delegate '{}' failed at '{}'", name, activity_id))
    }

    /// Complete `task_id` with `variables` merged in and run to the next wait state.
    fn complete(&self, state: &EngineState, task_id: &str, variables: Variables) -> Result<Run> {
        let task = state
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| anyhow!("Task not found: {}", task_id))?;
        let mut run = Run::resume(state, &task.instance_id)?;
        run.instance.variables.extend(variables);

        let next = leave(&run.model, &run.instance.variables, &task.node_id)?;
        tracing::debug!(instance = %task.instance_id, task = %task.node_id, "Task completed");
        run.completed = Some((task, Utc::now()));
        self.enter(&mut run, &next)?;
        Ok(run)
    }
}

impl Default for MemoryProcessEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn condition_holds(expr: Option<&str>, variables: &Variables) -> Result<bool> {
    match expr {
        None => Ok(true),
        Some(expr) => Ok(crate::model::condition::Condition::parse(expr)?.evaluate(variables)),
    }
}

/// Target of the first outgoing flow whose condition holds.
fn leave(model: &ProcessModel, variables: &Variables, node_id: &str) -> Result<String> {
    for flow in model.outgoing(node_id) {
        if condition_holds(flow.condition.as_deref(), variables)? {
            return Ok(flow.target.clone());
        }
    }
    bail!("No outgoing sequence flow can be taken from '{}'", node_id)
}

fn choose(
    model: &ProcessModel,
    variables: &Variables,
    gateway_id: &str,
    default_flow: Option<&str>,
) -> Result<String> {
    for flow in model.outgoing(gateway_id) {
        if Some(flow.id.as_str()) == default_flow {
            continue;
        }
        if let Some(expr) = flow.condition.as_deref() {
            if condition_holds(Some(expr), variables)? {
                return Ok(flow.target.clone());
            }
        }
    }
    match default_flow.and_then(|id| model.flow(id)) {
        Some(flow) => Ok(flow.target.clone()),
        None => bail!(
            "No condition of gateway '{}' matched and no default flow is set",
            gateway_id
        ),
    }
}

// ── Forms ──

fn render(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn form_property(def: &FormPropertyDef, variables: &Variables) -> WorkflowFormProperty {
    WorkflowFormProperty {
        id: def.id.clone(),
        name: def.name.clone(),
        kind: def.kind,
        value: variables.get(def.variable_name()).and_then(render),
        readable: def.readable,
        writable: def.writable,
        required: def.required,
        date_pattern: def.date_pattern.clone(),
        enum_values: def.enum_values.iter().cloned().collect(),
    }
}

/// Translate the common Java-style date pattern letters into chrono's syntax.
fn chrono_pattern(pattern: &str) -> String {
    pattern
        .replace("yyyy", "%Y")
        .replace("MM", "%m")
        .replace("dd", "%d")
        .replace("HH", "%H")
        .replace("mm", "%M")
        .replace("ss", "%S")
}

fn convert(def: &FormPropertyDef, raw: &str) -> std::result::Result<Value, DomainViolation> {
    let raw = raw.trim();
    let invalid = |what: &str| {
        DomainViolation::Parsing(format!("'{}' is not a valid {} for '{}'", raw, what, def.id))
    };
    match def.kind {
        FormPropertyKind::String => Ok(Value::String(raw.to_string())),
        FormPropertyKind::Long => raw.parse::<i64>().map(|n| json!(n)).map_err(|_| invalid("number")),
        FormPropertyKind::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(invalid("boolean")),
        },
        FormPropertyKind::Enum => {
            if def.enum_values.iter().any(|(id, _)| id == raw) {
                Ok(Value::String(raw.to_string()))
            } else {
                Err(invalid("choice"))
            }
        }
        FormPropertyKind::Date => {
            let pattern = def
                .date_pattern
                .as_deref()
                .map(chrono_pattern)
                .unwrap_or_else(|| DEFAULT_DATE_PATTERN.to_string());
            let parsed = NaiveDateTime::parse_from_str(raw, &pattern)
                .map(|dt| dt.to_string())
                .or_else(|_| NaiveDate::parse_from_str(raw, &pattern).map(|d| d.to_string()));
            parsed.map(Value::String).map_err(|_| invalid("date"))
        }
    }
}

fn form_values(
    task_key: &str,
    defs: &[FormPropertyDef],
    mut values: BTreeMap<String, String>,
) -> Result<Variables> {
    let mut out = Variables::new();
    for def in defs {
        let supplied = values.remove(&def.id).filter(|v| !v.trim().is_empty());
        match supplied {
            Some(_) if !def.writable => {
                return Err(DomainViolation::Client(format!(
                    "form property '{}' of '{}' is not writable",
                    def.id, task_key
                ))
                .into());
            }
            Some(raw) => {
                out.insert(def.variable_name().to_string(), convert(def, &raw)?);
            }
            None if def.required && def.writable => {
                return Err(DomainViolation::Client(format!(
                    "form property '{}' of '{}' is required",
                    def.id, task_key
                ))
                .into());
            }
            None => {}
        }
    }
    if let Some(unknown) = values.keys().next() {
        return Err(DomainViolation::Client(format!(
            "'{}' has no form property '{}'",
            task_key, unknown
        ))
        .into());
    }
    Ok(out)
}

// ── Queries ──

fn is_form_task(task: &TaskRecord) -> bool {
    task.local.get(vars::TASK_IS_FORM) == Some(&Value::Bool(true))
}

fn matches_query(task: &TaskRecord, info: &TaskInfo, query: &TaskQuery) -> bool {
    if query.form_tasks_only && !is_form_task(task) {
        return false;
    }
    if let Some(user) = query.candidate_or_assigned.as_deref() {
        if !(info.is_candidate(user) || info.owner.as_deref() == Some(user)) {
            return false;
        }
    }
    if !query.candidate_groups.is_empty()
        && !info
            .candidate_groups
            .iter()
            .any(|g| query.candidate_groups.contains(g))
    {
        return false;
    }
    true
}

fn compare_tasks(a: &TaskInfo, b: &TaskInfo, order: &[(TaskOrderField, SortDirection)]) -> std::cmp::Ordering {
    for (field, direction) in order {
        let ordering = match field {
            TaskOrderField::TaskId => a.id.cmp(&b.id),
            TaskOrderField::CreateTime => a.create_time.cmp(&b.create_time),
            TaskOrderField::DueDate => a.due_date.cmp(&b.due_date),
            TaskOrderField::Owner => a.owner.cmp(&b.owner),
        };
        let ordering = match direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };
        if ordering.is_ne() {
            return ordering;
        }
    }
    a.create_time.cmp(&b.create_time).then_with(|| a.id.cmp(&b.id))
}

fn is_process_resource(name: &str) -> bool {
    name.ends_with(".bpmn20.xml") || name.ends_with(".bpmn")
}

fn is_diagram_resource(name: &str) -> bool {
    name.ends_with(".png") || name.ends_with(".svg")
}

#[async_trait]
impl ProcessEngine for MemoryProcessEngine {
    async fn start_process(&self, process_key: &str, variables: Variables) -> Result<String> {
        self.write(|state| {
            let definition = state
                .latest(process_key)
                .ok_or_else(|| anyhow!("No process definition deployed for key '{}'", process_key))?;
            let start = definition
                .model
                .start_node()
                .map(|n| n.id.clone())
                .ok_or_else(|| anyhow!("Process '{}' has no start event", process_key))?;

            let instance_id = Uuid::new_v4().to_string();
            let mut run = Run {
                instance_id: instance_id.clone(),
                model: definition.model.clone(),
                instance: InstanceRecord {
                    definition_id: definition.info.id.clone(),
                    variables,
                    ended: false,
                },
                completed: None,
                created: Vec::new(),
                history: Vec::new(),
            };
            self.enter(&mut run, &start)?;
            run.commit(state);
            tracing::info!(process_key = %process_key, instance = %instance_id, "Process started");
            Ok(instance_id)
        })
    }

    async fn pending_tasks(&self, instance_id: &str) -> Result<Vec<TaskInfo>> {
        self.read(|state| {
            Ok(state
                .tasks
                .values()
                .filter(|t| t.instance_id == instance_id)
                .filter_map(|t| state.task_info(t))
                .collect())
        })
    }

    async fn task(&self, task_id: &str) -> Result<Option<TaskInfo>> {
        self.read(|state| Ok(state.tasks.get(task_id).and_then(|t| state.task_info(t))))
    }

    async fn complete_task(&self, task_id: &str, variables: Variables) -> Result<()> {
        self.write(|state| {
            let run = self.complete(state, task_id, variables)?;
            run.commit(state);
            Ok(())
        })
    }

    async fn variable(&self, instance_id: &str, name: &str) -> Result<Option<Value>> {
        self.read(|state| Ok(state.instance(instance_id)?.variables.get(name).cloned()))
    }

    async fn variables(&self, instance_id: &str) -> Result<Variables> {
        self.read(|state| Ok(state.instance(instance_id)?.variables.clone()))
    }

    async fn set_variable(&self, instance_id: &str, name: &str, value: Value) -> Result<()> {
        self.write(|state| {
            state
                .instance_mut(instance_id)?
                .variables
                .insert(name.to_string(), value);
            Ok(())
        })
    }

    async fn remove_variable(&self, instance_id: &str, name: &str) -> Result<()> {
        self.write(|state| {
            state.instance_mut(instance_id)?.variables.remove(name);
            Ok(())
        })
    }

    async fn set_task_local_variable(&self, task_id: &str, name: &str, value: Value) -> Result<()> {
        self.write(|state| {
            state.task_mut(task_id)?.local.insert(name.to_string(), value);
            Ok(())
        })
    }

    async fn task_local_variable(&self, task_id: &str, name: &str) -> Result<Option<Value>> {
        self.read(|state| Ok(state.tasks.get(task_id).and_then(|t| t.local.get(name).cloned())))
    }

    async fn delete_process_instance(&self, instance_id: &str) -> Result<()> {
        self.write(|state| {
            state
                .instances
                .remove(instance_id)
                .ok_or_else(|| anyhow!("Process instance not found: {}", instance_id))?;
            state.tasks.retain(|_, t| t.instance_id != instance_id);
            state.history.retain(|h| h.process_instance_id != instance_id);
            tracing::info!(instance = %instance_id, "Process instance deleted");
            Ok(())
        })
    }

    async fn active_execution_count(&self, instance_id: &str) -> Result<usize> {
        self.read(|state| {
            Ok(match state.instances.get(instance_id) {
                Some(instance) if !instance.ended => 1,
                _ => 0,
            })
        })
    }

    async fn task_form(&self, task_id: &str) -> Result<Option<TaskForm>> {
        self.read(|state| {
            let Some(task) = state.tasks.get(task_id) else {
                return Ok(None);
            };
            let model = state.model_of(&task.instance_id)?;
            let variables = &state.instance(&task.instance_id)?.variables;
            Ok(model.user_task(&task.node_id).map(|def| TaskForm {
                form_key: def.form_key.clone(),
                properties: def
                    .form_properties
                    .iter()
                    .map(|p| form_property(p, variables))
                    .collect(),
            }))
        })
    }

    async fn submit_task_form(
        &self,
        task_id: &str,
        values: BTreeMap<String, String>,
        variables: Variables,
    ) -> Result<()> {
        self.write(|state| {
            let task = state
                .tasks
                .get(task_id)
                .ok_or_else(|| anyhow!("Task not found: {}", task_id))?;
            let model = state.model_of(&task.instance_id)?;
            let def = model
                .user_task(&task.node_id)
                .ok_or_else(|| anyhow!("'{}' is not a user task", task.node_id))?;
            let mut merged = variables;
            merged.extend(form_values(&task.node_id, &def.form_properties, values)?);
            let run = self.complete(state, task_id, merged)?;
            run.commit(state);
            Ok(())
        })
    }

    async fn set_task_owner(&self, task_id: &str, owner: &str) -> Result<()> {
        self.write(|state| {
            state.task_mut(task_id)?.owner = Some(owner.to_string());
            Ok(())
        })
    }

    async fn query_tasks(&self, query: &TaskQuery) -> Result<TaskPage> {
        self.read(|state| {
            let mut tasks: Vec<TaskInfo> = state
                .tasks
                .values()
                .filter_map(|t| state.task_info(t).filter(|info| matches_query(t, info, query)))
                .collect();
            tasks.sort_by(|a, b| compare_tasks(a, b, &query.order_by));
            let total = tasks.len();
            let page = tasks
                .into_iter()
                .skip(query.first)
                .take(query.max.unwrap_or(usize::MAX))
                .collect();
            Ok(TaskPage { total, tasks: page })
        })
    }

    async fn historic_activities(&self, instance_id: &str) -> Result<Vec<HistoricActivity>> {
        self.read(|state| {
            Ok(state
                .history
                .iter()
                .filter(|h| h.process_instance_id == instance_id)
                .cloned()
                .collect())
        })
    }

    async fn purge_history(&self, instance_id: &str) -> Result<()> {
        self.write(|state| {
            state.history.retain(|h| h.process_instance_id != instance_id);
            if state.instances.get(instance_id).is_some_and(|i| i.ended) {
                state.instances.remove(instance_id);
            }
            tracing::debug!(instance = %instance_id, "History purged");
            Ok(())
        })
    }

    async fn deploy(&self, deployment: Deployment) -> Result<Vec<ProcessDefinitionInfo>> {
        self.write(|state| {
            let deployment_id = Uuid::new_v4().to_string();
            let diagram = deployment
                .resources
                .keys()
                .find(|name| is_diagram_resource(name))
                .cloned();

            let mut records: Vec<DefinitionRecord> = Vec::new();
            for (resource_name, bytes) in &deployment.resources {
                if !is_process_resource(resource_name) {
                    continue;
                }
                let xml = std::str::from_utf8(bytes)
                    .with_context(|| format!("Resource '{}' is not UTF-8", resource_name))?;
                for model in bpmn_xml::parse_definitions(xml)
                    .with_context(|| format!("Failed to parse '{}'", resource_name))?
                {
                    model.ensure_valid()?;
                    let previous = records
                        .iter()
                        .filter(|r| r.info.key == model.key)
                        .map(|r| r.info.version)
                        .max()
                        .or_else(|| state.latest(&model.key).map(|d| d.info.version));
                    let version = previous.map_or(1, |v| v + 1);
                    records.push(DefinitionRecord {
                        info: ProcessDefinitionInfo {
                            id: format!("{}:{}:{}", model.key, version, deployment_id),
                            key: model.key.clone(),
                            name: model.name.clone(),
                            version,
                            deployment_id: deployment_id.clone(),
                            resource_name: resource_name.clone(),
                            diagram_resource_name: diagram.clone(),
                        },
                        model: Arc::new(model),
                    });
                }
            }
            if records.is_empty() {
                bail!("Deployment '{}' contains no process definition", deployment.name);
            }

            let deployed: Vec<ProcessDefinitionInfo> = records.iter().map(|r| r.info.clone()).collect();
            for info in &deployed {
                tracing::info!(process_key = %info.key, version = info.version, "Process definition deployed");
            }
            state.definitions.extend(records);
            state.deployments.insert(
                deployment_id,
                DeploymentRecord {
                    name: deployment.name,
                    resources: deployment.resources,
                },
            );
            Ok(deployed)
        })
    }

    async fn undeploy(&self, deployment_id: &str) -> Result<()> {
        self.write(|state| {
            let name = state
                .deployments
                .get(deployment_id)
                .map(|d| d.name.clone())
                .ok_or_else(|| anyhow!("Deployment not found: {}", deployment_id))?;
            let running = state.instances.values().any(|i| {
                !i.ended
                    && state
                        .definition(&i.definition_id)
                        .is_some_and(|d| d.info.deployment_id == deployment_id)
            });
            if running {
                bail!("Deployment '{}' still has running process instances", name);
            }
            state.deployments.remove(deployment_id);
            state.definitions.retain(|d| d.info.deployment_id != deployment_id);
            tracing::info!(deployment = %deployment_id, name = %name, "Deployment removed");
            Ok(())
        })
    }

    async fn latest_definitions(&self) -> Result<Vec<ProcessDefinitionInfo>> {
        self.read(|state| {
            let mut latest: BTreeMap<&str, &ProcessDefinitionInfo> = BTreeMap::new();
            for d in &state.definitions {
                let entry = latest.entry(d.info.key.as_str()).or_insert(&d.info);
                if d.info.version > entry.version {
                    *entry = &d.info;
                }
            }
            Ok(latest.into_values().cloned().collect())
        })
    }

    async fn resource(&self, deployment_id: &str, resource_name: &str) -> Result<Option<Vec<u8>>> {
        self.read(|state| {
            Ok(state
                .deployments
                .get(deployment_id)
                .and_then(|d| d.resources.get(resource_name).cloned()))
        })
    }

    async fn process_model(&self, definition_id: &str) -> Result<Option<ProcessModel>> {
        self.read(|state| Ok(state.definition(definition_id).map(|d| (*d.model).clone())))
    }

    async fn save_model(&self, mut model: EditorModel) -> Result<String> {
        self.write(|state| {
            if let Some(existing) = state.models.get(&model.key) {
                model.id = existing.id.clone();
            } else if model.id.is_empty() {
                model.id = Uuid::new_v4().to_string();
            }
            let id = model.id.clone();
            state.models.insert(model.key.clone(), model);
            Ok(id)
        })
    }

    async fn model(&self, process_key: &str) -> Result<Option<EditorModel>> {
        self.read(|state| Ok(state.models.get(process_key).cloned()))
    }

    async fn delete_model(&self, process_key: &str) -> Result<()> {
        self.write(|state| {
            state.models.remove(process_key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkflowError;
    use crate::resources::{USER_WORKFLOW, USER_WORKFLOW_APPROVAL};
    use crate::types::IdentityDraft;

    async fn engine_with(xml: &str, name: &str) -> MemoryProcessEngine {
        let engine = MemoryProcessEngine::new();
        engine
            .deploy(Deployment::new(name).with_resource(format!("{name}.bpmn20.xml"), xml))
            .await
            .unwrap();
        engine
    }

    fn start_vars(username: &str, enabled: Option<bool>) -> Variables {
        let mut vars = Variables::new();
        vars.insert(
            vars::IDENTITY_DRAFT.into(),
            serde_json::to_value(IdentityDraft::new(username)).unwrap(),
        );
        vars.insert(vars::ENABLED.into(), json!(enabled));
        vars
    }

    async fn single_task(engine: &MemoryProcessEngine, instance: &str) -> TaskInfo {
        let mut tasks = engine.pending_tasks(instance).await.unwrap();
        assert_eq!(tasks.len(), 1, "expected one pending task");
        tasks.remove(0)
    }

    fn task_var(name: &str) -> Variables {
        Variables::from([(vars::TASK.to_string(), json!(name))])
    }

    fn submitter(name: &str) -> Variables {
        Variables::from([(vars::FORM_SUBMITTER.to_string(), json!(name))])
    }

    #[tokio::test]
    async fn routes_enabled_hint() {
        let engine = engine_with(USER_WORKFLOW, "userWorkflow").await;

        let active = engine.start_process("userWorkflow", start_vars("a", Some(true))).await.unwrap();
        assert_eq!(single_task(&engine, &active).await.task_definition_key, "active");

        let suspended = engine.start_process("userWorkflow", start_vars("b", Some(false))).await.unwrap();
        assert_eq!(single_task(&engine, &suspended).await.task_definition_key, "suspended");

        let created = engine.start_process("userWorkflow", start_vars("c", None)).await.unwrap();
        assert_eq!(single_task(&engine, &created).await.task_definition_key, "created");
    }

    #[tokio::test]
    async fn history_and_completion() {
        let engine = engine_with(USER_WORKFLOW, "userWorkflow").await;
        let id = engine.start_process("userWorkflow", start_vars("a", Some(true))).await.unwrap();

        let ids: Vec<String> = engine
            .historic_activities(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.activity_id)
            .collect();
        assert_eq!(ids, vec!["theStart", "create", "enableGW", "activate", "active"]);

        let task = single_task(&engine, &id).await;
        engine.complete_task(&task.id, task_var("suspend")).await.unwrap();
        assert_eq!(single_task(&engine, &id).await.task_definition_key, "suspended");

        let task = single_task(&engine, &id).await;
        engine.complete_task(&task.id, task_var("delete")).await.unwrap();
        assert!(engine.pending_tasks(&id).await.unwrap().is_empty());
        assert_eq!(engine.active_execution_count(&id).await.unwrap(), 0);

        engine.purge_history(&id).await.unwrap();
        assert!(engine.historic_activities(&id).await.unwrap().is_empty());
        assert!(engine.variables(&id).await.is_err());
    }

    #[tokio::test]
    async fn failing_delegate_leaves_state_untouched() {
        let engine = engine_with(USER_WORKFLOW, "userWorkflow").await;
        let id = engine.start_process("userWorkflow", start_vars("a", None)).await.unwrap();
        let task = single_task(&engine, &id).await;

        let mut vars = task_var("activate");
        vars.insert(vars::TOKEN.into(), json!("wrong"));
        let err = engine.complete_task(&task.id, vars).await.unwrap_err();
        assert!(matches!(
            WorkflowError::translate(err, "activate"),
            WorkflowError::Validation(_)
        ));

        let still = single_task(&engine, &id).await;
        assert_eq!(still.id, task.id);
        assert_eq!(engine.variable(&id, vars::TASK).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_run_keeps_other_instances() {
        let engine = engine_with(USER_WORKFLOW, "userWorkflow").await;
        let first = engine.start_process("userWorkflow", start_vars("a", Some(true))).await.unwrap();
        let second = engine.start_process("userWorkflow", start_vars("b", Some(true))).await.unwrap();
        let history = engine.historic_activities(&second).await.unwrap().len();

        let task = single_task(&engine, &first).await;
        assert!(engine.complete_task(&task.id, task_var("fly")).await.is_err());
        assert!(engine
            .start_process("userWorkflow", start_vars(" ", None))
            .await
            .is_err());

        assert_eq!(single_task(&engine, &first).await.id, task.id);
        assert_eq!(engine.historic_activities(&second).await.unwrap().len(), history);
        let task = single_task(&engine, &second).await;
        engine.complete_task(&task.id, task_var("suspend")).await.unwrap();
        assert_eq!(single_task(&engine, &second).await.task_definition_key, "suspended");
        assert_eq!(single_task(&engine, &first).await.task_definition_key, "active");
    }

    #[tokio::test]
    async fn deleted_instance_leaves_nothing_behind() {
        let engine = engine_with(USER_WORKFLOW, "userWorkflow").await;
        let id = engine.start_process("userWorkflow", start_vars("a", Some(true))).await.unwrap();

        engine.delete_process_instance(&id).await.unwrap();
        assert!(engine.pending_tasks(&id).await.unwrap().is_empty());
        assert!(engine.historic_activities(&id).await.unwrap().is_empty());
        assert!(engine.variables(&id).await.is_err());
        assert_eq!(engine.active_execution_count(&id).await.unwrap(), 0);
        assert!(engine.delete_process_instance(&id).await.is_err());
    }

    #[tokio::test]
    async fn unmatched_gateway_is_an_error() {
        let engine = engine_with(USER_WORKFLOW, "userWorkflow").await;
        let id = engine.start_process("userWorkflow", start_vars("a", Some(true))).await.unwrap();
        let task = single_task(&engine, &id).await;
        assert!(engine.complete_task(&task.id, task_var("fly")).await.is_err());
    }

    #[tokio::test]
    async fn form_submission_checks_and_converts() {
        let engine = engine_with(USER_WORKFLOW_APPROVAL, "userWorkflowApproval").await;
        let id = engine
            .start_process("userWorkflowApproval", start_vars("dana", None))
            .await
            .unwrap();
        let task = single_task(&engine, &id).await;
        assert_eq!(task.task_definition_key, "createApproval");
        assert_eq!(task.candidate_groups, vec!["managingDirector"]);

        let form = engine.task_form(&task.id).await.unwrap().unwrap();
        let username = form.properties.iter().find(|p| p.id == "username").unwrap();
        assert_eq!(username.value.as_deref(), Some("dana"));
        assert!(!username.writable);

        let missing = engine.submit_task_form(&task.id, BTreeMap::new(), Variables::new()).await.unwrap_err();
        assert!(matches!(
            WorkflowError::translate(missing, "submit"),
            WorkflowError::Validation(_)
        ));

        let bad = BTreeMap::from([("approveCreate".to_string(), "maybe".to_string())]);
        let err = engine.submit_task_form(&task.id, bad, submitter("dana")).await.unwrap_err();
        assert!(matches!(
            WorkflowError::translate(err, "submit"),
            WorkflowError::ParsingInvalid(_)
        ));
        assert_eq!(engine.variable(&id, vars::FORM_SUBMITTER).await.unwrap(), None);

        let readonly = BTreeMap::from([
            ("approveCreate".to_string(), "true".to_string()),
            ("username".to_string(), "mallory".to_string()),
        ]);
        assert!(engine.submit_task_form(&task.id, readonly, Variables::new()).await.is_err());

        let ok = BTreeMap::from([("approveCreate".to_string(), "TRUE".to_string())]);
        engine.submit_task_form(&task.id, ok, submitter("md")).await.unwrap();
        assert_eq!(engine.variable(&id, "approveCreate").await.unwrap(), Some(json!(true)));
        assert_eq!(
            engine.variable(&id, vars::FORM_SUBMITTER).await.unwrap(),
            Some(json!("md"))
        );
        assert_eq!(single_task(&engine, &id).await.task_definition_key, "created");
    }

    #[tokio::test]
    async fn query_filters_and_pages() {
        let engine = engine_with(USER_WORKFLOW_APPROVAL, "userWorkflowApproval").await;
        let mut task_ids = Vec::new();
        for name in ["a", "b", "c"] {
            let id = engine
                .start_process("userWorkflowApproval", start_vars(name, None))
                .await
                .unwrap();
            task_ids.push(single_task(&engine, &id).await.id);
        }
        for id in &task_ids[..2] {
            engine
                .set_task_local_variable(id, vars::TASK_IS_FORM, json!(true))
                .await
                .unwrap();
        }
        engine.set_task_owner(&task_ids[0], "eve").await.unwrap();

        let forms = TaskQuery {
            form_tasks_only: true,
            ..TaskQuery::default()
        };
        assert_eq!(engine.query_tasks(&forms).await.unwrap().total, 2);

        let by_group = TaskQuery {
            candidate_groups: vec!["managingDirector".into()],
            max: Some(1),
            ..TaskQuery::default()
        };
        let page = engine.query_tasks(&by_group).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.tasks.len(), 1);

        let owned = TaskQuery {
            candidate_or_assigned: Some("eve".into()),
            ..TaskQuery::default()
        };
        let page = engine.query_tasks(&owned).await.unwrap();
        assert_eq!(page.tasks.len(), 1);
        assert_eq!(page.tasks[0].id, task_ids[0]);
    }

    #[tokio::test]
    async fn deploy_versions_and_undeploy() {
        let engine = MemoryProcessEngine::new();
        let first = engine
            .deploy(
                Deployment::new("v1")
                    .with_resource("userWorkflow.bpmn20.xml", USER_WORKFLOW)
                    .with_resource("userWorkflow.png", vec![0u8, 1, 2]),
            )
            .await
            .unwrap();
        assert_eq!(first[0].version, 1);
        assert_eq!(first[0].diagram_resource_name.as_deref(), Some("userWorkflow.png"));

        let second = engine
            .deploy(Deployment::new("v2").with_resource("userWorkflow.bpmn20.xml", USER_WORKFLOW))
            .await
            .unwrap();
        assert_eq!(second[0].version, 2);

        let latest = engine.latest_definitions().await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, 2);

        let bytes = engine
            .resource(&first[0].deployment_id, "userWorkflow.bpmn20.xml")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bytes, USER_WORKFLOW.as_bytes());

        let id = engine.start_process("userWorkflow", start_vars("x", Some(true))).await.unwrap();
        assert!(engine.undeploy(&second[0].deployment_id).await.is_err());
        let task = single_task(&engine, &id).await;
        engine.complete_task(&task.id, task_var("delete")).await.unwrap();
        engine.undeploy(&second[0].deployment_id).await.unwrap();
        assert_eq!(engine.latest_definitions().await.unwrap()[0].version, 1);
    }

    #[tokio::test]
    async fn deploy_rejects_empty_and_invalid() {
        let engine = MemoryProcessEngine::new();
        assert!(engine
            .deploy(Deployment::new("none").with_resource("readme.txt", "hi"))
            .await
            .is_err());
        assert!(engine
            .deploy(Deployment::new("bad").with_resource("bad.bpmn20.xml", "<definitions>"))
            .await
            .is_err());
        assert!(engine.latest_definitions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn editor_models_keyed_by_process() {
        let engine = MemoryProcessEngine::new();
        let model = EditorModel {
            id: String::new(),
            key: "userWorkflow".into(),
            name: None,
            deployment_id: None,
            source: json!({"childShapes": []}),
        };
        let id = engine.save_model(model.clone()).await.unwrap();
        let again = engine.save_model(model).await.unwrap();
        assert_eq!(id, again);
        assert!(engine.model("userWorkflow").await.unwrap().is_some());
        engine.delete_model("userWorkflow").await.unwrap();
        assert!(engine.model("userWorkflow").await.unwrap().is_none());
    }

    #[test]
    fn date_patterns() {
        let mut def = FormPropertyDef::new("due", FormPropertyKind::Date);
        assert_eq!(convert(&def, "2024-03-01").unwrap(), json!("2024-03-01"));
        def.date_pattern = Some("dd/MM/yyyy".into());
        assert_eq!(convert(&def, "01/03/2024").unwrap(), json!("2024-03-01"));
        assert!(convert(&def, "2024-03-01").is_err());
    }
}
