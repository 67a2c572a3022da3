//! Human tasks exposed as forms: listing, claiming and submission.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::json;

use crate::engine::{TaskInfo, TaskOrderField, TaskPage, TaskQuery};
use crate::error::{engine_err, WfResult, WorkflowError};
use crate::propagation::{PropagationByResource, ResourceOperation};
use crate::runtime::WorkflowRuntime;
use crate::types::{
    FormPage, Identity, IdentityDraft, IdentityPatch, OrderByClause, PasswordPatch, WorkflowForm,
    WorkflowResult,
};
use crate::vars::{self, Variables};

pub struct FormGateway {
    runtime: Arc<WorkflowRuntime>,
}

fn order_field(name: &str) -> Option<TaskOrderField> {
    match name {
        "taskId" | "id" => Some(TaskOrderField::TaskId),
        "createTime" => Some(TaskOrderField::CreateTime),
        "dueDate" => Some(TaskOrderField::DueDate),
        "owner" => Some(TaskOrderField::Owner),
        _ => None,
    }
}

impl FormGateway {
    pub(crate) fn new(runtime: Arc<WorkflowRuntime>) -> Self {
        Self { runtime }
    }

    /// Park propagation and `password` in the process if the identity waits
    /// on a form. Returns true when deferred, leaving `prop` empty.
    pub async fn save_for_form_submit(
        &self,
        identity: &Identity,
        password: Option<String>,
        prop: &mut PropagationByResource,
    ) -> WfResult<bool> {
        self.runtime
            .save_for_form_submit(identity, password, prop)
            .await
    }

    // ── Listing ──

    /// One page (1-based) of pending forms visible to the current actor.
    pub async fn get_forms(
        &self,
        page: usize,
        size: usize,
        order_by: &[OrderByClause],
    ) -> WfResult<FormPage> {
        let rt = &self.runtime;
        let actor = rt.actor.current_actor();

        let mut order = Vec::new();
        for clause in order_by {
            match order_field(&clause.field) {
                Some(field) => order.push((field, clause.direction)),
                None => tracing::warn!(field = %clause.field, "Unsupported form ordering ignored"),
            }
        }
        let first = page.saturating_sub(1).checked_mul(size).ok_or_else(|| {
            WorkflowError::Validation(format!("Page {} of size {} is out of range", page, size))
        })?;
        let base = TaskQuery {
            form_tasks_only: true,
            order_by: order,
            first,
            max: Some(size),
            ..TaskQuery::default()
        };

        let result = if rt.is_admin(&actor) {
            self.query(&base).await?
        } else {
            let direct = self
                .query(&TaskQuery {
                    candidate_or_assigned: Some(actor.clone()),
                    ..base.clone()
                })
                .await?;
            if direct.total > 0 {
                direct
            } else {
                let groups = self.groups_of(&actor).await?;
                if groups.is_empty() {
                    direct
                } else {
                    self.query(&TaskQuery {
                        candidate_groups: groups.into_iter().collect(),
                        ..base
                    })
                    .await?
                }
            }
        };

        let mut forms = Vec::with_capacity(result.tasks.len());
        for task in &result.tasks {
            if let Some(form) = self.build_form(task).await? {
                forms.push(form);
            }
        }
        Ok(FormPage {
            total: result.total,
            forms,
        })
    }

    /// The pending form of a process instance, if its single task has one.
    pub async fn get_form(&self, workflow_id: &str) -> WfResult<Option<WorkflowForm>> {
        match self.runtime.pending_single(workflow_id).await? {
            Some(task) => self.build_form(&task).await,
            None => Ok(None),
        }
    }

    // ── Claim and submit ──

    pub async fn claim_form(&self, task_id: &str) -> WfResult<WorkflowForm> {
        let rt = &self.runtime;
        let task = self.task(task_id).await?;
        if self.build_form(&task).await?.is_none() {
            return Err(WorkflowError::NotFound(format!("Form for task {}", task_id)));
        }

        let actor = rt.actor.current_actor();
        if !rt.is_admin(&actor) && !self.is_candidate(&task, &actor).await? {
            return Err(WorkflowError::Validation(format!(
                "{} is not a candidate for task {}",
                actor, task_id
            )));
        }

        rt.engine
            .set_task_owner(task_id, &actor)
            .await
            .map_err(engine_err(format!("While claiming task {}", task_id)))?;
        tracing::info!(task_id = %task_id, owner = %actor, "Form claimed");

        let claimed = self.task(task_id).await?;
        self.build_form(&claimed)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("Form for task {}", task_id)))
    }

    /// Submit the writable values of `form` and carry on the process.
    pub async fn submit_form(
        &self,
        form: &WorkflowForm,
    ) -> WfResult<WorkflowResult<IdentityPatch>> {
        let rt = &self.runtime;
        let task = self.task(&form.task_id).await?;
        let actor = rt.actor.current_actor();
        if task.owner.as_deref() != Some(actor.as_str()) {
            return Err(WorkflowError::Validation(format!(
                "Task {} is owned by {}, not by {}",
                task.id,
                task.owner.as_deref().unwrap_or("nobody"),
                actor
            )));
        }

        let workflow_id = task.process_instance_id.clone();
        let outcome = self.submit(form, &task, &actor).await;
        rt.scrubbed(&workflow_id, outcome).await
    }

    async fn submit(
        &self,
        form: &WorkflowForm,
        task: &TaskInfo,
        actor: &str,
    ) -> WfResult<WorkflowResult<IdentityPatch>> {
        let rt = &self.runtime;
        let workflow_id = task.process_instance_id.as_str();
        let mut identity = rt.load_by_workflow(workflow_id).await?;
        let before = rt.snapshot(workflow_id).await?;

        let values: BTreeMap<String, String> = form
            .properties
            .iter()
            .filter(|p| p.writable)
            .filter_map(|p| p.value.clone().map(|v| (p.id.clone(), v)))
            .collect();
        let mut submitter = Variables::new();
        submitter.insert(vars::FORM_SUBMITTER.into(), json!(actor));
        rt.engine
            .submit_task_form(&task.id, values, submitter)
            .await
            .map_err(engine_err(format!(
                "While submitting form of task '{}' for identity {}",
                task.task_definition_key, identity.key
            )))?;

        let after = rt.snapshot(workflow_id).await?;
        let mut performed = after.performed_since(&before);
        performed.insert(task.task_definition_key.clone());

        rt.adopt(&mut identity).await?;
        let mut prop: PropagationByResource = rt
            .variable(workflow_id, vars::PROP_BY_RESOURCE)
            .await?
            .optional(vars::PROP_BY_RESOURCE)
            .map_err(engine_err("While reading propagation intent"))?
            .unwrap_or_default();
        let password = rt.recover_password(workflow_id).await?;
        let stored: Option<IdentityPatch> = rt
            .variable(workflow_id, vars::IDENTITY_PATCH)
            .await?
            .ok();
        let patch = match stored {
            Some(mut patch) => {
                // the parked patch was stored without its clear password
                if let Some(parked) = patch.password.as_mut() {
                    if parked.value.is_none() {
                        parked.value = password.clone();
                    }
                }
                patch
            }
            None => {
                let mut synthesized = IdentityPatch::new(identity.key);
                synthesized.password = Some(PasswordPatch {
                    value: password.clone(),
                    on_identity: true,
                    resources: prop.get(ResourceOperation::Create).clone(),
                });
                synthesized
            }
        };

        if rt.active(workflow_id).await? {
            rt.update_status(&mut identity).await?;
            let saved = rt.save(&identity).await?;
            let deferred = rt.save_for_form_submit(&saved, password, &mut prop).await?;
            rt.settle(workflow_id, deferred).await?;
            tracing::info!(
                workflow_id = %workflow_id,
                task = %task.task_definition_key,
                status = saved.status.as_deref().unwrap_or("-"),
                "Form submitted"
            );
        } else {
            rt.store
                .delete(identity.key)
                .await
                .map_err(engine_err(format!("While deleting identity {}", identity.key)))?;
            rt.engine
                .purge_history(workflow_id)
                .await
                .map_err(engine_err(format!("While purging history of {}", workflow_id)))?;
            tracing::info!(workflow_id = %workflow_id, key = %identity.key, "Process ended on form submission; identity removed");
        }

        Ok(WorkflowResult::new(patch, Some(prop), performed))
    }

    // ── Helpers ──

    async fn task(&self, task_id: &str) -> WfResult<TaskInfo> {
        self.runtime
            .engine
            .task(task_id)
            .await
            .map_err(engine_err(format!("While looking up task {}", task_id)))?
            .ok_or_else(|| WorkflowError::NotFound(format!("Task {}", task_id)))
    }

    async fn query(&self, query: &TaskQuery) -> WfResult<TaskPage> {
        self.runtime
            .engine
            .query_tasks(query)
            .await
            .map_err(engine_err("While querying form tasks"))
    }

    async fn groups_of(&self, username: &str) -> WfResult<BTreeSet<String>> {
        let rt = &self.runtime;
        let identity = rt
            .store
            .find_by_username(username)
            .await
            .map_err(engine_err(format!("While loading identity '{}'", username)))?;
        match identity {
            Some(identity) => rt
                .store
                .find_all_group_names(&identity)
                .await
                .map_err(engine_err(format!("While reading groups of '{}'", username))),
            None => Ok(BTreeSet::new()),
        }
    }

    async fn is_candidate(&self, task: &TaskInfo, actor: &str) -> WfResult<bool> {
        if task.is_candidate(actor) {
            return Ok(true);
        }
        let groups = self.groups_of(actor).await?;
        Ok(task.candidate_groups.iter().any(|g| groups.contains(g)))
    }

    async fn build_form(&self, task: &TaskInfo) -> WfResult<Option<WorkflowForm>> {
        let rt = &self.runtime;
        let form = rt
            .engine
            .task_form(&task.id)
            .await
            .map_err(engine_err(format!("While reading form of task {}", task.id)))?;
        let Some(form) = form.filter(|f| !f.is_empty()) else {
            return Ok(None);
        };

        let workflow_id = &task.process_instance_id;
        let username = rt
            .store
            .find_by_workflow_id(workflow_id)
            .await
            .map_err(engine_err(format!("While loading identity for {}", workflow_id)))?
            .map(|identity| identity.username);
        let identity_draft = rt
            .variable::<IdentityDraft>(workflow_id, vars::IDENTITY_DRAFT)
            .await?
            .ok()
            .map(|mut draft| {
                draft.password = None;
                draft.encrypted_password = None;
                draft
            });
        let identity_patch = rt
            .variable::<IdentityPatch>(workflow_id, vars::IDENTITY_PATCH)
            .await?
            .ok()
            .map(|mut patch| {
                if let Some(password) = patch.password.as_mut() {
                    password.value = None;
                }
                patch
            });

        Ok(Some(WorkflowForm {
            workflow_id: workflow_id.clone(),
            task_id: task.id.clone(),
            task_key: task.task_definition_key.clone(),
            form_key: form.form_key,
            username,
            owner: task.owner.clone(),
            create_time: task.create_time,
            due_date: task.due_date,
            properties: form.properties,
            identity_draft,
            identity_patch,
        }))
    }
}
