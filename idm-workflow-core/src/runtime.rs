//! Plumbing shared by the lifecycle adapter and the form gateway.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{TaskCardinalityPolicy, WorkflowConfig};
use crate::crypto::PasswordCipher;
use crate::engine::{ProcessEngine, TaskInfo};
use crate::error::{engine_err, WfResult, WorkflowError};
use crate::ports::{ActorContext, IdentityStore};
use crate::propagation::PropagationByResource;
use crate::types::{Identity, IdentityDraft, IdentityKey, IdentityPatch};
use crate::vars::{self, lookup, VarLookup, Variables};

/// Distinct activity ids recorded in history for one process instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    activities: BTreeSet<String>,
}

impl ActivitySnapshot {
    pub fn new(activities: BTreeSet<String>) -> Self {
        Self { activities }
    }

    pub fn contains(&self, activity_id: &str) -> bool {
        self.activities.contains(activity_id)
    }

    pub fn activity_ids(&self) -> &BTreeSet<String> {
        &self.activities
    }

    /// Activities present now that were absent from `earlier`.
    pub fn performed_since(&self, earlier: &ActivitySnapshot) -> BTreeSet<String> {
        self.activities
            .difference(&earlier.activities)
            .cloned()
            .collect()
    }
}

pub(crate) struct WorkflowRuntime {
    pub engine: Arc<dyn ProcessEngine>,
    pub store: Arc<dyn IdentityStore>,
    pub actor: Arc<dyn ActorContext>,
    pub cipher: PasswordCipher,
    pub config: WorkflowConfig,
}

pub(crate) fn require_workflow_id(identity: &Identity) -> WfResult<&str> {
    identity.workflow_id().ok_or_else(|| {
        WorkflowError::NotFound(format!("Empty workflow id for identity {}", identity.key))
    })
}

impl WorkflowRuntime {
    pub fn is_admin(&self, actor: &str) -> bool {
        actor == self.config.admin_username
    }

    // ── Store ──

    pub async fn load(&self, key: IdentityKey) -> WfResult<Identity> {
        self.store
            .find_by_key(key)
            .await
            .map_err(engine_err(format!("While loading identity {}", key)))?
            .ok_or_else(|| WorkflowError::NotFound(format!("Identity {}", key)))
    }

    pub async fn load_by_workflow(&self, workflow_id: &str) -> WfResult<Identity> {
        self.store
            .find_by_workflow_id(workflow_id)
            .await
            .map_err(engine_err(format!("While loading identity for {}", workflow_id)))?
            .ok_or_else(|| WorkflowError::NotFound(format!("Identity for workflow {}", workflow_id)))
    }

    pub async fn save(&self, identity: &Identity) -> WfResult<Identity> {
        self.store
            .save(identity)
            .await
            .map_err(engine_err(format!("While saving identity {}", identity.key)))
    }

    pub async fn resources_of(&self, identity: &Identity) -> WfResult<BTreeSet<String>> {
        self.store
            .find_all_resource_keys(identity)
            .await
            .map_err(engine_err(format!("While reading resources of {}", identity.key)))
    }

    // ── Variables ──

    pub async fn variable<T: DeserializeOwned>(
        &self,
        workflow_id: &str,
        name: &str,
    ) -> WfResult<VarLookup<T>> {
        let value = self
            .engine
            .variable(workflow_id, name)
            .await
            .map_err(engine_err(format!("While reading variable '{}'", name)))?;
        Ok(VarLookup::from_owned(value))
    }

    pub async fn set_variable<T: Serialize + ?Sized>(
        &self,
        workflow_id: &str,
        name: &str,
        value: &T,
    ) -> WfResult<()> {
        let value = serde_json::to_value(value).map_err(|e| {
            WorkflowError::workflow(format!("While serializing variable '{}'", name), e.into())
        })?;
        self.engine
            .set_variable(workflow_id, name, value)
            .await
            .map_err(engine_err(format!("While setting variable '{}'", name)))
    }

    pub async fn remove_variable(&self, workflow_id: &str, name: &str) -> WfResult<()> {
        self.engine
            .remove_variable(workflow_id, name)
            .await
            .map_err(engine_err(format!("While removing variable '{}'", name)))
    }

    // ── Tasks and history ──

    pub async fn snapshot(&self, workflow_id: &str) -> WfResult<ActivitySnapshot> {
        let history = self
            .engine
            .historic_activities(workflow_id)
            .await
            .map_err(engine_err(format!("While reading history of {}", workflow_id)))?;
        Ok(ActivitySnapshot::new(
            history.into_iter().map(|h| h.activity_id).collect(),
        ))
    }

    /// The pending task if there is exactly one, without applying the policy.
    pub async fn pending_single(&self, workflow_id: &str) -> WfResult<Option<TaskInfo>> {
        let mut tasks = self
            .engine
            .pending_tasks(workflow_id)
            .await
            .map_err(engine_err(format!("While querying tasks of {}", workflow_id)))?;
        Ok(if tasks.len() == 1 { tasks.pop() } else { None })
    }

    /// The pending task; zero or several are handled per the cardinality policy.
    pub async fn single_task(&self, workflow_id: &str) -> WfResult<Option<TaskInfo>> {
        let mut tasks = self
            .engine
            .pending_tasks(workflow_id)
            .await
            .map_err(engine_err(format!("While querying tasks of {}", workflow_id)))?;
        if tasks.len() == 1 {
            return Ok(tasks.pop());
        }
        match self.config.task_cardinality {
            TaskCardinalityPolicy::Warn => {
                tracing::warn!(
                    workflow_id = %workflow_id,
                    pending = tasks.len(),
                    "Expected exactly one pending task"
                );
                Ok(None)
            }
            TaskCardinalityPolicy::Fail => Err(WorkflowError::workflow(
                format!("While looking up the pending task of {}", workflow_id),
                anyhow::anyhow!("{} pending tasks instead of one", tasks.len()),
            )),
        }
    }

    pub async fn active(&self, workflow_id: &str) -> WfResult<bool> {
        let count = self
            .engine
            .active_execution_count(workflow_id)
            .await
            .map_err(engine_err(format!("While checking executions of {}", workflow_id)))?;
        Ok(count > 0)
    }

    /// Advance the named transition and report the activities it performed.
    pub async fn execute_task(
        &self,
        identity: &Identity,
        task: &str,
        extra: Variables,
    ) -> WfResult<BTreeSet<String>> {
        let workflow_id = require_workflow_id(identity)?;
        let before = self.snapshot(workflow_id).await?;

        let mut bag = Variables::new();
        bag.insert(vars::WF_EXECUTOR.into(), json!(self.actor.current_actor()));
        bag.insert(vars::TASK.into(), json!(task));
        bag.insert(vars::PROPAGATE_ENABLE.into(), Value::Null);
        let snapshot = serde_json::to_value(identity).map_err(|e| {
            WorkflowError::workflow(format!("While snapshotting identity {}", identity.key), e.into())
        })?;
        bag.insert(vars::IDENTITY.into(), snapshot);
        bag.extend(extra);

        match self.single_task(workflow_id).await? {
            Some(pending) => {
                tracing::debug!(
                    workflow_id = %workflow_id,
                    task = %task,
                    pending = %pending.task_definition_key,
                    "Completing task"
                );
                self.engine
                    .complete_task(&pending.id, bag)
                    .await
                    .map_err(engine_err(format!(
                        "While completing task '{}' for identity {}",
                        task, identity.key
                    )))?;
            }
            None => {
                tracing::warn!(workflow_id = %workflow_id, task = %task, "Task not advanced");
            }
        }

        let after = self.snapshot(workflow_id).await?;
        let mut performed = after.performed_since(&before);
        performed.insert(task.to_string());
        Ok(performed)
    }

    // ── Identity state ──

    /// Take over what the process changed on the `identity` variable.
    pub async fn adopt(&self, identity: &mut Identity) -> WfResult<()> {
        let workflow_id = require_workflow_id(identity)?.to_string();
        let from_process: Option<Identity> = self
            .variable(&workflow_id, vars::IDENTITY)
            .await?
            .optional(vars::IDENTITY)
            .map_err(engine_err("While reading the identity variable"))?;
        if let Some(updated) = from_process {
            identity.username = updated.username;
            identity.suspended = updated.suspended;
            identity.password = updated.password;
            identity.clear_password = updated.clear_password;
            identity.token = updated.token;
            identity.resources = updated.resources;
            identity.groups = updated.groups;
        }
        Ok(())
    }

    /// Set status to the pending task's definition key.
    pub async fn update_status(&self, identity: &mut Identity) -> WfResult<()> {
        let workflow_id = require_workflow_id(identity)?.to_string();
        if let Some(task) = self.single_task(&workflow_id).await? {
            identity.status = Some(task.task_definition_key);
        }
        Ok(())
    }

    /// Adopt process changes, derive status and persist.
    pub async fn finish(&self, identity: &mut Identity) -> WfResult<Identity> {
        self.adopt(identity).await?;
        self.update_status(identity).await?;
        self.save(identity).await
    }

    // ── Deferred propagation ──

    pub async fn recover_password(&self, workflow_id: &str) -> WfResult<Option<String>> {
        let encrypted: Option<String> = self
            .variable(workflow_id, vars::ENCRYPTED_PWD)
            .await?
            .optional(vars::ENCRYPTED_PWD)
            .map_err(engine_err("While reading the encrypted password"))?;
        encrypted
            .map(|e| self.cipher.decrypt(workflow_id, &e))
            .transpose()
            .map_err(engine_err(format!("While decrypting password for {}", workflow_id)))
    }

    /// Park propagation and password in the process when a form is pending.
    ///
    /// Returns true when deferred; `prop` is then cleared.
    pub async fn save_for_form_submit(
        &self,
        identity: &Identity,
        password: Option<String>,
        prop: &mut PropagationByResource,
    ) -> WfResult<bool> {
        let Some(workflow_id) = identity.workflow_id() else {
            return Ok(false);
        };
        let Some(task) = self.pending_single(workflow_id).await? else {
            return Ok(false);
        };
        let form = self
            .engine
            .task_form(&task.id)
            .await
            .map_err(engine_err(format!("While reading form of task {}", task.id)))?;
        if form.map_or(true, |f| f.is_empty()) {
            return Ok(false);
        }

        let mut draft: IdentityDraft = self
            .variable(workflow_id, vars::IDENTITY_DRAFT)
            .await?
            .ok()
            .unwrap_or_else(|| IdentityDraft::from(identity));
        draft.key = Some(identity.key);
        draft.creation_date = Some(identity.creation_date);
        draft.last_change_date = identity.last_change_date;

        let password = match password.filter(|p| !p.is_empty()) {
            Some(p) => Some(p),
            None => self.recover_password(workflow_id).await?,
        };
        let encrypted = password
            .map(|p| self.cipher.encrypt(workflow_id, &p))
            .transpose()
            .map_err(engine_err(format!("While encrypting password for {}", workflow_id)))?;
        draft.password = None;
        draft.encrypted_password = encrypted.clone();
        self.set_variable(workflow_id, vars::IDENTITY_DRAFT, &draft).await?;

        self.engine
            .set_task_local_variable(&task.id, vars::TASK_IS_FORM, Value::Bool(true))
            .await
            .map_err(engine_err(format!("While flagging task {}", task.id)))?;

        self.set_variable(workflow_id, vars::PROP_BY_RESOURCE, &*prop).await?;
        prop.clear();

        if let Some(encrypted) = encrypted {
            self.set_variable(workflow_id, vars::ENCRYPTED_PWD, &encrypted).await?;
        }

        tracing::info!(
            workflow_id = %workflow_id,
            task = %task.task_definition_key,
            "Propagation deferred until form submission"
        );
        Ok(true)
    }

    /// Drop consumed intents once propagation was handed back to the caller.
    pub async fn settle(&self, workflow_id: &str, deferred: bool) -> WfResult<()> {
        if deferred || !self.active(workflow_id).await? {
            return Ok(());
        }
        for name in [vars::PROP_BY_RESOURCE, vars::ENCRYPTED_PWD, vars::IDENTITY_PATCH] {
            self.remove_variable(workflow_id, name).await?;
        }
        Ok(())
    }

    /// Remove clear passwords from every process variable that may carry one.
    pub async fn scrub(&self, workflow_id: &str) -> WfResult<()> {
        if !self.active(workflow_id).await? {
            return Ok(());
        }
        let variables = self
            .engine
            .variables(workflow_id)
            .await
            .map_err(engine_err(format!("While reading variables of {}", workflow_id)))?;

        if let Some(mut identity) = lookup::<Identity>(&variables, vars::IDENTITY).ok() {
            if identity.clear_password.take().is_some() {
                self.set_variable(workflow_id, vars::IDENTITY, &identity).await?;
            }
        }
        if let Some(mut draft) = lookup::<IdentityDraft>(&variables, vars::IDENTITY_DRAFT).ok() {
            if draft.password.take().is_some() {
                self.set_variable(workflow_id, vars::IDENTITY_DRAFT, &draft).await?;
            }
        }
        if let Some(mut patch) = lookup::<IdentityPatch>(&variables, vars::IDENTITY_PATCH).ok() {
            if let Some(password) = patch.password.as_mut() {
                if password.value.take().is_some() {
                    self.set_variable(workflow_id, vars::IDENTITY_PATCH, &patch).await?;
                }
            }
        }
        if variables.contains_key(vars::PASSWORD) {
            self.remove_variable(workflow_id, vars::PASSWORD).await?;
        }
        Ok(())
    }

    /// Scrub after an operation on `workflow_id`, whether it succeeded or not.
    /// A failed operation keeps its own error.
    pub async fn scrubbed<T>(&self, workflow_id: &str, outcome: WfResult<T>) -> WfResult<T> {
        match outcome {
            Ok(value) => {
                self.scrub(workflow_id).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(scrub_err) = self.scrub(workflow_id).await {
                    tracing::warn!(
                        workflow_id = %workflow_id,
                        error = %scrub_err,
                        "Could not scrub passwords after a failed operation"
                    );
                }
                Err(err)
            }
        }
    }

    /// Drop the instance and any identity of a creation that failed after its
    /// process was started.
    pub async fn abandon(&self, workflow_id: &str) {
        match self.store.find_by_workflow_id(workflow_id).await {
            Ok(Some(identity)) => {
                if let Err(e) = self.store.delete(identity.key).await {
                    tracing::warn!(workflow_id = %workflow_id, error = %e, "Could not remove identity of failed creation");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(workflow_id = %workflow_id, error = %e, "Could not look up identity of failed creation");
            }
        }
        match self.engine.delete_process_instance(workflow_id).await {
            Ok(()) => tracing::info!(workflow_id = %workflow_id, "Failed creation abandoned"),
            Err(e) => {
                tracing::warn!(workflow_id = %workflow_id, error = %e, "Could not delete process instance of failed creation");
                if let Err(scrub_err) = self.scrub(workflow_id).await {
                    tracing::warn!(workflow_id = %workflow_id, error = %scrub_err, "Could not scrub passwords of failed creation");
                }
            }
        }
    }
}
