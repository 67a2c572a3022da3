//! Identity lifecycle driven through a process engine.
//!
//! Each operation advances one named transition of the lifecycle process,
//! adopts what the process changed on the identity, derives the status from the
//! pending task and persists the result. Propagation intent is returned to the
//! caller, or parked in the process while an approval form is pending.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use crate::config::WorkflowConfig;
use crate::crypto::PasswordCipher;
use crate::definitions::DefinitionManager;
use crate::engine::ProcessEngine;
use crate::error::{engine_err, WfResult, WorkflowError};
use crate::forms::FormGateway;
use crate::ports::{ActorContext, IdentityStore};
use crate::propagation::{PropagationByResource, ResourceOperation};
use crate::runtime::{require_workflow_id, ActivitySnapshot, WorkflowRuntime};
use crate::types::{
    DeletionOutcome, Identity, IdentityDraft, IdentityKey, IdentityPatch, WorkflowResult,
};
use crate::vars::{self, Variables};

pub struct LifecycleAdapter {
    runtime: Arc<WorkflowRuntime>,
}

impl LifecycleAdapter {
    pub fn new(
        engine: Arc<dyn ProcessEngine>,
        store: Arc<dyn IdentityStore>,
        actor: Arc<dyn ActorContext>,
        config: WorkflowConfig,
    ) -> Result<Self> {
        let cipher = config.password_cipher()?;
        Ok(Self::with_cipher(engine, store, actor, config, cipher))
    }

    pub fn with_cipher(
        engine: Arc<dyn ProcessEngine>,
        store: Arc<dyn IdentityStore>,
        actor: Arc<dyn ActorContext>,
        config: WorkflowConfig,
        cipher: PasswordCipher,
    ) -> Self {
        Self {
            runtime: Arc::new(WorkflowRuntime {
                engine,
                store,
                actor,
                cipher,
                config,
            }),
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.runtime.config
    }

    /// Form gateway sharing this adapter's collaborators.
    pub fn forms(&self) -> FormGateway {
        FormGateway::new(self.runtime.clone())
    }

    pub fn definitions(&self) -> DefinitionManager {
        DefinitionManager::new(self.runtime.engine.clone(), self.runtime.config.clone())
    }

    // ── create ──

    /// Start a lifecycle process for `draft` and persist the identity it
    /// produces. Returns the new key and the propagate-enable flag.
    ///
    /// When anything fails after the process started, the instance and any
    /// identity saved for it are removed again.
    pub async fn create(
        &self,
        draft: IdentityDraft,
        disable_password_check: bool,
        enabled: Option<bool>,
        store_password: bool,
    ) -> WfResult<WorkflowResult<(IdentityKey, Option<bool>)>> {
        let rt = &self.runtime;
        let process_key = rt.config.process_key.clone();
        let password = draft.password.clone();

        let mut start = Variables::new();
        start.insert(vars::WF_EXECUTOR.into(), json!(rt.actor.current_actor()));
        start.insert(vars::ENABLED.into(), json!(enabled));
        start.insert(vars::STORE_PASSWORD.into(), json!(store_password));
        start.insert(
            vars::IDENTITY_DRAFT.into(),
            serde_json::to_value(&draft).map_err(|e| {
                WorkflowError::workflow("While serializing the identity draft", e.into())
            })?,
        );

        let workflow_id = rt
            .engine
            .start_process(&process_key, start)
            .await
            .map_err(engine_err(format!("While starting {}", process_key)))?;

        match self
            .register(&workflow_id, disable_password_check, enabled, password)
            .await
        {
            Ok(created) => Ok(created),
            Err(err) => {
                rt.abandon(&workflow_id).await;
                Err(err)
            }
        }
    }

    async fn register(
        &self,
        workflow_id: &str,
        disable_password_check: bool,
        enabled: Option<bool>,
        password: Option<String>,
    ) -> WfResult<WorkflowResult<(IdentityKey, Option<bool>)>> {
        let rt = &self.runtime;
        let mut identity: Identity = rt
            .variable(workflow_id, vars::IDENTITY)
            .await?
            .require(vars::IDENTITY)
            .map_err(engine_err(format!("While creating identity in {}", workflow_id)))?;
        identity.workflow_id = Some(workflow_id.to_string());
        if disable_password_check {
            identity.clear_password = None;
        }

        rt.update_status(&mut identity).await?;
        let saved = rt.save(&identity).await?;
        tracing::info!(
            key = %saved.key,
            workflow_id = %workflow_id,
            status = saved.status.as_deref().unwrap_or("-"),
            "Identity created"
        );

        let propagate_enable = rt
            .variable::<bool>(workflow_id, vars::PROPAGATE_ENABLE)
            .await?
            .ok()
            .or(enabled);

        let mut prop = PropagationByResource::new();
        prop.set(ResourceOperation::Create, rt.resources_of(&saved).await?);
        let deferred = rt.save_for_form_submit(&saved, password, &mut prop).await?;
        rt.settle(workflow_id, deferred).await?;
        rt.scrub(workflow_id).await?;

        let performed = rt.snapshot(workflow_id).await?.activity_ids().clone();
        Ok(WorkflowResult::new(
            (saved.key, propagate_enable),
            Some(prop),
            performed,
        ))
    }

    // ── simple transitions ──

    /// Advance `task`, adopt the process changes and persist the identity.
    async fn transition(
        &self,
        mut identity: Identity,
        task: &str,
        extra: Variables,
    ) -> WfResult<(Identity, BTreeSet<String>)> {
        let rt = &self.runtime;
        let performed = rt.execute_task(&identity, task, extra).await?;
        let saved = rt.finish(&mut identity).await?;
        tracing::info!(key = %saved.key, task = %task, status = saved.status.as_deref().unwrap_or("-"), "Transition done");
        Ok((saved, performed))
    }

    async fn plain_transition(
        &self,
        key: IdentityKey,
        task: &str,
        extra: Variables,
    ) -> WfResult<WorkflowResult<IdentityKey>> {
        let rt = &self.runtime;
        let identity = rt.load(key).await?;
        let workflow_id = require_workflow_id(&identity)?.to_string();
        let outcome = self.transition(identity, task, extra).await;
        let (saved, performed) = rt.scrubbed(&workflow_id, outcome).await?;
        Ok(WorkflowResult::new(saved.key, None, performed))
    }

    pub async fn activate(
        &self,
        key: IdentityKey,
        token: Option<String>,
    ) -> WfResult<WorkflowResult<IdentityKey>> {
        let mut extra = Variables::new();
        extra.insert(vars::TOKEN.into(), json!(token));
        self.plain_transition(key, "activate", extra).await
    }

    pub async fn suspend(&self, key: IdentityKey) -> WfResult<WorkflowResult<IdentityKey>> {
        self.plain_transition(key, "suspend", Variables::new()).await
    }

    pub async fn reactivate(&self, key: IdentityKey) -> WfResult<WorkflowResult<IdentityKey>> {
        self.plain_transition(key, "reactivate", Variables::new()).await
    }

    // ── update ──

    pub async fn update(
        &self,
        patch: IdentityPatch,
    ) -> WfResult<WorkflowResult<(IdentityPatch, Option<bool>)>> {
        let rt = &self.runtime;
        let identity = rt.load(patch.key).await?;
        let workflow_id = require_workflow_id(&identity)?.to_string();
        let outcome = self.apply_update(identity, patch).await;
        rt.scrubbed(&workflow_id, outcome).await
    }

    async fn apply_update(
        &self,
        identity: Identity,
        patch: IdentityPatch,
    ) -> WfResult<WorkflowResult<(IdentityPatch, Option<bool>)>> {
        let rt = &self.runtime;
        let mut extra = Variables::new();
        extra.insert(
            vars::IDENTITY_PATCH.into(),
            serde_json::to_value(&patch).map_err(|e| {
                WorkflowError::workflow("While serializing the identity patch", e.into())
            })?,
        );
        let (saved, performed) = self.transition(identity, "update", extra).await?;
        let workflow_id = require_workflow_id(&saved)?;

        let mut prop: PropagationByResource = rt
            .variable(workflow_id, vars::PROP_BY_RESOURCE)
            .await?
            .optional(vars::PROP_BY_RESOURCE)
            .map_err(engine_err("While reading propagation intent"))?
            .unwrap_or_default();
        let updated: IdentityPatch = rt
            .variable(workflow_id, vars::IDENTITY_PATCH)
            .await?
            .optional(vars::IDENTITY_PATCH)
            .map_err(engine_err("While reading the identity patch"))?
            .unwrap_or(patch);
        let propagate_enable = rt
            .variable::<bool>(workflow_id, vars::PROPAGATE_ENABLE)
            .await?
            .ok();

        let password = updated.password.as_ref().and_then(|p| p.value.clone());
        let deferred = rt.save_for_form_submit(&saved, password, &mut prop).await?;
        rt.settle(workflow_id, deferred).await?;

        Ok(WorkflowResult::new(
            (updated, propagate_enable),
            Some(prop),
            performed,
        ))
    }

    // ── password reset ──

    pub async fn request_password_reset(
        &self,
        key: IdentityKey,
    ) -> WfResult<WorkflowResult<IdentityKey>> {
        let mut extra = Variables::new();
        extra.insert(vars::EVENT.into(), json!("requestPasswordReset"));
        self.plain_transition(key, "requestPasswordReset", extra).await
    }

    /// Returns the patch and propagate-enable flag computed by the process.
    pub async fn confirm_password_reset(
        &self,
        key: IdentityKey,
        token: &str,
        password: &str,
    ) -> WfResult<WorkflowResult<(Option<IdentityPatch>, Option<bool>)>> {
        let rt = &self.runtime;
        let identity = rt.load(key).await?;
        let workflow_id = require_workflow_id(&identity)?.to_string();
        let outcome = self.apply_password_reset(identity, token, password).await;
        rt.scrubbed(&workflow_id, outcome).await
    }

    async fn apply_password_reset(
        &self,
        identity: Identity,
        token: &str,
        password: &str,
    ) -> WfResult<WorkflowResult<(Option<IdentityPatch>, Option<bool>)>> {
        let rt = &self.runtime;
        let mut extra = Variables::new();
        extra.insert(vars::EVENT.into(), json!("confirmPasswordReset"));
        extra.insert(vars::TOKEN.into(), json!(token));
        extra.insert(vars::PASSWORD.into(), json!(password));
        let (saved, performed) = self
            .transition(identity, "confirmPasswordReset", extra)
            .await?;
        let workflow_id = require_workflow_id(&saved)?;

        let patch: Option<IdentityPatch> = rt
            .variable(workflow_id, vars::IDENTITY_PATCH)
            .await?
            .optional(vars::IDENTITY_PATCH)
            .map_err(engine_err("While reading the identity patch"))?;
        let prop: Option<PropagationByResource> = rt
            .variable(workflow_id, vars::PROP_BY_RESOURCE)
            .await?
            .optional(vars::PROP_BY_RESOURCE)
            .map_err(engine_err("While reading propagation intent"))?;
        let propagate_enable = rt
            .variable::<bool>(workflow_id, vars::PROPAGATE_ENABLE)
            .await?
            .ok();

        rt.settle(workflow_id, false).await?;
        Ok(WorkflowResult::new((patch, propagate_enable), prop, performed))
    }

    // ── delete ──

    /// Runs the delete transition. The identity is removed only once the
    /// process has ended; a pending approval keeps it in place.
    pub async fn delete(&self, key: IdentityKey) -> WfResult<WorkflowResult<DeletionOutcome>> {
        let rt = &self.runtime;
        let mut identity = rt.load(key).await?;
        let performed = rt.execute_task(&identity, "delete", Variables::new()).await?;
        rt.adopt(&mut identity).await?;
        let workflow_id = require_workflow_id(&identity)?.to_string();

        let mut prop = PropagationByResource::new();
        prop.set(ResourceOperation::Delete, rt.resources_of(&identity).await?);
        let deferred = rt.save_for_form_submit(&identity, None, &mut prop).await?;

        let outcome = if rt.active(&workflow_id).await? {
            rt.update_status(&mut identity).await?;
            rt.save(&identity).await?;
            rt.settle(&workflow_id, deferred).await?;
            rt.scrub(&workflow_id).await?;
            tracing::info!(key = %key, workflow_id = %workflow_id, "Deletion awaiting approval");
            DeletionOutcome::PendingApproval
        } else {
            rt.store
                .delete(key)
                .await
                .map_err(engine_err(format!("While deleting identity {}", key)))?;
            rt.engine
                .purge_history(&workflow_id)
                .await
                .map_err(engine_err(format!("While purging history of {}", workflow_id)))?;
            tracing::info!(key = %key, workflow_id = %workflow_id, "Identity deleted");
            DeletionOutcome::Deleted
        };

        Ok(WorkflowResult::new(outcome, Some(prop), performed))
    }

    // ── generic ──

    /// Advance an arbitrary named task with `draft` as the draft variable.
    pub async fn execute(
        &self,
        draft: IdentityDraft,
        task: &str,
    ) -> WfResult<WorkflowResult<IdentityKey>> {
        let rt = &self.runtime;
        let key = draft
            .key
            .ok_or_else(|| WorkflowError::Validation("identity draft has no key".into()))?;
        let identity = rt.load(key).await?;
        let workflow_id = require_workflow_id(&identity)?.to_string();
        let outcome = self.apply_draft(identity, draft, task).await;
        rt.scrubbed(&workflow_id, outcome).await
    }

    async fn apply_draft(
        &self,
        identity: Identity,
        draft: IdentityDraft,
        task: &str,
    ) -> WfResult<WorkflowResult<IdentityKey>> {
        let rt = &self.runtime;
        let password = draft.password.clone();
        let mut extra = Variables::new();
        extra.insert(
            vars::IDENTITY_DRAFT.into(),
            serde_json::to_value(&draft).map_err(|e| {
                WorkflowError::workflow("While serializing the identity draft", e.into())
            })?,
        );
        let (saved, performed) = self.transition(identity, task, extra).await?;
        let workflow_id = require_workflow_id(&saved)?;

        let mut prop: PropagationByResource = rt
            .variable(workflow_id, vars::PROP_BY_RESOURCE)
            .await?
            .optional(vars::PROP_BY_RESOURCE)
            .map_err(engine_err("While reading propagation intent"))?
            .unwrap_or_default();
        let deferred = rt.save_for_form_submit(&saved, password, &mut prop).await?;
        rt.settle(workflow_id, deferred).await?;
        Ok(WorkflowResult::new(saved.key, Some(prop), performed))
    }

    // ── introspection ──

    /// Node ids reachable from the identity's pending task.
    pub async fn available_tasks(&self, key: IdentityKey) -> WfResult<BTreeSet<String>> {
        let rt = &self.runtime;
        let identity = rt.load(key).await?;
        let workflow_id = require_workflow_id(&identity)?;
        let Some(task) = rt.single_task(workflow_id).await? else {
            return Ok(BTreeSet::new());
        };
        let model = rt
            .engine
            .process_model(&task.process_definition_id)
            .await
            .map_err(engine_err("While loading the process model"))?
            .ok_or_else(|| {
                WorkflowError::NotFound(format!(
                    "Process definition {}",
                    task.process_definition_id
                ))
            })?;
        Ok(model.next_tasks(&task.task_definition_key))
    }

    pub async fn activity_snapshot(&self, key: IdentityKey) -> WfResult<ActivitySnapshot> {
        let identity = self.runtime.load(key).await?;
        let workflow_id = require_workflow_id(&identity)?;
        self.runtime.snapshot(workflow_id).await
    }
}
