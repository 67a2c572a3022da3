//! Service task delegates bound by `${name}` expressions.
//!
//! Delegates work on process variables only. The identity travels through the
//! process as the `identity` variable; the adapter adopts it after each call.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::crypto::digest_password;
use crate::error::DomainViolation;
use crate::propagation::{PropagationByResource, ResourceOperation};
use crate::types::{Identity, IdentityDraft, IdentityPatch, PasswordPatch};
use crate::vars::{self, lookup, VarLookup, Variables};

/// What a delegate sees while a service task runs.
pub struct ExecutionContext<'a> {
    pub instance_id: &'a str,
    pub activity_id: &'a str,
    pub variables: &'a mut Variables,
}

impl ExecutionContext<'_> {
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> VarLookup<T> {
        lookup(&*self.variables, name)
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("Failed to serialize variable '{}'", name))?;
        self.variables.insert(name.to_string(), value);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.variables.remove(name)
    }

    fn identity(&self) -> Result<Identity> {
        self.get(vars::IDENTITY).require(vars::IDENTITY)
    }
}

pub trait TaskDelegate: Send + Sync {
    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<()>;
}

/// Delegates referenced by the bundled lifecycle processes.
pub fn lifecycle_delegates() -> HashMap<String, Arc<dyn TaskDelegate>> {
    let mut map: HashMap<String, Arc<dyn TaskDelegate>> = HashMap::new();
    map.insert("create".into(), Arc::new(Create));
    map.insert("activate".into(), Arc::new(Activate));
    map.insert("generateToken".into(), Arc::new(GenerateToken));
    map.insert("update".into(), Arc::new(Update));
    map.insert("suspend".into(), Arc::new(Suspend));
    map.insert("reactivate".into(), Arc::new(Reactivate));
    map.insert("passwordReset".into(), Arc::new(PasswordReset));
    map.insert("reject".into(), Arc::new(Reject));
    map.insert("delete".into(), Arc::new(Delete));
    map
}

// ── create ──

/// Materializes the identity from the `identityDraft` variable.
pub struct Create;

impl TaskDelegate for Create {
    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        let draft: IdentityDraft = ctx.get(vars::IDENTITY_DRAFT).require(vars::IDENTITY_DRAFT)?;
        let username = draft.username.trim();
        if username.is_empty() {
            return Err(DomainViolation::InvalidEntity("username must not be blank".into()).into());
        }

        let mut identity = Identity::new(username);
        if let Some(key) = draft.key {
            identity.key = key;
        }
        if let Some(created) = draft.creation_date {
            identity.creation_date = created;
        }
        identity.workflow_id = Some(ctx.instance_id.to_string());
        identity.resources = draft.resources.clone();
        identity.groups = draft.groups.clone();

        let store_password = ctx.get::<bool>(vars::STORE_PASSWORD).ok().unwrap_or(true);
        if let Some(clear) = draft.password.as_deref().filter(|p| !p.is_empty()) {
            identity.clear_password = Some(clear.to_string());
            if store_password {
                identity.password = Some(digest_password(clear));
            }
        }

        tracing::debug!(instance = %ctx.instance_id, username = %identity.username, "Identity created");
        ctx.set(vars::USERNAME, &identity.username)?;
        ctx.set(vars::IDENTITY, &identity)
    }
}

// ── activation and tokens ──

pub struct GenerateToken;

impl TaskDelegate for GenerateToken {
    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        let mut identity = ctx.identity()?;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        identity.token = Some(hex::encode(bytes));
        ctx.set(vars::IDENTITY, &identity)
    }
}

fn check_token(identity: &Identity, ctx: &ExecutionContext<'_>) -> Result<()> {
    let Some(expected) = identity.token.as_deref() else {
        return Ok(());
    };
    let supplied: Option<String> = ctx.get(vars::TOKEN).ok();
    if supplied.as_deref() != Some(expected) {
        return Err(DomainViolation::Client(format!(
            "wrong token provided for '{}'",
            identity.username
        ))
        .into());
    }
    Ok(())
}

pub struct Activate;

impl TaskDelegate for Activate {
    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        let mut identity = ctx.identity()?;
        check_token(&identity, ctx)?;
        identity.token = None;
        identity.suspended = Some(false);
        ctx.set(vars::PROPAGATE_ENABLE, &true)?;
        ctx.set(vars::IDENTITY, &identity)
    }
}

// ── update ──

/// Applies the `identityPatch` variable and accumulates propagation intent.
pub struct Update;

impl TaskDelegate for Update {
    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        let mut identity = ctx.identity()?;
        let mut patch: IdentityPatch = ctx.get(vars::IDENTITY_PATCH).require(vars::IDENTITY_PATCH)?;
        if patch.key != identity.key {
            return Err(DomainViolation::Client(format!(
                "patch for {} applied to identity {}",
                patch.key, identity.key
            ))
            .into());
        }

        let before = identity.resources.clone();
        let mut renamed = false;
        if let Some(username) = patch.username.as_deref().map(str::trim) {
            if username.is_empty() {
                return Err(DomainViolation::InvalidEntity("username must not be blank".into()).into());
            }
            if username != identity.username {
                identity.username = username.to_string();
                renamed = true;
            }
        }
        for resource in &patch.resources_to_remove {
            identity.resources.remove(resource);
        }
        identity.resources.extend(patch.resources_to_add.iter().cloned());

        let mut delta = PropagationByResource::new();
        delta.add_all(ResourceOperation::Create, identity.resources.difference(&before).cloned());
        delta.add_all(ResourceOperation::Delete, before.difference(&identity.resources).cloned());
        let kept: BTreeSet<String> = before.intersection(&identity.resources).cloned().collect();
        if renamed {
            delta.add_all(ResourceOperation::Update, kept.iter().cloned());
        }

        if let Some(password) = patch.password.as_mut() {
            if password.resources.is_empty() {
                password.resources = identity.resources.clone();
            }
            if let Some(clear) = password.value.as_deref().filter(|v| !v.is_empty()) {
                if password.on_identity {
                    identity.clear_password = Some(clear.to_string());
                    identity.password = Some(digest_password(clear));
                }
                delta.add_all(
                    ResourceOperation::Update,
                    password.resources.intersection(&kept).cloned(),
                );
            }
        }

        let mut accumulated: PropagationByResource = ctx
            .get(vars::PROP_BY_RESOURCE)
            .optional(vars::PROP_BY_RESOURCE)?
            .unwrap_or_default();
        accumulated.merge(&delta);

        ctx.set(vars::IDENTITY_PATCH, &patch)?;
        ctx.set(vars::PROP_BY_RESOURCE, &accumulated)?;
        ctx.set(vars::IDENTITY, &identity)
    }
}

// ── suspension ──

pub struct Suspend;

impl TaskDelegate for Suspend {
    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        let mut identity = ctx.identity()?;
        identity.suspended = Some(true);
        ctx.set(vars::PROPAGATE_ENABLE, &false)?;
        ctx.set(vars::IDENTITY, &identity)
    }
}

pub struct Reactivate;

impl TaskDelegate for Reactivate {
    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        let mut identity = ctx.identity()?;
        identity.suspended = Some(false);
        ctx.set(vars::PROPAGATE_ENABLE, &true)?;
        ctx.set(vars::IDENTITY, &identity)
    }
}

// ── password reset ──

/// Confirms a reset: verifies the token and turns the `password` variable into
/// a patch for the identity and all of its resources.
pub struct PasswordReset;

impl TaskDelegate for PasswordReset {
    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        let mut identity = ctx.identity()?;
        if identity.token.is_none() {
            return Err(DomainViolation::Client(format!(
                "no password reset pending for '{}'",
                identity.username
            ))
            .into());
        }
        check_token(&identity, ctx)?;

        let password: String = match ctx.get(vars::PASSWORD) {
            VarLookup::Present(p) => p,
            _ => return Err(DomainViolation::Client("new password is required".into()).into()),
        };
        identity.token = None;
        identity.clear_password = Some(password.clone());
        identity.password = Some(digest_password(&password));

        let mut patch = IdentityPatch::new(identity.key);
        patch.password = Some(PasswordPatch {
            value: Some(password),
            on_identity: true,
            resources: identity.resources.clone(),
        });
        let mut prop = PropagationByResource::new();
        prop.set(ResourceOperation::Update, identity.resources.iter().cloned());

        ctx.set(vars::IDENTITY_PATCH, &patch)?;
        ctx.set(vars::PROP_BY_RESOURCE, &prop)?;
        ctx.set(vars::IDENTITY, &identity)
    }
}

// ── approval outcomes ──

/// Drops any deferred propagation and password once a request is rejected.
pub struct Reject;

impl TaskDelegate for Reject {
    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        let reason: Option<String> = ctx.get(vars::REJECT_REASON).ok();
        tracing::info!(
            instance = %ctx.instance_id,
            reason = reason.as_deref().unwrap_or("-"),
            "Request rejected"
        );
        ctx.set(vars::PROP_BY_RESOURCE, &PropagationByResource::new())?;
        ctx.remove(vars::ENCRYPTED_PWD);
        Ok(())
    }
}

pub struct Delete;

impl TaskDelegate for Delete {
    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        let mut identity = ctx.identity()?;
        identity.token = None;
        identity.clear_password = None;
        tracing::debug!(instance = %ctx.instance_id, username = %identity.username, "Identity deleted");
        ctx.set(vars::IDENTITY, &identity)
    }
}
