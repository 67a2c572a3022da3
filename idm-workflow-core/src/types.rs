//! Domain types exchanged between the lifecycle adapter, its callers and the
//! process engine.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::propagation::PropagationByResource;

pub type IdentityKey = Uuid;

const REDACTED: &str = "[REDACTED]";

// ── Identity ──

/// The managed identity record.
///
/// `password` holds the stored hash; `clear_password` is only populated while a
/// lifecycle step is in flight and is never persisted by a store.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub key: IdentityKey,
    pub username: String,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub suspended: Option<bool>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub resources: BTreeSet<String>,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    pub creation_date: DateTime<Utc>,
    #[serde(default)]
    pub last_change_date: Option<DateTime<Utc>>,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            key: Uuid::new_v4(),
            username: username.into(),
            workflow_id: None,
            status: None,
            suspended: None,
            password: None,
            clear_password: None,
            token: None,
            resources: BTreeSet::new(),
            groups: BTreeSet::new(),
            creation_date: Utc::now(),
            last_change_date: None,
        }
    }

    /// The process instance handle, if one has been assigned and is non-blank.
    pub fn workflow_id(&self) -> Option<&str> {
        self.workflow_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("key", &self.key)
            .field("username", &self.username)
            .field("workflow_id", &self.workflow_id)
            .field("status", &self.status)
            .field("suspended", &self.suspended)
            .field("password", &self.password.as_ref().map(|_| REDACTED))
            .field("clear_password", &self.clear_password.as_ref().map(|_| REDACTED))
            .field("token", &self.token.as_ref().map(|_| REDACTED))
            .field("resources", &self.resources)
            .field("groups", &self.groups)
            .finish()
    }
}

/// Caller-supplied representation of an identity, used to create one and as
/// the in-flight snapshot shown on approval forms.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityDraft {
    #[serde(default)]
    pub key: Option<IdentityKey>,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Ciphertext of the password while an approval form is pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_password: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub resources: BTreeSet<String>,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    #[serde(default)]
    pub creation_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_change_date: Option<DateTime<Utc>>,
}

impl IdentityDraft {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }
}

impl From<&Identity> for IdentityDraft {
    fn from(identity: &Identity) -> Self {
        Self {
            key: Some(identity.key),
            username: identity.username.clone(),
            password: None,
            encrypted_password: None,
            status: identity.status.clone(),
            resources: identity.resources.clone(),
            groups: identity.groups.clone(),
            creation_date: Some(identity.creation_date),
            last_change_date: identity.last_change_date,
        }
    }
}

impl fmt::Debug for IdentityDraft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityDraft")
            .field("key", &self.key)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| REDACTED))
            .field(
                "encrypted_password",
                &self.encrypted_password.as_ref().map(|_| REDACTED),
            )
            .field("status", &self.status)
            .field("resources", &self.resources)
            .field("groups", &self.groups)
            .finish()
    }
}

// ── Patches ──

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordPatch {
    #[serde(default)]
    pub value: Option<String>,
    /// Whether the identity record itself gets the new password.
    #[serde(default)]
    pub on_identity: bool,
    /// External resources the password is pushed to.
    #[serde(default)]
    pub resources: BTreeSet<String>,
}

impl fmt::Debug for PasswordPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordPatch")
            .field("value", &self.value.as_ref().map(|_| REDACTED))
            .field("on_identity", &self.on_identity)
            .field("resources", &self.resources)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPatch {
    pub key: IdentityKey,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<PasswordPatch>,
    #[serde(default)]
    pub resources_to_add: BTreeSet<String>,
    #[serde(default)]
    pub resources_to_remove: BTreeSet<String>,
}

impl IdentityPatch {
    pub fn new(key: IdentityKey) -> Self {
        Self {
            key,
            username: None,
            password: None,
            resources_to_add: BTreeSet::new(),
            resources_to_remove: BTreeSet::new(),
        }
    }
}

// ── Results ──

/// Envelope returned by every lifecycle operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult<T> {
    pub value: T,
    pub propagation: Option<PropagationByResource>,
    /// Activities newly completed by the call that produced this result.
    pub performed_tasks: BTreeSet<String>,
}

impl<T> WorkflowResult<T> {
    pub fn new(
        value: T,
        propagation: Option<PropagationByResource>,
        performed_tasks: BTreeSet<String>,
    ) -> Self {
        Self {
            value,
            propagation,
            performed_tasks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeletionOutcome {
    Deleted,
    /// The process still has active executions, typically an approval.
    PendingApproval,
}

// ── Forms ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormPropertyKind {
    String,
    Long,
    Enum,
    Date,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFormProperty {
    pub id: String,
    pub name: Option<String>,
    pub kind: FormPropertyKind,
    pub value: Option<String>,
    pub readable: bool,
    pub writable: bool,
    pub required: bool,
    #[serde(default)]
    pub date_pattern: Option<String>,
    #[serde(default)]
    pub enum_values: BTreeMap<String, String>,
}

/// One pending human task awaiting input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowForm {
    pub workflow_id: String,
    pub task_id: String,
    pub task_key: String,
    pub form_key: Option<String>,
    pub username: Option<String>,
    pub owner: Option<String>,
    pub create_time: DateTime<Utc>,
    pub due_date: Option<DateTime<Utc>>,
    pub properties: Vec<WorkflowFormProperty>,
    #[serde(default)]
    pub identity_draft: Option<IdentityDraft>,
    #[serde(default)]
    pub identity_patch: Option<IdentityPatch>,
}

impl WorkflowForm {
    pub fn property(&self, id: &str) -> Option<&WorkflowFormProperty> {
        self.properties.iter().find(|p| p.id == id)
    }

    /// Set the value of a property; returns false when no such property exists.
    pub fn set_value(&mut self, id: &str, value: impl Into<String>) -> bool {
        match self.properties.iter_mut().find(|p| p.id == id) {
            Some(prop) => {
                prop.value = Some(value.into());
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormPage {
    pub total: usize,
    pub forms: Vec<WorkflowForm>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderByClause {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl OrderByClause {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

// ── Definitions ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionFormat {
    /// BPMN 2.0 XML.
    Xml,
    /// Editor JSON model.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDefinitionRef {
    pub key: String,
    pub name: Option<String>,
    pub version: u32,
    /// True for the default lifecycle process.
    pub main: bool,
    pub model_id: Option<String>,
}
