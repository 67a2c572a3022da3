//! Collaborators consumed by the lifecycle adapter: identity persistence and
//! the current actor.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::error::DomainViolation;
use crate::types::{Identity, IdentityKey};

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_by_key(&self, key: IdentityKey) -> Result<Option<Identity>>;
    async fn find_by_workflow_id(&self, workflow_id: &str) -> Result<Option<Identity>>;
    async fn find_by_username(&self, username: &str) -> Result<Option<Identity>>;
    /// Persist and return the stored form; the clear password is never kept.
    async fn save(&self, identity: &Identity) -> Result<Identity>;
    async fn delete(&self, key: IdentityKey) -> Result<()>;
    /// Resources assigned directly or through group membership.
    async fn find_all_resource_keys(&self, identity: &Identity) -> Result<BTreeSet<String>>;
    async fn find_all_group_names(&self, identity: &Identity) -> Result<BTreeSet<String>>;
}

pub trait ActorContext: Send + Sync {
    fn current_actor(&self) -> String;
}

/// Actor fixed at construction.
#[derive(Debug, Clone)]
pub struct FixedActor(String);

impl FixedActor {
    pub fn new(username: impl Into<String>) -> Self {
        Self(username.into())
    }
}

impl ActorContext for FixedActor {
    fn current_actor(&self) -> String {
        self.0.clone()
    }
}

// ── In-memory store ──

pub struct MemoryIdentityStore {
    identities: RwLock<HashMap<IdentityKey, Identity>>,
    group_resources: RwLock<HashMap<String, BTreeSet<String>>>,
    password_min_length: Option<usize>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self {
            identities: RwLock::new(HashMap::new()),
            group_resources: RwLock::new(HashMap::new()),
            password_min_length: None,
        }
    }

    /// Reject clear passwords shorter than `len` on save.
    pub fn with_password_min_length(mut self, len: usize) -> Self {
        self.password_min_length = Some(len);
        self
    }

    /// Resources granted to every member of `group`.
    pub fn assign_group_resources<I, S>(&self, group: &str, resources: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut map = self
            .group_resources
            .write()
            .map_err(|e| anyhow!("Lock: {}", e))?;
        map.entry(group.to_string())
            .or_default()
            .extend(resources.into_iter().map(Into::into));
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        let map = self.identities.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(map.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn check(&self, identity: &Identity, existing: &HashMap<IdentityKey, Identity>) -> Result<()> {
        if identity.username.trim().is_empty() {
            return Err(DomainViolation::InvalidEntity("username must not be blank".into()).into());
        }
        if existing
            .values()
            .any(|other| other.key != identity.key && other.username == identity.username)
        {
            return Err(DomainViolation::InvalidEntity(format!(
                "username '{}' is already taken",
                identity.username
            ))
            .into());
        }
        if let (Some(min), Some(clear)) = (self.password_min_length, &identity.clear_password) {
            if clear.chars().count() < min {
                return Err(DomainViolation::InvalidEntity(format!(
                    "password must be at least {} characters",
                    min
                ))
                .into());
            }
        }
        Ok(())
    }
}

impl Default for MemoryIdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find_by_key(&self, key: IdentityKey) -> Result<Option<Identity>> {
        let map = self.identities.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(map.get(&key).cloned())
    }

    async fn find_by_workflow_id(&self, workflow_id: &str) -> Result<Option<Identity>> {
        let map = self.identities.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(map
            .values()
            .find(|i| i.workflow_id.as_deref() == Some(workflow_id))
            .cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Identity>> {
        let map = self.identities.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(map.values().find(|i| i.username == username).cloned())
    }

    async fn save(&self, identity: &Identity) -> Result<Identity> {
        let mut map = self.identities.write().map_err(|e| anyhow!("Lock: {}", e))?;
        self.check(identity, &map)?;

        let mut stored = identity.clone();
        stored.clear_password = None;
        stored.last_change_date = Some(Utc::now());
        map.insert(stored.key, stored.clone());
        tracing::debug!(key = %stored.key, username = %stored.username, "Identity saved");
        Ok(stored)
    }

    async fn delete(&self, key: IdentityKey) -> Result<()> {
        let mut map = self.identities.write().map_err(|e| anyhow!("Lock: {}", e))?;
        map.remove(&key);
        Ok(())
    }

    async fn find_all_resource_keys(&self, identity: &Identity) -> Result<BTreeSet<String>> {
        let groups = self
            .group_resources
            .read()
            .map_err(|e| anyhow!("Lock: {}", e))?;
        let mut resources = identity.resources.clone();
        for group in &identity.groups {
            if let Some(granted) = groups.get(group) {
                resources.extend(granted.iter().cloned());
            }
        }
        Ok(resources)
    }

    async fn find_all_group_names(&self, identity: &Identity) -> Result<BTreeSet<String>> {
        Ok(identity.groups.clone())
    }
}
