//! Per-operation sets of resource keys that must receive a propagated change.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceOperation {
    Create,
    Update,
    Delete,
}

impl ResourceOperation {
    pub const ALL: [ResourceOperation; 3] = [Self::Create, Self::Update, Self::Delete];
}

/// Propagation intent accumulated during one or more lifecycle steps.
///
/// The same resource key may sit under several operations; callers resolve
/// precedence when executing propagation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationByResource {
    #[serde(rename = "CREATE", default)]
    to_create: BTreeSet<String>,
    #[serde(rename = "UPDATE", default)]
    to_update: BTreeSet<String>,
    #[serde(rename = "DELETE", default)]
    to_delete: BTreeSet<String>,
}

impl PropagationByResource {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, op: ResourceOperation) -> &BTreeSet<String> {
        match op {
            ResourceOperation::Create => &self.to_create,
            ResourceOperation::Update => &self.to_update,
            ResourceOperation::Delete => &self.to_delete,
        }
    }

    fn slot_mut(&mut self, op: ResourceOperation) -> &mut BTreeSet<String> {
        match op {
            ResourceOperation::Create => &mut self.to_create,
            ResourceOperation::Update => &mut self.to_update,
            ResourceOperation::Delete => &mut self.to_delete,
        }
    }

    /// Replace the set for `op`.
    pub fn set<I, S>(&mut self, op: ResourceOperation, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.slot_mut(op) = keys.into_iter().map(Into::into).collect();
    }

    pub fn get(&self, op: ResourceOperation) -> &BTreeSet<String> {
        self.slot(op)
    }

    /// Returns true if the key was not already present under `op`.
    pub fn add(&mut self, op: ResourceOperation, key: impl Into<String>) -> bool {
        self.slot_mut(op).insert(key.into())
    }

    pub fn add_all<I, S>(&mut self, op: ResourceOperation, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.slot_mut(op).extend(keys.into_iter().map(Into::into));
    }

    pub fn remove(&mut self, op: ResourceOperation, key: &str) -> bool {
        self.slot_mut(op).remove(key)
    }

    pub fn contains(&self, op: ResourceOperation, key: &str) -> bool {
        self.slot(op).contains(key)
    }

    pub fn clear(&mut self) {
        self.to_create.clear();
        self.to_update.clear();
        self.to_delete.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    /// Union `other` into `self`, per operation.
    pub fn merge(&mut self, other: &PropagationByResource) {
        for op in ResourceOperation::ALL {
            self.add_all(op, other.get(op).iter().cloned());
        }
    }

    /// Every resource key mentioned under any operation.
    pub fn resources(&self) -> BTreeSet<String> {
        ResourceOperation::ALL
            .iter()
            .flat_map(|op| self.get(*op).iter().cloned())
            .collect()
    }
}
