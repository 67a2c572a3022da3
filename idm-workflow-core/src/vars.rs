//! Well-known process variable names and typed access to variable values.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A process variable bag.
pub type Variables = BTreeMap<String, Value>;

pub const IDENTITY: &str = "identity";
pub const IDENTITY_DRAFT: &str = "identityDraft";
pub const IDENTITY_PATCH: &str = "identityPatch";
pub const WF_EXECUTOR: &str = "wfExecutor";
pub const TASK: &str = "task";
pub const TOKEN: &str = "token";
pub const PASSWORD: &str = "password";
pub const ENABLED: &str = "enabled";
pub const STORE_PASSWORD: &str = "storePassword";
pub const PROP_BY_RESOURCE: &str = "propByResource";
pub const PROPAGATE_ENABLE: &str = "propagateEnable";
pub const ENCRYPTED_PWD: &str = "encryptedPwd";
pub const TASK_IS_FORM: &str = "taskIsForm";
pub const FORM_SUBMITTER: &str = "formSubmitter";
pub const EVENT: &str = "event";
pub const USERNAME: &str = "username";
pub const REJECT_REASON: &str = "rejectReason";

/// Result of reading a variable with an expected shape.
#[derive(Debug, Clone, PartialEq)]
pub enum VarLookup<T> {
    Present(T),
    /// Absent or JSON null.
    Missing,
    /// Present but not deserializable as `T`.
    WrongShape(String),
}

impl<T: DeserializeOwned> VarLookup<T> {
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Missing,
            Some(v) => match T::deserialize(v) {
                Ok(typed) => Self::Present(typed),
                Err(e) => Self::WrongShape(e.to_string()),
            },
        }
    }

    pub fn from_owned(value: Option<Value>) -> Self {
        Self::from_value(value.as_ref())
    }
}

impl<T> VarLookup<T> {
    /// The value if present; a wrong shape is treated as absent.
    pub fn ok(self) -> Option<T> {
        match self {
            Self::Present(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    /// The value, failing on anything else.
    pub fn require(self, name: &str) -> Result<T> {
        match self {
            Self::Present(v) => Ok(v),
            Self::Missing => Err(anyhow!("process variable '{}' is not set", name)),
            Self::WrongShape(reason) => Err(anyhow!(
                "process variable '{}' has unexpected shape: {}",
                name,
                reason
            )),
        }
    }

    /// Like [`VarLookup::ok`] but lets a wrong shape surface as an error.
    pub fn optional(self, name: &str) -> Result<Option<T>> {
        match self {
            Self::Present(v) => Ok(Some(v)),
            Self::Missing => Ok(None),
            Self::WrongShape(reason) => Err(anyhow!(
                "process variable '{}' has unexpected shape: {}",
                name,
                reason
            )),
        }
    }
}

/// Typed read from a variable bag.
pub fn lookup<T: DeserializeOwned>(vars: &Variables, name: &str) -> VarLookup<T> {
    VarLookup::from_value(vars.get(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::{PropagationByResource, ResourceOperation};
    use serde_json::json;

    #[test]
    fn lookup_distinguishes_missing_and_wrong_shape() {
        let mut vars = Variables::new();
        vars.insert(ENABLED.into(), json!(true));
        vars.insert(TOKEN.into(), Value::Null);
        vars.insert(PROP_BY_RESOURCE.into(), json!("not a map"));

        assert_eq!(lookup::<bool>(&vars, ENABLED), VarLookup::Present(true));
        assert_eq!(lookup::<String>(&vars, TOKEN), VarLookup::Missing);
        assert_eq!(lookup::<String>(&vars, PASSWORD), VarLookup::Missing);
        assert!(matches!(
            lookup::<PropagationByResource>(&vars, PROP_BY_RESOURCE),
            VarLookup::WrongShape(_)
        ));
    }

    #[test]
    fn require_and_optional() {
        let mut vars = Variables::new();
        vars.insert(
            PROP_BY_RESOURCE.into(),
            json!({"CREATE": ["ldap"], "UPDATE": [], "DELETE": []}),
        );
        let prop: PropagationByResource = lookup(&vars, PROP_BY_RESOURCE)
            .require(PROP_BY_RESOURCE)
            .unwrap();
        assert!(prop.contains(ResourceOperation::Create, "ldap"));

        let err = lookup::<String>(&vars, PASSWORD).require(PASSWORD).unwrap_err();
        assert!(err.to_string().contains("'password' is not set"));

        assert_eq!(lookup::<String>(&vars, PASSWORD).optional(PASSWORD).unwrap(), None);
        assert!(lookup::<bool>(&vars, PROP_BY_RESOURCE)
            .optional(PROP_BY_RESOURCE)
            .is_err());
    }
}
