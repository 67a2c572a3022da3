use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::crypto::PasswordCipher;

pub const DEFAULT_PROCESS_KEY: &str = "userWorkflow";
pub const DEFAULT_ADMIN_USERNAME: &str = "admin";

/// What to do when a process instance does not have exactly one pending task
/// after a transition or while deriving status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCardinalityPolicy {
    /// Log a warning and carry on without advancing or touching status.
    #[default]
    Warn,
    /// Abort the operation with a workflow failure.
    Fail,
}

impl FromStr for TaskCardinalityPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warn" => Ok(Self::Warn),
            "fail" => Ok(Self::Fail),
            other => Err(anyhow!("unknown task cardinality policy '{}'", other)),
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Key of the main lifecycle process definition.
    pub process_key: String,
    pub admin_username: String,
    pub task_cardinality: TaskCardinalityPolicy,
    /// Hex-encoded 32-byte master key for deferred password encryption.
    pub password_key: Option<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            process_key: DEFAULT_PROCESS_KEY.to_string(),
            admin_username: DEFAULT_ADMIN_USERNAME.to_string(),
            task_cardinality: TaskCardinalityPolicy::Warn,
            password_key: None,
        }
    }
}

impl fmt::Debug for WorkflowConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowConfig")
            .field("process_key", &self.process_key)
            .field("admin_username", &self.admin_username)
            .field("task_cardinality", &self.task_cardinality)
            .field("password_key", &self.password_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl WorkflowConfig {
    /// Defaults overridden by `IDM_WORKFLOW_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(key) = std::env::var("IDM_WORKFLOW_PROCESS_KEY") {
            config.process_key = key;
        }
        if let Ok(admin) = std::env::var("IDM_WORKFLOW_ADMIN") {
            config.admin_username = admin;
        }
        if let Ok(policy) = std::env::var("IDM_WORKFLOW_TASK_CARDINALITY") {
            config.task_cardinality = policy
                .parse()
                .context("IDM_WORKFLOW_TASK_CARDINALITY")?;
        }
        if let Ok(key) = std::env::var("IDM_WORKFLOW_PASSWORD_KEY") {
            config.password_key = Some(key);
        }
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse workflow config YAML")
    }

    pub fn with_process_key(mut self, key: impl Into<String>) -> Self {
        self.process_key = key.into();
        self
    }

    pub fn with_task_cardinality(mut self, policy: TaskCardinalityPolicy) -> Self {
        self.task_cardinality = policy;
        self
    }

    pub fn password_cipher(&self) -> Result<PasswordCipher> {
        match &self.password_key {
            Some(key) => PasswordCipher::from_hex(key),
            None => {
                tracing::warn!(
                    "No password key configured; deferred passwords use an ephemeral key"
                );
                Ok(PasswordCipher::generate())
            }
        }
    }
}
