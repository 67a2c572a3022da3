//! Identity lifecycle workflow adapter.
//!
//! Identity lifecycle transitions (create, activate, update, suspend,
//! reactivate, password reset, delete) run as named tasks of a BPMN process.
//! The adapter persists what the process produced through [`ports::IdentityStore`]
//! and hands resource propagation intent back to the caller.
//!
//! ```rust,no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use idm_workflow_core::{
//!     resources, FixedActor, IdentityDraft, LifecycleAdapter, MemoryIdentityStore,
//!     MemoryProcessEngine, WorkflowConfig,
//! };
//!
//! let adapter = LifecycleAdapter::new(
//!     Arc::new(MemoryProcessEngine::new()),
//!     Arc::new(MemoryIdentityStore::new()),
//!     Arc::new(FixedActor::new("admin")),
//!     WorkflowConfig::default(),
//! )?;
//! adapter
//!     .definitions()
//!     .ensure_deployed(resources::USER_WORKFLOW_KEY, resources::USER_WORKFLOW)
//!     .await?;
//! let created = adapter
//!     .create(IdentityDraft::new("alice").with_password("password123"), false, None, true)
//!     .await?;
//! println!("{:?}", created.value);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod crypto;
pub mod definitions;
pub mod engine;
pub mod error;
pub mod forms;
pub mod model;
pub mod ports;
pub mod propagation;
pub mod resources;
pub mod types;
pub mod vars;

mod runtime;

pub use adapter::LifecycleAdapter;
pub use config::{TaskCardinalityPolicy, WorkflowConfig};
pub use definitions::DefinitionManager;
pub use engine::{MemoryProcessEngine, ProcessEngine};
pub use error::{DomainViolation, WfResult, WorkflowError};
pub use forms::FormGateway;
pub use ports::{ActorContext, FixedActor, IdentityStore, MemoryIdentityStore};
pub use propagation::{PropagationByResource, ResourceOperation};
pub use runtime::ActivitySnapshot;
pub use types::*;
