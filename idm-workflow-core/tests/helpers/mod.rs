//! Shared harness for the adapter integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use idm_workflow_core::crypto::PasswordCipher;
use idm_workflow_core::resources;
use idm_workflow_core::{
    ActorContext, DefinitionFormat, FixedActor, Identity, IdentityKey, IdentityStore, LifecycleAdapter,
    MemoryIdentityStore, MemoryProcessEngine, ProcessEngine, WorkflowConfig,
};

pub struct Harness {
    pub engine: Arc<MemoryProcessEngine>,
    pub store: Arc<MemoryIdentityStore>,
    pub config: WorkflowConfig,
}

impl Harness {
    /// Engine with every bundled definition deployed.
    pub async fn new(config: WorkflowConfig) -> Self {
        Self::with_store(config, MemoryIdentityStore::new()).await
    }

    pub async fn with_store(config: WorkflowConfig, store: MemoryIdentityStore) -> Self {
        let harness = Self {
            engine: Arc::new(MemoryProcessEngine::new()),
            store: Arc::new(store),
            config,
        };
        let definitions = harness.adapter("admin").definitions();
        for (key, xml) in resources::bundled() {
            definitions.ensure_deployed(key, xml).await.unwrap();
        }
        harness
    }

    pub async fn lifecycle() -> Self {
        Self::new(WorkflowConfig::default()).await
    }

    pub async fn approval() -> Self {
        Self::new(WorkflowConfig::default().with_process_key(resources::USER_WORKFLOW_APPROVAL_KEY))
            .await
    }

    /// Bundled definitions plus `xml`, which drives new identities.
    pub async fn deploying(process_key: &str, xml: &str) -> Self {
        let harness = Self::new(WorkflowConfig::default().with_process_key(process_key)).await;
        harness
            .adapter("admin")
            .definitions()
            .import_definition(process_key, DefinitionFormat::Xml, xml.as_bytes())
            .await
            .unwrap();
        harness
    }

    /// Adapter acting as `actor`, sharing engine, store and cipher key.
    pub fn adapter(&self, actor: &str) -> LifecycleAdapter {
        let engine: Arc<dyn ProcessEngine> = self.engine.clone();
        let store: Arc<dyn IdentityStore> = self.store.clone();
        let actor: Arc<dyn ActorContext> = Arc::new(FixedActor::new(actor));
        LifecycleAdapter::with_cipher(engine, store, actor, self.config.clone(), cipher())
    }

    pub async fn identity(&self, key: IdentityKey) -> Identity {
        self.store.find_by_key(key).await.unwrap().unwrap()
    }

    pub async fn token(&self, key: IdentityKey) -> String {
        self.identity(key).await.token.unwrap()
    }

    /// Every process variable of `identity`'s instance, serialized.
    pub async fn variables_json(&self, identity: &Identity) -> String {
        let workflow_id = identity.workflow_id.clone().unwrap();
        let vars = self.engine.variables(&workflow_id).await.unwrap();
        serde_json::to_string(&vars).unwrap()
    }
}

pub fn cipher() -> PasswordCipher {
    PasswordCipher::from_hex(&"42".repeat(32)).unwrap()
}
