//! Deployed process definitions and their editor models.

use std::sync::Arc;

use serde_json::Value;

use crate::config::WorkflowConfig;
use crate::engine::{Deployment, EditorModel, ProcessDefinitionInfo, ProcessEngine};
use crate::error::{engine_err, WfResult, WorkflowError};
use crate::model::{bpmn_xml, editor_json, ProcessModel};
use crate::types::{DefinitionFormat, ProcessDefinitionRef};

pub struct DefinitionManager {
    engine: Arc<dyn ProcessEngine>,
    config: WorkflowConfig,
}

fn resource_name(key: &str) -> String {
    format!("{key}.bpmn20.xml")
}

impl DefinitionManager {
    pub fn new(engine: Arc<dyn ProcessEngine>, config: WorkflowConfig) -> Self {
        Self { engine, config }
    }

    async fn latest(&self, key: &str) -> WfResult<Option<ProcessDefinitionInfo>> {
        let all = self
            .engine
            .latest_definitions()
            .await
            .map_err(engine_err("While listing process definitions"))?;
        Ok(all.into_iter().find(|d| d.key == key))
    }

    async fn require_latest(&self, key: &str) -> WfResult<ProcessDefinitionInfo> {
        self.latest(key)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("Process definition '{}'", key)))
    }

    async fn model_id(&self, key: &str) -> WfResult<Option<String>> {
        Ok(self
            .engine
            .model(key)
            .await
            .map_err(engine_err(format!("While reading the model of '{}'", key)))?
            .map(|m| m.id))
    }

    /// Latest version of every definition.
    pub async fn list_definitions(&self) -> WfResult<Vec<ProcessDefinitionRef>> {
        let definitions = self
            .engine
            .latest_definitions()
            .await
            .map_err(engine_err("While listing process definitions"))?;
        let mut out = Vec::with_capacity(definitions.len());
        for d in definitions {
            let model_id = self.model_id(&d.key).await?;
            out.push(ProcessDefinitionRef {
                main: d.key == self.config.process_key,
                key: d.key,
                name: d.name,
                version: d.version,
                model_id,
            });
        }
        Ok(out)
    }

    /// Deploy `payload` as a new version of `key` and regenerate its editor model.
    pub async fn import_definition(
        &self,
        key: &str,
        format: DefinitionFormat,
        payload: &[u8],
    ) -> WfResult<ProcessDefinitionRef> {
        let (model, xml, source) = match format {
            DefinitionFormat::Xml => {
                let xml = std::str::from_utf8(payload)
                    .map_err(|e| WorkflowError::ParsingInvalid(format!("BPMN is not UTF-8: {}", e)))?;
                let model = bpmn_xml::parse_process(xml)
                    .map_err(|e| WorkflowError::ParsingInvalid(format!("{:#}", e)))?;
                let source = editor_json::to_editor_json(&model);
                (model, xml.to_string(), source)
            }
            DefinitionFormat::Json => {
                let json: Value = serde_json::from_slice(payload)
                    .map_err(|e| WorkflowError::ParsingInvalid(format!("Invalid model JSON: {}", e)))?;
                if !editor_json::has_child_shapes(&json) {
                    return Err(WorkflowError::ParsingInvalid(format!(
                        "Model JSON has no '{}' node",
                        editor_json::CHILD_SHAPES
                    )));
                }
                let model = editor_json::from_editor_json(&json)
                    .map_err(|e| WorkflowError::ParsingInvalid(format!("{:#}", e)))?;
                let xml = bpmn_xml::write_definitions(&model)
                    .map_err(engine_err(format!("While converting '{}' to BPMN", key)))?;
                (model, xml, editor_json::canvas(&json).clone())
            }
        };
        self.check_key(key, &model)?;
        model
            .ensure_valid()
            .map_err(|e| WorkflowError::ParsingInvalid(format!("{:#}", e)))?;

        let deployed = self
            .engine
            .deploy(Deployment::new(key).with_resource(resource_name(key), xml))
            .await
            .map_err(engine_err(format!("While deploying '{}'", key)))?;
        let Some(info) = deployed.iter().find(|d| d.key == key).cloned() else {
            if let Some(first) = deployed.first() {
                self.engine
                    .undeploy(&first.deployment_id)
                    .await
                    .map_err(engine_err(format!("While rolling back '{}'", key)))?;
            }
            return Err(WorkflowError::Validation(format!(
                "Deployment did not produce a definition for '{}'",
                key
            )));
        };

        let model_id = self
            .engine
            .save_model(EditorModel {
                id: String::new(),
                key: key.to_string(),
                name: info.name.clone(),
                deployment_id: Some(info.deployment_id.clone()),
                source,
            })
            .await
            .map_err(engine_err(format!("While saving the model of '{}'", key)))?;

        tracing::info!(process_key = %key, version = info.version, ?format, "Process definition imported");
        Ok(ProcessDefinitionRef {
            main: info.key == self.config.process_key,
            key: info.key,
            name: info.name,
            version: info.version,
            model_id: Some(model_id),
        })
    }

    fn check_key(&self, key: &str, model: &ProcessModel) -> WfResult<()> {
        if model.key != key {
            return Err(WorkflowError::Validation(format!(
                "Payload defines process '{}', expected '{}'",
                model.key, key
            )));
        }
        Ok(())
    }

    /// Stored bytes of the latest definition (XML) or of its editor model (JSON).
    pub async fn export_definition(&self, key: &str, format: DefinitionFormat) -> WfResult<Vec<u8>> {
        match format {
            DefinitionFormat::Xml => {
                let info = self.require_latest(key).await?;
                self.stored_resource(&info, &info.resource_name).await
            }
            DefinitionFormat::Json => {
                let model = self
                    .engine
                    .model(key)
                    .await
                    .map_err(engine_err(format!("While reading the model of '{}'", key)))?
                    .ok_or_else(|| WorkflowError::NotFound(format!("Model for '{}'", key)))?;
                serde_json::to_vec(&model.source).map_err(|e| {
                    WorkflowError::workflow(format!("While exporting the model of '{}'", key), e.into())
                })
            }
        }
    }

    pub async fn export_diagram(&self, key: &str) -> WfResult<Vec<u8>> {
        let info = self.require_latest(key).await?;
        let diagram = info
            .diagram_resource_name
            .clone()
            .ok_or_else(|| WorkflowError::NotFound(format!("Diagram for '{}'", key)))?;
        self.stored_resource(&info, &diagram).await
    }

    async fn stored_resource(&self, info: &ProcessDefinitionInfo, name: &str) -> WfResult<Vec<u8>> {
        self.engine
            .resource(&info.deployment_id, name)
            .await
            .map_err(engine_err(format!("While reading resource '{}'", name)))?
            .ok_or_else(|| WorkflowError::NotFound(format!("Resource '{}'", name)))
    }

    /// Undeploy every version of `key`. The main lifecycle process is kept.
    pub async fn delete_definition(&self, key: &str) -> WfResult<()> {
        if key == self.config.process_key {
            return Err(WorkflowError::Validation(format!(
                "Cannot delete the main process definition '{}'",
                key
            )));
        }
        let mut info = self.require_latest(key).await?;
        loop {
            self.engine
                .undeploy(&info.deployment_id)
                .await
                .map_err(engine_err(format!("While undeploying '{}'", key)))?;
            match self.latest(key).await? {
                Some(older) => info = older,
                None => break,
            }
        }
        self.engine
            .delete_model(key)
            .await
            .map_err(engine_err(format!("While deleting the model of '{}'", key)))?;
        tracing::info!(process_key = %key, "Process definition deleted");
        Ok(())
    }

    /// Import `xml` as `key` unless some version is already deployed.
    pub async fn ensure_deployed(&self, key: &str, xml: &str) -> WfResult<Option<ProcessDefinitionRef>> {
        if self.latest(key).await?.is_some() {
            tracing::debug!(process_key = %key, "Process definition already deployed");
            return Ok(None);
        }
        self.import_definition(key, DefinitionFormat::Xml, xml.as_bytes())
            .await
            .map(Some)
    }
}
