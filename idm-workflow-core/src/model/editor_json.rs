//! Editor JSON model (stencil-based `childShapes` canvas) to and from the IR.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Map, Value};

use super::bpmn_xml::{kind_name, parse_kind};
use super::{shape_size, FlowNode, FormPropertyDef, NodeKind, ProcessModel, SequenceFlow, UserTaskDef};

pub const CHILD_SHAPES: &str = "childShapes";
const STENCILSET_NAMESPACE: &str = "http://b3mn.org/stencilset/bpmn2.0#";

/// The canvas object, unwrapping an optional `{"model": {...}}` envelope.
pub fn canvas(json: &Value) -> &Value {
    match json.get("model") {
        Some(inner) if inner.is_object() => inner,
        _ => json,
    }
}

pub fn has_child_shapes(json: &Value) -> bool {
    canvas(json)
        .get(CHILD_SHAPES)
        .is_some_and(Value::is_array)
}

// ── Editor JSON → IR ──

pub fn from_editor_json(json: &Value) -> Result<ProcessModel> {
    let canvas = canvas(json);
    let shapes = canvas
        .get(CHILD_SHAPES)
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("editor model has no '{}' array", CHILD_SHAPES))?;
    let props = canvas.get("properties");

    let key = text(props, "process_id").context("editor model has no process_id")?;
    let name = text(props, "name");

    // resourceId → element id, and flow resourceId → source element id
    let mut element_ids: HashMap<&str, String> = HashMap::new();
    let mut flow_sources: HashMap<&str, String> = HashMap::new();
    for shape in shapes {
        let resource_id = resource_id(shape)?;
        let id = text(shape.get("properties"), "overrideid").unwrap_or_else(|| resource_id.to_string());
        if stencil(shape)? != "SequenceFlow" {
            for out in shape
                .get("outgoing")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if let Some(flow_ref) = out.get("resourceId").and_then(Value::as_str) {
                    flow_sources.insert(flow_ref, id.clone());
                }
            }
        }
        element_ids.insert(resource_id, id);
    }

    let mut nodes = Vec::new();
    let mut flows = Vec::new();
    let mut defaults: Vec<(String, String)> = Vec::new();

    for shape in shapes {
        let resource_id = resource_id(shape)?;
        let id = element_ids[resource_id].clone();
        let props = shape.get("properties");
        let kind = match stencil(shape)? {
            "StartNoneEvent" => NodeKind::StartEvent,
            "EndNoneEvent" => NodeKind::EndEvent,
            "ExclusiveGateway" => NodeKind::ExclusiveGateway { default_flow: None },
            "ServiceTask" => NodeKind::ServiceTask {
                delegate_expression: text(props, "servicetaskdelegateexpression").unwrap_or_default(),
            },
            "UserTask" => NodeKind::UserTask(user_task(props)?),
            "SequenceFlow" => {
                let source = flow_sources
                    .get(resource_id)
                    .cloned()
                    .with_context(|| format!("sequence flow '{}' has no source shape", id))?;
                let target_ref = shape
                    .get("target")
                    .and_then(|t| t.get("resourceId"))
                    .or_else(|| {
                        shape
                            .get("outgoing")
                            .and_then(|o| o.get(0))
                            .and_then(|o| o.get("resourceId"))
                    })
                    .and_then(Value::as_str)
                    .with_context(|| format!("sequence flow '{}' has no target", id))?;
                let target = element_ids
                    .get(target_ref)
                    .cloned()
                    .with_context(|| format!("sequence flow '{}' targets unknown shape '{}'", id, target_ref))?;
                if boolean(props, "defaultflow").unwrap_or(false) {
                    defaults.push((source.clone(), id.clone()));
                }
                flows.push(SequenceFlow {
                    id,
                    source,
                    target,
                    condition: text(props, "conditionsequenceflow"),
                });
                continue;
            }
            other => bail!("unsupported editor stencil '{}'", other),
        };
        nodes.push(FlowNode {
            id,
            name: text(props, "name"),
            kind,
        });
    }

    for (gateway, flow) in defaults {
        if let Some(NodeKind::ExclusiveGateway { default_flow }) = nodes
            .iter_mut()
            .find(|n| n.id == gateway)
            .map(|n| &mut n.kind)
        {
            *default_flow = Some(flow);
        }
    }

    Ok(ProcessModel {
        key,
        name,
        nodes,
        flows,
    })
}

fn resource_id(shape: &Value) -> Result<&str> {
    shape
        .get("resourceId")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("shape without resourceId"))
}

fn stencil(shape: &Value) -> Result<&str> {
    shape
        .get("stencil")
        .and_then(|s| s.get("id"))
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("shape without stencil id"))
}

fn text(props: Option<&Value>, key: &str) -> Option<String> {
    props
        .and_then(|p| p.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn boolean(props: Option<&Value>, key: &str) -> Option<bool> {
    match props.and_then(|p| p.get(key))? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn user_task(props: Option<&Value>) -> Result<UserTaskDef> {
    let assignment = props
        .and_then(|p| p.get("usertaskassignment"))
        .and_then(|a| a.get("assignment"));
    let values = |key: &str| -> Vec<String> {
        assignment
            .and_then(|a| a.get(key))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|v| v.get("value").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    };

    let mut form_properties = Vec::new();
    for raw in props
        .and_then(|p| p.get("formproperties"))
        .and_then(|f| f.get("formProperties"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let raw = Some(raw);
        let id = text(raw, "id").context("form property without id")?;
        let mut prop = FormPropertyDef::new(id, parse_kind(text(raw, "type").as_deref())?);
        prop.name = text(raw, "name");
        prop.variable = text(raw, "variable");
        prop.date_pattern = text(raw, "datePattern");
        prop.readable = boolean(raw, "readable").unwrap_or(true);
        prop.writable = boolean(raw, "writable").unwrap_or(true);
        prop.required = boolean(raw, "required").unwrap_or(false);
        prop.enum_values = raw
            .and_then(|r| r.get("enumValues"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|v| {
                let id = text(Some(v), "id")?;
                let label = text(Some(v), "name").unwrap_or_else(|| id.clone());
                Some((id, label))
            })
            .collect();
        form_properties.push(prop);
    }

    Ok(UserTaskDef {
        form_key: text(props, "formkeydefinition"),
        assignee: assignment.and_then(|a| text(Some(a), "assignee")),
        candidate_users: values("candidateUsers"),
        candidate_groups: values("candidateGroups"),
        form_properties,
    })
}

// ── IR → editor JSON ──

pub fn to_editor_json(model: &ProcessModel) -> Value {
    let layout = model.layout();
    let mut shapes = Vec::new();

    for node in &model.nodes {
        let (x, y) = layout.get(&node.id).copied().unwrap_or((0.0, 0.0));
        let (w, h) = shape_size(&node.kind);
        let mut props = Map::new();
        props.insert("overrideid".into(), json!(node.id));
        props.insert("name".into(), json!(node.name.clone().unwrap_or_default()));

        let stencil = match &node.kind {
            NodeKind::StartEvent => "StartNoneEvent",
            NodeKind::EndEvent => "EndNoneEvent",
            NodeKind::ExclusiveGateway { .. } => "ExclusiveGateway",
            NodeKind::ServiceTask {
                delegate_expression,
            } => {
                props.insert(
                    "servicetaskdelegateexpression".into(),
                    json!(delegate_expression),
                );
                "ServiceTask"
            }
            NodeKind::UserTask(def) => {
                write_user_task(&mut props, def);
                "UserTask"
            }
        };

        let outgoing: Vec<Value> = model
            .outgoing(&node.id)
            .map(|f| json!({ "resourceId": f.id }))
            .collect();

        shapes.push(json!({
            "resourceId": node.id,
            "properties": props,
            "stencil": { "id": stencil },
            "childShapes": [],
            "outgoing": outgoing,
            "bounds": bounds(x, y, w, h),
            "dockers": [],
        }));
    }

    for flow in &model.flows {
        let is_default = model.node(&flow.source).is_some_and(|n| {
            matches!(&n.kind, NodeKind::ExclusiveGateway { default_flow: Some(d) } if *d == flow.id)
        });
        let default_flag = if is_default { "true" } else { "false" };
        let (x1, y1) = layout.get(&flow.source).copied().unwrap_or((0.0, 0.0));
        let (x2, y2) = layout.get(&flow.target).copied().unwrap_or((0.0, 0.0));
        shapes.push(json!({
            "resourceId": flow.id,
            "properties": {
                "overrideid": flow.id,
                "name": "",
                "conditionsequenceflow": flow.condition.clone().unwrap_or_default(),
                "defaultflow": default_flag,
            },
            "stencil": { "id": "SequenceFlow" },
            "childShapes": [],
            "outgoing": [{ "resourceId": flow.target }],
            "target": { "resourceId": flow.target },
            "bounds": {
                "upperLeft": { "x": x1.min(x2), "y": y1.min(y2) },
                "lowerRight": { "x": x1.max(x2), "y": y1.max(y2) },
            },
            "dockers": [],
        }));
    }

    json!({
        "resourceId": "canvas",
        "properties": {
            "process_id": model.key,
            "name": model.name.clone().unwrap_or_default(),
        },
        "stencil": { "id": "BPMNDiagram" },
        "stencilset": { "namespace": STENCILSET_NAMESPACE },
        "childShapes": shapes,
        "bounds": bounds(0.0, 0.0, 1485.0, 1050.0),
    })
}

fn write_user_task(props: &mut Map<String, Value>, def: &UserTaskDef) {
    props.insert(
        "formkeydefinition".into(),
        json!(def.form_key.clone().unwrap_or_default()),
    );
    let wrap = |items: &[String]| -> Vec<Value> {
        items.iter().map(|v| json!({ "value": v })).collect()
    };
    props.insert(
        "usertaskassignment".into(),
        json!({
            "assignment": {
                "assignee": def.assignee.clone().unwrap_or_default(),
                "candidateUsers": wrap(&def.candidate_users),
                "candidateGroups": wrap(&def.candidate_groups),
            }
        }),
    );
    let form_properties: Vec<Value> = def
        .form_properties
        .iter()
        .map(|p| {
            let enum_values: Vec<Value> = p
                .enum_values
                .iter()
                .map(|(id, name)| json!({ "id": id, "name": name }))
                .collect();
            json!({
                "id": p.id,
                "name": p.name.clone().unwrap_or_default(),
                "type": kind_name(p.kind),
                "variable": p.variable.clone().unwrap_or_default(),
                "datePattern": p.date_pattern.clone().unwrap_or_default(),
                "readable": p.readable,
                "writable": p.writable,
                "required": p.required,
                "enumValues": enum_values,
            })
        })
        .collect();
    props.insert(
        "formproperties".into(),
        json!({ "formProperties": form_properties }),
    );
}

fn bounds(x: f64, y: f64, w: f64, h: f64) -> Value {
    json!({
        "upperLeft": { "x": x, "y": y },
        "lowerRight": { "x": x + w, "y": y + h },
    })
}
