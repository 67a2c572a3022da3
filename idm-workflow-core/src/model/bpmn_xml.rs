//! BPMN 2.0 XML with the Activiti extension namespace.
//!
//! Supported flow elements: `startEvent`, `endEvent`, `userTask` (form key,
//! assignee, candidates, `activiti:formProperty`), `serviceTask`
//! (`activiti:delegateExpression`), `exclusiveGateway` (with `default`) and
//! `sequenceFlow` (with `conditionExpression`). Other flow elements are
//! rejected; diagram interchange is ignored on read and regenerated on write.

use std::collections::HashMap;
use std::fmt::Write;

use anyhow::{anyhow, bail, Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{shape_size, FlowNode, FormPropertyDef, NodeKind, ProcessModel, SequenceFlow, UserTaskDef};
use crate::types::FormPropertyKind;

const UNSUPPORTED: &[&str] = &[
    "parallelGateway",
    "inclusiveGateway",
    "eventBasedGateway",
    "complexGateway",
    "subProcess",
    "callActivity",
    "boundaryEvent",
    "intermediateCatchEvent",
    "intermediateThrowEvent",
    "scriptTask",
    "receiveTask",
    "sendTask",
    "manualTask",
    "businessRuleTask",
];

// ── Reading ──

/// Parse every `<process>` in a definitions document.
pub fn parse_definitions(xml: &str) -> Result<Vec<ProcessModel>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut builder = Builder::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => builder.open(&e, false)?,
            Ok(Event::Empty(e)) => builder.open(&e, true)?,
            Ok(Event::End(e)) => {
                let local_name = e.local_name();
                let name = std::str::from_utf8(local_name.as_ref()).unwrap_or("");
                builder.close(name)?;
            }
            Ok(Event::Text(t)) if builder.in_condition => {
                builder.condition.push_str(&t.unescape()?);
            }
            Ok(Event::CData(c)) if builder.in_condition => {
                builder.condition.push_str(&String::from_utf8_lossy(&c));
            }
            Ok(Event::Eof) => break,
            Err(e) => bail!(
                "malformed BPMN XML at position {}: {}",
                reader.buffer_position(),
                e
            ),
            _ => {}
        }
    }

    if builder.process.is_some() {
        bail!("unterminated <process> element");
    }
    Ok(builder.processes)
}

/// Parse a document that must contain exactly one process.
pub fn parse_process(xml: &str) -> Result<ProcessModel> {
    let mut processes = parse_definitions(xml)?;
    match processes.len() {
        1 => Ok(processes.remove(0)),
        0 => bail!("no <process> element found"),
        n => bail!("expected a single <process>, found {}", n),
    }
}

#[derive(Default)]
struct Builder {
    processes: Vec<ProcessModel>,
    process: Option<ProcessModel>,
    task: Option<FlowNode>,
    flow: Option<SequenceFlow>,
    property: Option<FormPropertyDef>,
    in_condition: bool,
    condition: String,
}

impl Builder {
    fn open(&mut self, e: &BytesStart<'_>, empty: bool) -> Result<()> {
        let local_name = e.local_name();
        let name = std::str::from_utf8(local_name.as_ref()).unwrap_or("");
        let attrs = attributes(e)?;

        match name {
            "process" => {
                if self.process.is_some() {
                    bail!("nested <process> elements are not supported");
                }
                self.process = Some(ProcessModel {
                    key: required(&attrs, "id", name)?,
                    name: attrs.get("name").cloned(),
                    nodes: Vec::new(),
                    flows: Vec::new(),
                });
                if empty {
                    self.close(name)?;
                }
            }
            "startEvent" | "endEvent" | "exclusiveGateway" => {
                let kind = match name {
                    "startEvent" => NodeKind::StartEvent,
                    "endEvent" => NodeKind::EndEvent,
                    _ => NodeKind::ExclusiveGateway {
                        default_flow: attrs.get("default").cloned(),
                    },
                };
                self.push_node(node(&attrs, name, kind)?)?;
            }
            "userTask" | "serviceTask" => {
                let kind = if name == "userTask" {
                    NodeKind::UserTask(UserTaskDef {
                        form_key: attrs.get("formKey").cloned(),
                        assignee: attrs.get("assignee").cloned(),
                        candidate_users: split_list(attrs.get("candidateUsers")),
                        candidate_groups: split_list(attrs.get("candidateGroups")),
                        form_properties: Vec::new(),
                    })
                } else {
                    NodeKind::ServiceTask {
                        delegate_expression: attrs
                            .get("delegateExpression")
                            .cloned()
                            .unwrap_or_default(),
                    }
                };
                let task = node(&attrs, name, kind)?;
                if empty {
                    self.push_node(task)?;
                } else {
                    self.task = Some(task);
                }
            }
            "formProperty" => {
                let prop = form_property(&attrs)?;
                if empty {
                    self.attach_property(prop)?;
                } else {
                    self.property = Some(prop);
                }
            }
            "value" => {
                if let Some(prop) = self.property.as_mut() {
                    let id = required(&attrs, "id", name)?;
                    let label = attrs.get("name").cloned().unwrap_or_else(|| id.clone());
                    prop.enum_values.push((id, label));
                }
            }
            "sequenceFlow" => {
                let flow = SequenceFlow {
                    id: required(&attrs, "id", name)?,
                    source: required(&attrs, "sourceRef", name)?,
                    target: required(&attrs, "targetRef", name)?,
                    condition: None,
                };
                if empty {
                    self.push_flow(flow)?;
                } else {
                    self.flow = Some(flow);
                }
            }
            "conditionExpression" if self.flow.is_some() && !empty => {
                self.in_condition = true;
                self.condition.clear();
            }
            other if self.process.is_some() && UNSUPPORTED.contains(&other) => {
                bail!("unsupported BPMN element <{}>", other);
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, name: &str) -> Result<()> {
        match name {
            "process" => {
                if let Some(process) = self.process.take() {
                    self.processes.push(process);
                }
            }
            "userTask" | "serviceTask" => {
                if let Some(task) = self.task.take() {
                    self.push_node(task)?;
                }
            }
            "formProperty" => {
                if let Some(prop) = self.property.take() {
                    self.attach_property(prop)?;
                }
            }
            "conditionExpression" if self.in_condition => {
                self.in_condition = false;
                let text = self.condition.trim().to_string();
                if let Some(flow) = self.flow.as_mut() {
                    if !text.is_empty() {
                        flow.condition = Some(text);
                    }
                }
            }
            "sequenceFlow" => {
                if let Some(flow) = self.flow.take() {
                    self.push_flow(flow)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn current(&mut self) -> Result<&mut ProcessModel> {
        self.process
            .as_mut()
            .ok_or_else(|| anyhow!("flow element outside of <process>"))
    }

    fn push_node(&mut self, node: FlowNode) -> Result<()> {
        self.current()?.nodes.push(node);
        Ok(())
    }

    fn push_flow(&mut self, flow: SequenceFlow) -> Result<()> {
        self.current()?.flows.push(flow);
        Ok(())
    }

    fn attach_property(&mut self, prop: FormPropertyDef) -> Result<()> {
        match self.task.as_mut().map(|t| &mut t.kind) {
            Some(NodeKind::UserTask(def)) => {
                def.form_properties.push(prop);
                Ok(())
            }
            _ => bail!("formProperty '{}' outside of a userTask", prop.id),
        }
    }
}

fn attributes(e: &BytesStart<'_>) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    for attr in e.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        out.insert(key, value);
    }
    Ok(out)
}

fn required(attrs: &HashMap<String, String>, key: &str, element: &str) -> Result<String> {
    attrs
        .get(key)
        .filter(|v| !v.trim().is_empty())
        .cloned()
        .with_context(|| format!("<{}> is missing the '{}' attribute", element, key))
}

fn node(attrs: &HashMap<String, String>, element: &str, kind: NodeKind) -> Result<FlowNode> {
    Ok(FlowNode {
        id: required(attrs, "id", element)?,
        name: attrs.get("name").cloned(),
        kind,
    })
}

fn split_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn flag(attrs: &HashMap<String, String>, key: &str, default: bool) -> Result<bool> {
    match attrs.get(key).map(|v| v.trim()) {
        None | Some("") => Ok(default),
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(other) => bail!("attribute '{}' must be true or false, got '{}'", key, other),
    }
}

pub(crate) fn parse_kind(value: Option<&str>) -> Result<FormPropertyKind> {
    match value.map(str::trim).unwrap_or("string") {
        "" | "string" => Ok(FormPropertyKind::String),
        "long" => Ok(FormPropertyKind::Long),
        "enum" => Ok(FormPropertyKind::Enum),
        "date" => Ok(FormPropertyKind::Date),
        "boolean" => Ok(FormPropertyKind::Boolean),
        other => bail!("unsupported form property type '{}'", other),
    }
}

pub(crate) fn kind_name(kind: FormPropertyKind) -> &'static str {
    match kind {
        FormPropertyKind::String => "string",
        FormPropertyKind::Long => "long",
        FormPropertyKind::Enum => "enum",
        FormPropertyKind::Date => "date",
        FormPropertyKind::Boolean => "boolean",
    }
}

fn form_property(attrs: &HashMap<String, String>) -> Result<FormPropertyDef> {
    let mut prop = FormPropertyDef::new(
        required(attrs, "id", "formProperty")?,
        parse_kind(attrs.get("type").map(String::as_str))?,
    );
    prop.name = attrs.get("name").cloned();
    prop.variable = attrs.get("variable").cloned();
    prop.readable = flag(attrs, "readable", true)?;
    prop.writable = flag(attrs, "writable", true)?;
    prop.required = flag(attrs, "required", false)?;
    prop.date_pattern = attrs.get("datePattern").cloned();
    Ok(prop)
}

// ── Writing ──

pub fn write_definitions(model: &ProcessModel) -> Result<String> {
    let key = xml_escape(&model.key);
    let layout = model.layout();
    let mut xml = String::new();

    // ── Header ──
    writeln!(xml, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
    writeln!(
        xml,
        r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL""#
    )?;
    writeln!(
        xml,
        r#"             xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance""#
    )?;
    writeln!(xml, r#"             xmlns:activiti="http://activiti.org/bpmn""#)?;
    writeln!(
        xml,
        r#"             xmlns:bpmndi="http://www.omg.org/spec/BPMN/20100524/DI""#
    )?;
    writeln!(
        xml,
        r#"             xmlns:omgdc="http://www.omg.org/spec/DD/20100524/DC""#
    )?;
    writeln!(
        xml,
        r#"             xmlns:omgdi="http://www.omg.org/spec/DD/20100524/DI""#
    )?;
    writeln!(
        xml,
        r#"             targetNamespace="http://activiti.org/bpmn20">"#
    )?;

    let name_attr = model
        .name
        .as_deref()
        .map(|n| format!(r#" name="{}""#, xml_escape(n)))
        .unwrap_or_default();
    writeln!(
        xml,
        r#"  <process id="{}"{} isExecutable="true">"#,
        key, name_attr
    )?;

    // ── Elements ──
    for node in &model.nodes {
        let id = xml_escape(&node.id);
        let name_attr = node
            .name
            .as_deref()
            .map(|n| format!(r#" name="{}""#, xml_escape(n)))
            .unwrap_or_default();
        match &node.kind {
            NodeKind::StartEvent => {
                writeln!(xml, r#"    <startEvent id="{}"{}/>"#, id, name_attr)?;
            }
            NodeKind::EndEvent => {
                writeln!(xml, r#"    <endEvent id="{}"{}/>"#, id, name_attr)?;
            }
            NodeKind::ServiceTask {
                delegate_expression,
            } => {
                writeln!(
                    xml,
                    r#"    <serviceTask id="{}"{} activiti:delegateExpression="{}"/>"#,
                    id,
                    name_attr,
                    xml_escape(delegate_expression)
                )?;
            }
            NodeKind::ExclusiveGateway { default_flow } => {
                let default_attr = default_flow
                    .as_deref()
                    .map(|f| format!(r#" default="{}""#, xml_escape(f)))
                    .unwrap_or_default();
                writeln!(
                    xml,
                    r#"    <exclusiveGateway id="{}"{}{}/>"#,
                    id, name_attr, default_attr
                )?;
            }
            NodeKind::UserTask(def) => write_user_task(&mut xml, &id, &name_attr, def)?,
        }
    }

    // ── Sequence flows ──
    for flow in &model.flows {
        let head = format!(
            r#"    <sequenceFlow id="{}" sourceRef="{}" targetRef="{}""#,
            xml_escape(&flow.id),
            xml_escape(&flow.source),
            xml_escape(&flow.target)
        );
        match &flow.condition {
            Some(cond) => {
                writeln!(xml, "{}>", head)?;
                writeln!(
                    xml,
                    r#"      <conditionExpression xsi:type="tFormalExpression">{}</conditionExpression>"#,
                    xml_escape(cond)
                )?;
                writeln!(xml, r#"    </sequenceFlow>"#)?;
            }
            None => writeln!(xml, "{}/>", head)?,
        }
    }

    writeln!(xml, r#"  </process>"#)?;

    // ── BPMN DI ──
    writeln!(xml, r#"  <bpmndi:BPMNDiagram id="BPMNDiagram_{}">"#, key)?;
    writeln!(
        xml,
        r#"    <bpmndi:BPMNPlane id="BPMNPlane_{}" bpmnElement="{}">"#,
        key, key
    )?;
    for node in &model.nodes {
        let id = xml_escape(&node.id);
        let (x, y) = layout.get(&node.id).copied().unwrap_or((0.0, 0.0));
        let (w, h) = shape_size(&node.kind);
        writeln!(
            xml,
            r#"      <bpmndi:BPMNShape id="BPMNShape_{}" bpmnElement="{}">
        <omgdc:Bounds x="{:.0}" y="{:.0}" width="{:.0}" height="{:.0}"/>
      </bpmndi:BPMNShape>"#,
            id, id, x, y, w, h
        )?;
    }
    for flow in &model.flows {
        let id = xml_escape(&flow.id);
        let (x1, y1) = layout.get(&flow.source).copied().unwrap_or((0.0, 0.0));
        let (x2, y2) = layout.get(&flow.target).copied().unwrap_or((0.0, 0.0));
        let source_w = model
            .node(&flow.source)
            .map(|n| shape_size(&n.kind).0)
            .unwrap_or(0.0);
        writeln!(
            xml,
            r#"      <bpmndi:BPMNEdge id="BPMNEdge_{}" bpmnElement="{}">
        <omgdi:waypoint x="{:.0}" y="{:.0}"/>
        <omgdi:waypoint x="{:.0}" y="{:.0}"/>
      </bpmndi:BPMNEdge>"#,
            id,
            id,
            x1 + source_w,
            y1 + 15.0,
            x2,
            y2 + 15.0
        )?;
    }
    writeln!(xml, r#"    </bpmndi:BPMNPlane>"#)?;
    writeln!(xml, r#"  </bpmndi:BPMNDiagram>"#)?;
    writeln!(xml, r#"</definitions>"#)?;

    Ok(xml)
}

fn write_user_task(xml: &mut String, id: &str, name_attr: &str, def: &UserTaskDef) -> Result<()> {
    let mut attrs = String::new();
    if let Some(form_key) = &def.form_key {
        write!(attrs, r#" activiti:formKey="{}""#, xml_escape(form_key))?;
    }
    if let Some(assignee) = &def.assignee {
        write!(attrs, r#" activiti:assignee="{}""#, xml_escape(assignee))?;
    }
    if !def.candidate_users.is_empty() {
        write!(
            attrs,
            r#" activiti:candidateUsers="{}""#,
            xml_escape(&def.candidate_users.join(","))
        )?;
    }
    if !def.candidate_groups.is_empty() {
        write!(
            attrs,
            r#" activiti:candidateGroups="{}""#,
            xml_escape(&def.candidate_groups.join(","))
        )?;
    }

    if def.form_properties.is_empty() {
        writeln!(xml, r#"    <userTask id="{}"{}{}/>"#, id, name_attr, attrs)?;
        return Ok(());
    }

    writeln!(xml, r#"    <userTask id="{}"{}{}>"#, id, name_attr, attrs)?;
    writeln!(xml, r#"      <extensionElements>"#)?;
    for prop in &def.form_properties {
        let mut prop_attrs = format!(
            r#"id="{}" type="{}""#,
            xml_escape(&prop.id),
            kind_name(prop.kind)
        );
        if let Some(name) = &prop.name {
            write!(prop_attrs, r#" name="{}""#, xml_escape(name))?;
        }
        if let Some(variable) = &prop.variable {
            write!(prop_attrs, r#" variable="{}""#, xml_escape(variable))?;
        }
        if let Some(pattern) = &prop.date_pattern {
            write!(prop_attrs, r#" datePattern="{}""#, xml_escape(pattern))?;
        }
        write!(
            prop_attrs,
            r#" readable="{}" writable="{}" required="{}""#,
            prop.readable, prop.writable, prop.required
        )?;

        if prop.enum_values.is_empty() {
            writeln!(xml, r#"        <activiti:formProperty {}/>"#, prop_attrs)?;
        } else {
            writeln!(xml, r#"        <activiti:formProperty {}>"#, prop_attrs)?;
            for (value_id, label) in &prop.enum_values {
                writeln!(
                    xml,
                    r#"          <activiti:value id="{}" name="{}"/>"#,
                    xml_escape(value_id),
                    xml_escape(label)
                )?;
            }
            writeln!(xml, r#"        </activiti:formProperty>"#)?;
        }
    }
    writeln!(xml, r#"      </extensionElements>"#)?;
    writeln!(xml, r#"    </userTask>"#)?;
    Ok(())
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
