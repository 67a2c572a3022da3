//! Engine-agnostic process graph.
//!
//! Both BPMN XML and the editor JSON model convert to and from [`ProcessModel`];
//! the in-memory engine executes it directly.

pub mod bpmn_xml;
pub mod condition;
pub mod editor_json;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use anyhow::{bail, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::types::FormPropertyKind;
use condition::Condition;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessModel {
    /// Process id, used as the definition key.
    pub key: String,
    pub name: Option<String>,
    pub nodes: Vec<FlowNode>,
    pub flows: Vec<SequenceFlow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    pub name: Option<String>,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    StartEvent,
    EndEvent,
    UserTask(UserTaskDef),
    ServiceTask { delegate_expression: String },
    ExclusiveGateway { default_flow: Option<String> },
}

impl NodeKind {
    /// BPMN element name.
    pub fn element_name(&self) -> &'static str {
        match self {
            Self::StartEvent => "startEvent",
            Self::EndEvent => "endEvent",
            Self::UserTask(_) => "userTask",
            Self::ServiceTask { .. } => "serviceTask",
            Self::ExclusiveGateway { .. } => "exclusiveGateway",
        }
    }

    pub fn is_gateway(&self) -> bool {
        matches!(self, Self::ExclusiveGateway { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserTaskDef {
    pub form_key: Option<String>,
    pub assignee: Option<String>,
    pub candidate_users: Vec<String>,
    pub candidate_groups: Vec<String>,
    pub form_properties: Vec<FormPropertyDef>,
}

impl UserTaskDef {
    pub fn has_form(&self) -> bool {
        self.form_key.is_some() || !self.form_properties.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormPropertyDef {
    pub id: String,
    pub name: Option<String>,
    pub kind: FormPropertyKind,
    /// Process variable backing the property; defaults to `id`.
    pub variable: Option<String>,
    pub readable: bool,
    pub writable: bool,
    pub required: bool,
    pub date_pattern: Option<String>,
    pub enum_values: Vec<(String, String)>,
}

impl FormPropertyDef {
    pub fn new(id: impl Into<String>, kind: FormPropertyKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            variable: None,
            readable: true,
            writable: true,
            required: false,
            date_pattern: None,
            enum_values: Vec::new(),
        }
    }

    pub fn variable_name(&self) -> &str {
        self.variable.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelIssue {
    pub element: String,
    pub message: String,
}

impl fmt::Display for ModelIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.element, self.message)
    }
}

/// Name bound by a `${name}` delegate expression.
pub fn delegate_name(expression: &str) -> Option<&str> {
    let trimmed = expression.trim();
    let inner = trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(trimmed)
        .trim();
    let valid = !inner.is_empty()
        && inner
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.');
    valid.then_some(inner)
}

impl ProcessModel {
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn flow(&self, id: &str) -> Option<&SequenceFlow> {
        self.flows.iter().find(|f| f.id == id)
    }

    /// Outgoing flows of `node_id` in document order.
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a SequenceFlow> + 'a {
        self.flows.iter().filter(move |f| f.source == node_id)
    }

    pub fn start_node(&self) -> Option<&FlowNode> {
        self.nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::StartEvent))
    }

    pub fn user_task(&self, id: &str) -> Option<&UserTaskDef> {
        match self.node(id).map(|n| &n.kind) {
            Some(NodeKind::UserTask(def)) => Some(def),
            _ => None,
        }
    }

    // ── Validation ──

    pub fn validate(&self) -> Vec<ModelIssue> {
        let mut issues = Vec::new();
        let mut push = |element: &str, message: String| {
            issues.push(ModelIssue {
                element: element.to_string(),
                message,
            })
        };

        if self.key.trim().is_empty() {
            push("process", "process id must not be blank".into());
        }

        let starts = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::StartEvent))
            .count();
        if starts != 1 {
            push(&self.key, format!("expected exactly one start event, found {starts}"));
        }
        if !self.nodes.iter().any(|n| matches!(n.kind, NodeKind::EndEvent)) {
            push(&self.key, "no end event".into());
        }

        let mut seen = HashSet::new();
        for id in self.nodes.iter().map(|n| &n.id).chain(self.flows.iter().map(|f| &f.id)) {
            if !seen.insert(id.as_str()) {
                push(id, "duplicate element id".into());
            }
        }

        for flow in &self.flows {
            if self.node(&flow.source).is_none() {
                push(&flow.id, format!("unknown source '{}'", flow.source));
            }
            if self.node(&flow.target).is_none() {
                push(&flow.id, format!("unknown target '{}'", flow.target));
            }
            if let Some(expr) = &flow.condition {
                if let Err(e) = Condition::parse(expr) {
                    push(&flow.id, e.to_string());
                }
            }
        }

        for node in &self.nodes {
            let outgoing = self.outgoing(&node.id).count();
            let incoming = self.flows.iter().filter(|f| f.target == node.id).count();
            match &node.kind {
                NodeKind::StartEvent if incoming > 0 => {
                    push(&node.id, "start event has incoming flows".into())
                }
                NodeKind::EndEvent if outgoing > 0 => {
                    push(&node.id, "end event has outgoing flows".into())
                }
                NodeKind::EndEvent => {}
                _ if outgoing == 0 => push(&node.id, "no outgoing sequence flow".into()),
                _ => {}
            }
            match &node.kind {
                NodeKind::ServiceTask {
                    delegate_expression,
                } if delegate_name(delegate_expression).is_none() => push(
                    &node.id,
                    format!("invalid delegate expression '{delegate_expression}'"),
                ),
                NodeKind::ExclusiveGateway {
                    default_flow: Some(default),
                } => match self.flow(default) {
                    Some(f) if f.source == node.id => {}
                    _ => push(
                        &node.id,
                        format!("default flow '{default}' does not leave this gateway"),
                    ),
                },
                NodeKind::UserTask(def) => {
                    let mut ids = HashSet::new();
                    for prop in &def.form_properties {
                        if !ids.insert(prop.id.as_str()) {
                            push(&node.id, format!("duplicate form property '{}'", prop.id));
                        }
                        if prop.kind == FormPropertyKind::Enum && prop.enum_values.is_empty() {
                            push(&node.id, format!("enum property '{}' has no values", prop.id));
                        }
                    }
                }
                _ => {}
            }
        }

        issues
    }

    pub fn ensure_valid(&self) -> Result<()> {
        let issues = self.validate();
        if issues.is_empty() {
            return Ok(());
        }
        let joined = issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        bail!("process '{}' is invalid: {}", self.key, joined)
    }

    // ── Graph views ──

    fn graph(&self) -> (DiGraph<&str, ()>, HashMap<&str, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for node in &self.nodes {
            index.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
        }
        for flow in &self.flows {
            if let (Some(&s), Some(&t)) = (index.get(flow.source.as_str()), index.get(flow.target.as_str())) {
                graph.add_edge(s, t, ());
            }
        }
        (graph, index)
    }

    /// Node ids reachable from `from` by following outgoing flows, passing
    /// through gateways but stopping at the first non-gateway node.
    pub fn next_tasks(&self, from: &str) -> BTreeSet<String> {
        let (graph, index) = self.graph();
        let mut found = BTreeSet::new();
        let Some(&start) = index.get(from) else {
            return found;
        };
        let mut visited = HashSet::new();
        self.collect_next(&graph, start, &mut visited, &mut found);
        found
    }

    fn collect_next(
        &self,
        graph: &DiGraph<&str, ()>,
        at: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        found: &mut BTreeSet<String>,
    ) {
        for target in graph.neighbors(at) {
            let id = graph[target];
            let is_gateway = self.node(id).is_some_and(|n| n.kind.is_gateway());
            if is_gateway {
                if visited.insert(target) {
                    self.collect_next(graph, target, visited, found);
                }
            } else {
                found.insert(id.to_string());
            }
        }
    }

    /// Diagram coordinates: column by breadth-first depth from the start
    /// event, row by order within the column.
    pub fn layout(&self) -> HashMap<String, (f64, f64)> {
        let (graph, index) = self.graph();
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        let mut queue = VecDeque::new();
        if let Some(start) = self.start_node().and_then(|n| index.get(n.id.as_str())) {
            depth.insert(*start, 0);
            queue.push_back(*start);
        }
        while let Some(at) = queue.pop_front() {
            let d = depth[&at];
            for next in graph.neighbors(at) {
                if let std::collections::hash_map::Entry::Vacant(e) = depth.entry(next) {
                    e.insert(d + 1);
                    queue.push_back(next);
                }
            }
        }

        let unreached = depth.values().max().map_or(0, |m| m + 1);
        let mut rows: HashMap<usize, usize> = HashMap::new();
        let mut positions = HashMap::new();
        for node in &self.nodes {
            let column = index
                .get(node.id.as_str())
                .and_then(|i| depth.get(i))
                .copied()
                .unwrap_or(unreached);
            let row = rows.entry(column).or_insert(0);
            positions.insert(
                node.id.clone(),
                (100.0 + column as f64 * 200.0, 100.0 + *row as f64 * 100.0),
            );
            *row += 1;
        }
        positions
    }
}

/// Width and height used when drawing a node.
pub fn shape_size(kind: &NodeKind) -> (f64, f64) {
    match kind {
        NodeKind::StartEvent | NodeKind::EndEvent => (30.0, 30.0),
        NodeKind::ExclusiveGateway { .. } => (40.0, 40.0),
        NodeKind::UserTask(_) | NodeKind::ServiceTask { .. } => (100.0, 80.0),
    }
}
