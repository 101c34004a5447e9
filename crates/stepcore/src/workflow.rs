use crate::condition::{Condition, MatchMode};
use crate::value::{Value, Variables};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type WorkflowId = String;
pub type NodeId = String;

/// Complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    /// Initial execution context, merged below caller input
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<WorkflowId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            variables: Variables::new(),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn add_node(&mut self, node: WorkflowNode) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    /// Add an unconditional edge
    pub fn connect(&mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) {
        self.edges.push(WorkflowEdge::new(source, target));
    }

    /// Add a conditional edge
    pub fn connect_when(
        &mut self,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        condition: Condition,
    ) {
        self.edges.push(WorkflowEdge::new(source, target).with_condition(condition));
    }

    pub fn with_node(mut self, node: WorkflowNode) -> Self {
        self.add_node(node);
        self
    }

    pub fn with_edge(mut self, edge: WorkflowEdge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn find_node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The entry point: the first `start` node in declaration order
    pub fn start_node(&self) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.kind() == NodeKind::Start)
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a WorkflowEdge> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }
}

/// Node kind, the key into the executor registry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Start,
    Action,
    Decision,
    Parallel,
    Merge,
    End,
    Loop,
    Delay,
    Condition,
    Custom(String),
}

impl NodeKind {
    pub fn as_str(&self) -> &str {
        match self {
            NodeKind::Start => "start",
            NodeKind::Action => "action",
            NodeKind::Decision => "decision",
            NodeKind::Parallel => "parallel",
            NodeKind::Merge => "merge",
            NodeKind::End => "end",
            NodeKind::Loop => "loop",
            NodeKind::Delay => "delay",
            NodeKind::Condition => "condition",
            NodeKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    Start,
    End,
    Action {
        action: String,
        #[serde(default)]
        params: Variables,
    },
    Decision {
        condition: Condition,
        #[serde(default)]
        true_nodes: Vec<NodeId>,
        #[serde(default)]
        false_nodes: Vec<NodeId>,
    },
    Parallel,
    Merge,
    Loop {
        /// Context variable holding the iteration count
        counter: String,
        max_iterations: u32,
        #[serde(default)]
        body: Vec<NodeId>,
        #[serde(default)]
        exit: Vec<NodeId>,
    },
    Delay {
        duration_ms: u64,
    },
    Condition {
        conditions: Vec<Condition>,
        #[serde(default)]
        match_mode: MatchMode,
    },
    /// Extension kind handled by an executor registered under `name`
    Custom {
        name: String,
        #[serde(default)]
        settings: Variables,
    },
}

impl NodeConfig {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeConfig::Start => NodeKind::Start,
            NodeConfig::End => NodeKind::End,
            NodeConfig::Action { .. } => NodeKind::Action,
            NodeConfig::Decision { .. } => NodeKind::Decision,
            NodeConfig::Parallel => NodeKind::Parallel,
            NodeConfig::Merge => NodeKind::Merge,
            NodeConfig::Loop { .. } => NodeKind::Loop,
            NodeConfig::Delay { .. } => NodeKind::Delay,
            NodeConfig::Condition { .. } => NodeKind::Condition,
            NodeConfig::Custom { name, .. } => NodeKind::Custom(name.clone()),
        }
    }

    /// Node ids named directly by the configuration rather than by edges
    pub fn referenced_nodes(&self) -> Vec<&NodeId> {
        match self {
            NodeConfig::Decision {
                true_nodes,
                false_nodes,
                ..
            } => true_nodes.iter().chain(false_nodes).collect(),
            NodeConfig::Loop { body, exit, .. } => body.iter().chain(exit).collect(),
            _ => Vec::new(),
        }
    }
}

/// Graph vertex
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: NodeId,
    pub name: String,
    pub config: NodeConfig,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub metadata: NodeMetadata,
}

impl WorkflowNode {
    pub fn new(id: impl Into<NodeId>, config: NodeConfig) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            config,
            position: None,
            metadata: NodeMetadata::default(),
        }
    }

    pub fn start(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeConfig::Start)
    }

    pub fn end(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeConfig::End)
    }

    pub fn action(id: impl Into<NodeId>, action: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeConfig::Action {
                action: action.into(),
                params: Variables::new(),
            },
        )
    }

    pub fn decision(
        id: impl Into<NodeId>,
        condition: Condition,
        true_nodes: Vec<NodeId>,
        false_nodes: Vec<NodeId>,
    ) -> Self {
        Self::new(
            id,
            NodeConfig::Decision {
                condition,
                true_nodes,
                false_nodes,
            },
        )
    }

    pub fn delay(id: impl Into<NodeId>, duration_ms: u64) -> Self {
        Self::new(id, NodeConfig::Delay { duration_ms })
    }

    pub fn parallel(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeConfig::Parallel)
    }

    pub fn merge(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeConfig::Merge)
    }

    pub fn kind(&self) -> NodeKind {
        self.config.kind()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set an action parameter. No effect on non-action nodes.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let NodeConfig::Action { params, .. } = &mut self.config {
            params.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.position = Some(Position { x, y });
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.metadata.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.metadata.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_error_handling(mut self, mode: ErrorHandling) -> Self {
        self.metadata.error_handling = Some(mode);
        self
    }

    pub fn with_fallback(mut self, node: impl Into<NodeId>) -> Self {
        self.metadata.error_handling = Some(ErrorHandling::Fallback);
        self.metadata.fallback_node = Some(node.into());
        self
    }
}

/// Per-node execution overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMetadata {
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub error_handling: Option<ErrorHandling>,
    pub fallback_node: Option<NodeId>,
    pub tags: Vec<String>,
}

/// Node position in visual editor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Directed connection between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(rename = "type", default)]
    pub edge_type: EdgeType,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub label: Option<String>,
}

impl WorkflowEdge {
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            edge_type: EdgeType::Default,
            condition: None,
            label: None,
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.edge_type = EdgeType::Conditional;
        self.condition = Some(condition);
        self
    }

    pub fn with_type(mut self, edge_type: EdgeType) -> Self {
        self.edge_type = edge_type;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    #[default]
    Default,
    Conditional,
    /// Followed when the source node failed under `continue`
    Error,
    /// Followed when the source node timed out under `continue`
    Timeout,
}

/// Global workflow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    pub default_timeout_ms: Option<u64>,
    pub max_retries: u32,
    /// Base delay for exponential retry backoff
    pub retry_delay_ms: u64,
    pub error_handling: ErrorHandling,
    pub persist_executions: bool,
    pub enable_logging: bool,
    pub notify_on_failure: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            max_retries: 3,
            retry_delay_ms: 1000,
            error_handling: ErrorHandling::Stop,
            persist_executions: false,
            enable_logging: true,
            notify_on_failure: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    #[default]
    Stop,
    Continue,
    Retry,
    Fallback,
}
