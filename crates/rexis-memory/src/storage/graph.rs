//! Graph provider contract

use super::HealthReport;
use crate::error::RmemResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Property-graph node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Node id (generated when empty)
    pub id: String,

    /// Node type (e.g. "person", "project")
    #[serde(rename = "type")]
    pub node_type: String,

    /// Arbitrary properties
    #[serde(default)]
    pub properties: HashMap<String, Value>,

    /// Free-form labels
    #[serde(default)]
    pub labels: Vec<String>,
}

impl GraphNode {
    /// Create a node with a generated id
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            node_type: node_type.into(),
            properties: HashMap::new(),
            labels: Vec::new(),
        }
    }

    /// Use an explicit id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Add a label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }
}

/// Directed property-graph edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Edge id (generated when empty)
    pub id: String,

    /// Source node id
    pub from: String,

    /// Target node id
    pub to: String,

    /// Relationship type
    #[serde(rename = "type")]
    pub edge_type: String,

    /// Arbitrary properties
    #[serde(default)]
    pub properties: HashMap<String, Value>,
}

impl GraphEdge {
    /// Create an edge with a generated id
    pub fn new(from: impl Into<String>, to: impl Into<String>, edge_type: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            edge_type: edge_type.into(),
            properties: HashMap::new(),
        }
    }

    /// Set a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// The endpoint opposite to `node_id`, if the edge touches it
    pub fn other_end(&self, node_id: &str) -> Option<&str> {
        if self.from == node_id {
            Some(&self.to)
        } else if self.to == node_id {
            Some(&self.from)
        } else {
            None
        }
    }
}

/// Edge direction relative to a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Edges leaving the node
    Outgoing,
    /// Edges entering the node
    Incoming,
    /// Either way
    #[default]
    Both,
}

/// Node filter: type, label-set intersection and property equality
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeFilter {
    /// Required node type
    pub node_type: Option<String>,

    /// Every label here must be present on the node
    #[serde(default)]
    pub labels: Vec<String>,

    /// Every property here must be equal on the node
    #[serde(default)]
    pub properties: HashMap<String, Value>,
}

impl NodeFilter {
    /// Match everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a node type
    pub fn of_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    /// Require a label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    /// Require a property value
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Whether a node satisfies the filter
    pub fn matches(&self, node: &GraphNode) -> bool {
        if let Some(node_type) = &self.node_type {
            if &node.node_type != node_type {
                return false;
            }
        }

        if !self.labels.iter().all(|l| node.labels.contains(l)) {
            return false;
        }

        self.properties
            .iter()
            .all(|(k, v)| node.properties.get(k) == Some(v))
    }
}

/// Breadth-first traversal parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraverseOptions {
    /// Start node id
    pub start: String,

    /// Maximum hop count
    pub max_depth: usize,

    /// Which edges to follow
    pub direction: Direction,

    /// Only follow edges of these types (all when empty)
    #[serde(default)]
    pub edge_types: Vec<String>,

    /// Only report (and expand) nodes matching this filter
    pub filter: Option<NodeFilter>,
}

impl TraverseOptions {
    /// Traverse from `start` up to `max_depth` hops in both directions
    pub fn new(start: impl Into<String>, max_depth: usize) -> Self {
        Self {
            start: start.into(),
            max_depth,
            direction: Direction::Both,
            edge_types: Vec::new(),
            filter: None,
        }
    }

    /// Set the direction
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Restrict followed edge types
    pub fn with_edge_type(mut self, edge_type: impl Into<String>) -> Self {
        self.edge_types.push(edge_type.into());
        self
    }

    /// Restrict visited nodes
    pub fn with_filter(mut self, filter: NodeFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Path returned by [`GraphProvider::shortest_path`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphPath {
    /// Nodes from start to end, inclusive
    pub nodes: Vec<GraphNode>,

    /// Edges connecting consecutive nodes
    pub edges: Vec<GraphEdge>,
}

impl GraphPath {
    /// Number of hops
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether start and end are the same node
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Graph storage backend.
///
/// Edges must never reference a missing node; deleting a node removes every
/// edge touching it.
#[async_trait::async_trait]
pub trait GraphProvider: Send + Sync {
    /// Provider name used in logs and errors
    fn name(&self) -> &'static str {
        "graph"
    }

    /// Prepare the backend for use
    async fn initialize(&self) -> RmemResult<()>;

    /// Release backend resources
    async fn close(&self) -> RmemResult<()>;

    /// Report backend health
    async fn health(&self) -> RmemResult<HealthReport>;

    /// Insert or replace a node, returning its id
    async fn add_node(&self, node: GraphNode) -> RmemResult<String>;

    /// Read a node
    async fn get_node(&self, id: &str) -> RmemResult<Option<GraphNode>>;

    /// Merge properties into a node (labels are replaced when `Some`)
    async fn update_node(
        &self,
        id: &str,
        properties: HashMap<String, Value>,
        labels: Option<Vec<String>>,
    ) -> RmemResult<GraphNode>;

    /// Delete a node and every edge touching it
    async fn delete_node(&self, id: &str) -> RmemResult<bool>;

    /// Insert an edge between two existing nodes, returning its id
    async fn add_edge(&self, edge: GraphEdge) -> RmemResult<String>;

    /// Read an edge
    async fn get_edge(&self, id: &str) -> RmemResult<Option<GraphEdge>>;

    /// Delete an edge
    async fn delete_edge(&self, id: &str) -> RmemResult<bool>;

    /// Edges touching a node in the given direction
    async fn get_edges(&self, node_id: &str, direction: Direction) -> RmemResult<Vec<GraphEdge>>;

    /// Nodes matching a filter
    async fn find_nodes(&self, filter: &NodeFilter) -> RmemResult<Vec<GraphNode>>;

    /// Breadth-first traversal; the start node is not included
    async fn traverse(&self, options: &TraverseOptions) -> RmemResult<Vec<GraphNode>>;

    /// Breadth-first shortest path
    async fn shortest_path(
        &self,
        from: &str,
        to: &str,
        direction: Direction,
    ) -> RmemResult<Option<GraphPath>>;
}
