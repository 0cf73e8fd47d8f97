use super::ReadyFlag;
use crate::error::{RmemError, RmemResult};
use crate::storage::graph::{
    Direction, GraphEdge, GraphNode, GraphPath, GraphProvider, NodeFilter, TraverseOptions,
};
use crate::storage::HealthReport;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

const PROVIDER: &str = "graph";

#[derive(Debug, Default)]
struct GraphState {
    nodes: HashMap<String, GraphNode>,
    edges: HashMap<String, GraphEdge>,
    /// node id -> ids of edges touching it
    adjacency: HashMap<String, HashSet<String>>,
}

impl GraphState {
    /// Edges touching `node_id` in `direction`, paired with the neighbor id,
    /// ordered by edge id
    fn neighbors(
        &self,
        node_id: &str,
        direction: Direction,
        edge_types: &[String],
    ) -> Vec<(&GraphEdge, String)> {
        let Some(edge_ids) = self.adjacency.get(node_id) else {
            return Vec::new();
        };

        let mut result: Vec<(&GraphEdge, String)> = edge_ids
            .iter()
            .filter_map(|eid| self.edges.get(eid))
            .filter(|e| edge_types.is_empty() || edge_types.contains(&e.edge_type))
            .filter_map(|e| {
                let neighbor = match direction {
                    Direction::Outgoing if e.from == node_id => Some(e.to.clone()),
                    Direction::Incoming if e.to == node_id => Some(e.from.clone()),
                    Direction::Both => e.other_end(node_id).map(String::from),
                    _ => None,
                };
                neighbor.map(|n| (e, n))
            })
            .collect();

        result.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        result
    }

    fn detach_edge(&mut self, edge: &GraphEdge) {
        for endpoint in [&edge.from, &edge.to] {
            if let Some(set) = self.adjacency.get_mut(endpoint) {
                set.remove(&edge.id);
            }
        }
    }
}

/// Graph provider backed by process-local adjacency maps
#[derive(Debug, Default)]
pub struct InMemoryGraphProvider {
    state: RwLock<GraphState>,
    ready: ReadyFlag,
}

impl InMemoryGraphProvider {
    /// Create an uninitialized provider
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl GraphProvider for InMemoryGraphProvider {
    async fn initialize(&self) -> RmemResult<()> {
        self.ready.set(true);
        tracing::debug!(provider = PROVIDER, "In-memory graph provider initialized");
        Ok(())
    }

    async fn close(&self) -> RmemResult<()> {
        self.ready.set(false);
        Ok(())
    }

    async fn health(&self) -> RmemResult<HealthReport> {
        if !self.ready.is_ready() {
            return Ok(HealthReport::unhealthy("not initialized"));
        }
        let state = self.state.read();
        Ok(HealthReport::healthy()
            .with_detail("nodes", state.nodes.len())
            .with_detail("edges", state.edges.len()))
    }

    async fn add_node(&self, mut node: GraphNode) -> RmemResult<String> {
        self.ready.ensure(PROVIDER)?;

        if node.id.is_empty() {
            node.id = uuid::Uuid::new_v4().to_string();
        }
        let id = node.id.clone();

        let mut state = self.state.write();
        state.adjacency.entry(id.clone()).or_default();
        state.nodes.insert(id.clone(), node);

        Ok(id)
    }

    async fn get_node(&self, id: &str) -> RmemResult<Option<GraphNode>> {
        self.ready.ensure(PROVIDER)?;
        Ok(self.state.read().nodes.get(id).cloned())
    }

    async fn update_node(
        &self,
        id: &str,
        properties: HashMap<String, Value>,
        labels: Option<Vec<String>>,
    ) -> RmemResult<GraphNode> {
        self.ready.ensure(PROVIDER)?;

        let mut state = self.state.write();
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| RmemError::not_found("node", id))?;

        node.properties.extend(properties);
        if let Some(labels) = labels {
            node.labels = labels;
        }

        Ok(node.clone())
    }

    async fn delete_node(&self, id: &str) -> RmemResult<bool> {
        self.ready.ensure(PROVIDER)?;

        let mut state = self.state.write();
        if state.nodes.remove(id).is_none() {
            return Ok(false);
        }

        let edge_ids = state.adjacency.remove(id).unwrap_or_default();
        for edge_id in edge_ids {
            if let Some(edge) = state.edges.remove(&edge_id) {
                state.detach_edge(&edge);
            }
        }

        Ok(true)
    }

    async fn add_edge(&self, mut edge: GraphEdge) -> RmemResult<String> {
        self.ready.ensure(PROVIDER)?;

        if edge.id.is_empty() {
            edge.id = uuid::Uuid::new_v4().to_string();
        }

        let mut state = self.state.write();
        for endpoint in [&edge.from, &edge.to] {
            if !state.nodes.contains_key(endpoint) {
                return Err(RmemError::not_found("node", endpoint.clone()));
            }
        }

        if let Some(previous) = state.edges.remove(&edge.id) {
            state.detach_edge(&previous);
        }

        let id = edge.id.clone();
        state.adjacency.entry(edge.from.clone()).or_default().insert(id.clone());
        state.adjacency.entry(edge.to.clone()).or_default().insert(id.clone());
        state.edges.insert(id.clone(), edge);

        Ok(id)
    }

    async fn get_edge(&self, id: &str) -> RmemResult<Option<GraphEdge>> {
        self.ready.ensure(PROVIDER)?;
        Ok(self.state.read().edges.get(id).cloned())
    }

    async fn delete_edge(&self, id: &str) -> RmemResult<bool> {
        self.ready.ensure(PROVIDER)?;

        let mut state = self.state.write();
        match state.edges.remove(id) {
            Some(edge) => {
                state.detach_edge(&edge);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_edges(&self, node_id: &str, direction: Direction) -> RmemResult<Vec<GraphEdge>> {
        self.ready.ensure(PROVIDER)?;

        let state = self.state.read();
        Ok(state
            .neighbors(node_id, direction, &[])
            .into_iter()
            .map(|(edge, _)| edge.clone())
            .collect())
    }

    async fn find_nodes(&self, filter: &NodeFilter) -> RmemResult<Vec<GraphNode>> {
        self.ready.ensure(PROVIDER)?;

        let state = self.state.read();
        let mut nodes: Vec<GraphNode> = state
            .nodes
            .values()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(nodes)
    }

    async fn traverse(&self, options: &TraverseOptions) -> RmemResult<Vec<GraphNode>> {
        self.ready.ensure(PROVIDER)?;

        let state = self.state.read();
        if !state.nodes.contains_key(&options.start) {
            return Err(RmemError::not_found("node", options.start.clone()));
        }

        let mut visited: HashSet<String> = HashSet::from([options.start.clone()]);
        let mut queue: VecDeque<(String, usize)> = VecDeque::from([(options.start.clone(), 0)]);
        let mut reached = Vec::new();

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= options.max_depth {
                continue;
            }

            for (_, neighbor) in state.neighbors(&current, options.direction, &options.edge_types) {
                if !visited.insert(neighbor.clone()) {
                    continue;
                }
                let Some(node) = state.nodes.get(&neighbor) else {
                    continue;
                };
                if let Some(filter) = &options.filter {
                    if !filter.matches(node) {
                        continue;
                    }
                }
                reached.push(node.clone());
                queue.push_back((neighbor, depth + 1));
            }
        }

        Ok(reached)
    }

    async fn shortest_path(
        &self,
        from: &str,
        to: &str,
        direction: Direction,
    ) -> RmemResult<Option<GraphPath>> {
        self.ready.ensure(PROVIDER)?;

        let state = self.state.read();
        let (Some(start), Some(_)) = (state.nodes.get(from), state.nodes.get(to)) else {
            return Ok(None);
        };

        if from == to {
            return Ok(Some(GraphPath {
                nodes: vec![start.clone()],
                edges: Vec::new(),
            }));
        }

        // node -> (previous node, edge used to reach it)
        let mut parents: HashMap<String, (String, String)> = HashMap::new();
        let mut visited: HashSet<String> = HashSet::from([from.to_string()]);
        let mut queue: VecDeque<String> = VecDeque::from([from.to_string()]);
        let mut found = false;

        while let Some(current) = queue.pop_front() {
            for (edge, neighbor) in state.neighbors(&current, direction, &[]) {
                if !visited.insert(neighbor.clone()) {
                    continue;
                }
                parents.insert(neighbor.clone(), (current.clone(), edge.id.clone()));
                if neighbor == to {
                    found = true;
                    break;
                }
                queue.push_back(neighbor);
            }
            if found {
                break;
            }
        }

        if !found {
            return Ok(None);
        }

        let mut node_ids = vec![to.to_string()];
        let mut edge_ids = Vec::new();
        let mut cursor = to.to_string();
        while let Some((prev, edge_id)) = parents.get(&cursor) {
            edge_ids.push(edge_id.clone());
            node_ids.push(prev.clone());
            cursor = prev.clone();
        }
        node_ids.reverse();
        edge_ids.reverse();

        Ok(Some(GraphPath {
            nodes: node_ids
                .iter()
                .filter_map(|id| state.nodes.get(id).cloned())
                .collect(),
            edges: edge_ids
                .iter()
                .filter_map(|id| state.edges.get(id).cloned())
                .collect(),
        }))
    }
}
