//! Graph memory - entities and the relationships between them
//!
//! A thin typed layer over a [`GraphProvider`]. Entities are nodes labelled
//! `entity` carrying their display name in the `name` property; relationships
//! are edges. Removing an entity removes every relationship touching it.

use crate::error::{RmemError, RmemResult};
use crate::storage::{Direction, GraphEdge, GraphNode, GraphPath, GraphProvider, Metadata, NodeFilter, TraverseOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

const ENTITY_LABEL: &str = "entity";
const NAME_PROPERTY: &str = "name";

/// A named thing the agent knows about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique identifier
    pub id: String,

    /// Entity category ("person", "project", ...)
    #[serde(rename = "type")]
    pub entity_type: String,

    /// Display name
    pub name: String,

    /// Additional properties
    #[serde(default)]
    pub properties: Metadata,
}

impl Entity {
    /// Create an entity with a generated id
    pub fn new(entity_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: entity_type.into(),
            name: name.into(),
            properties: Metadata::new(),
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

    fn into_node(self) -> GraphNode {
        let mut node = GraphNode::new(self.entity_type)
            .with_id(self.id)
            .with_label(ENTITY_LABEL);
        node.properties = self.properties;
        node.properties
            .insert(NAME_PROPERTY.to_string(), Value::String(self.name));
        node
    }

    fn from_node(mut node: GraphNode) -> Self {
        let name = match node.properties.remove(NAME_PROPERTY) {
            Some(Value::String(name)) => name,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        Self {
            id: node.id,
            entity_type: node.node_type,
            name,
            properties: node.properties,
        }
    }
}

/// A typed, directed link between two entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Unique identifier
    pub id: String,

    /// Source entity id
    pub from: String,

    /// Target entity id
    pub to: String,

    /// Relationship type ("works_on", "knows", ...)
    #[serde(rename = "type")]
    pub relation_type: String,

    /// Additional properties
    #[serde(default)]
    pub properties: Metadata,
}

impl Relationship {
    /// Create a relationship with a generated id
    pub fn new(from: impl Into<String>, to: impl Into<String>, relation_type: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            relation_type: relation_type.into(),
            properties: Metadata::new(),
        }
    }

    /// Set a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

impl From<GraphEdge> for Relationship {
    fn from(edge: GraphEdge) -> Self {
        Self {
            id: edge.id,
            from: edge.from,
            to: edge.to,
            relation_type: edge.edge_type,
            properties: edge.properties,
        }
    }
}

impl From<Relationship> for GraphEdge {
    fn from(rel: Relationship) -> Self {
        let mut edge = GraphEdge::new(rel.from, rel.to, rel.relation_type);
        edge.id = rel.id;
        edge.properties = rel.properties;
        edge
    }
}

/// A neighbor reached through one relationship
#[derive(Debug, Clone)]
pub struct RelatedEntity {
    pub entity: Entity,
    pub relationship: Relationship,
}

/// Entity/relationship memory over a graph backend
pub struct GraphMemory {
    graph: Arc<dyn GraphProvider>,
}

impl GraphMemory {
    /// Create graph memory
    pub fn new(graph: Arc<dyn GraphProvider>) -> Self {
        Self { graph }
    }

    /// Insert or replace an entity
    pub async fn add_entity(&self, entity: Entity) -> RmemResult<Entity> {
        if entity.name.trim().is_empty() {
            return Err(RmemError::validation("name", "must not be empty", "\"\""));
        }

        let id = self.graph.add_node(entity.clone().into_node()).await?;
        tracing::debug!(entity_id = %id, entity_type = %entity.entity_type, "Entity stored");

        Ok(Entity { id, ..entity })
    }

    /// Read an entity
    pub async fn get_entity(&self, id: &str) -> RmemResult<Option<Entity>> {
        Ok(self
            .graph
            .get_node(id)
            .await?
            .filter(|node| node.labels.iter().any(|l| l == ENTITY_LABEL))
            .map(Entity::from_node))
    }

    /// Entities by type and/or case-insensitive name
    pub async fn find_entities(
        &self,
        entity_type: Option<&str>,
        name: Option<&str>,
    ) -> RmemResult<Vec<Entity>> {
        let mut filter = NodeFilter::new().with_label(ENTITY_LABEL);
        if let Some(entity_type) = entity_type {
            filter = filter.of_type(entity_type);
        }

        let mut entities: Vec<Entity> = self
            .graph
            .find_nodes(&filter)
            .await?
            .into_iter()
            .map(Entity::from_node)
            .filter(|e| name.map_or(true, |n| e.name.eq_ignore_ascii_case(n)))
            .collect();

        entities.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(entities)
    }

    /// Link two existing entities
    pub async fn add_relationship(&self, relationship: Relationship) -> RmemResult<Relationship> {
        if relationship.relation_type.trim().is_empty() {
            return Err(RmemError::validation("type", "must not be empty", "\"\""));
        }
        for endpoint in [&relationship.from, &relationship.to] {
            if self.get_entity(endpoint).await?.is_none() {
                return Err(RmemError::not_found("entity", endpoint.as_str()));
            }
        }

        let id = self.graph.add_edge(relationship.clone().into()).await?;
        tracing::debug!(
            relationship_id = %id,
            from = %relationship.from,
            to = %relationship.to,
            relation_type = %relationship.relation_type,
            "Relationship stored"
        );

        Ok(Relationship { id, ..relationship })
    }

    /// Entities one hop away, optionally restricted to one relationship type
    pub async fn find_related(
        &self,
        id: &str,
        relation_type: Option<&str>,
        direction: Direction,
    ) -> RmemResult<Vec<RelatedEntity>> {
        let edges = self.graph.get_edges(id, direction).await?;

        let mut related = Vec::new();
        for edge in edges {
            if relation_type.is_some_and(|t| t != edge.edge_type) {
                continue;
            }
            let Some(other) = edge.other_end(id).map(str::to_string) else {
                continue;
            };
            if let Some(entity) = self.get_entity(&other).await? {
                related.push(RelatedEntity {
                    entity,
                    relationship: edge.into(),
                });
            }
        }

        Ok(related)
    }

    /// Entities reachable within `depth` hops
    pub async fn neighborhood(&self, id: &str, depth: usize) -> RmemResult<Vec<Entity>> {
        let options = TraverseOptions::new(id, depth)
            .with_filter(NodeFilter::new().with_label(ENTITY_LABEL));

        Ok(self
            .graph
            .traverse(&options)
            .await?
            .into_iter()
            .map(Entity::from_node)
            .collect())
    }

    /// Remove an entity and every relationship touching it
    pub async fn remove_entity(&self, id: &str) -> RmemResult<bool> {
        let removed = self.graph.delete_node(id).await?;
        if removed {
            tracing::debug!(entity_id = %id, "Entity removed");
        }
        Ok(removed)
    }

    /// Remove one relationship
    pub async fn remove_relationship(&self, id: &str) -> RmemResult<bool> {
        self.graph.delete_edge(id).await
    }

    /// Shortest undirected path between two entities
    pub async fn find_path(&self, from: &str, to: &str) -> RmemResult<Option<GraphPath>> {
        self.graph.shortest_path(from, to, Direction::Both).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::InMemoryGraphProvider;

    async fn memory() -> GraphMemory {
        let graph = Arc::new(InMemoryGraphProvider::new());
        graph.initialize().await.unwrap();
        GraphMemory::new(graph)
    }

    #[tokio::test]
    async fn test_entities_roundtrip_and_find() {
        let graph = memory().await;
        let alice = graph
            .add_entity(Entity::new("person", "Alice").with_property("role", "engineer"))
            .await
            .unwrap();
        graph.add_entity(Entity::new("project", "Rexis")).await.unwrap();

        let stored = graph.get_entity(&alice.id).await.unwrap().unwrap();
        assert_eq!(stored, alice);

        let people = graph.find_entities(Some("person"), None).await.unwrap();
        assert_eq!(people.len(), 1);
        let by_name = graph.find_entities(None, Some("rexis")).await.unwrap();
        assert_eq!(by_name[0].entity_type, "project");
    }

    #[tokio::test]
    async fn test_relationship_requires_entities() {
        let graph = memory().await;
        let alice = graph.add_entity(Entity::new("person", "Alice")).await.unwrap();

        let err = graph
            .add_relationship(Relationship::new(&alice.id, "ghost", "knows"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = graph
            .add_relationship(Relationship::new(&alice.id, &alice.id, " "))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_find_related_by_type_and_direction() {
        let graph = memory().await;
        let alice = graph.add_entity(Entity::new("person", "Alice")).await.unwrap();
        let bob = graph.add_entity(Entity::new("person", "Bob")).await.unwrap();
        let rexis = graph.add_entity(Entity::new("project", "Rexis")).await.unwrap();

        graph.add_relationship(Relationship::new(&alice.id, &bob.id, "knows")).await.unwrap();
        graph.add_relationship(Relationship::new(&alice.id, &rexis.id, "works_on")).await.unwrap();

        let all = graph.find_related(&alice.id, None, Direction::Outgoing).await.unwrap();
        assert_eq!(all.len(), 2);

        let projects = graph
            .find_related(&alice.id, Some("works_on"), Direction::Both)
            .await
            .unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].entity.name, "Rexis");

        let incoming = graph.find_related(&bob.id, None, Direction::Incoming).await.unwrap();
        assert_eq!(incoming[0].entity.id, alice.id);
        assert!(graph.find_related(&bob.id, None, Direction::Outgoing).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_entity_cascades() {
        let graph = memory().await;
        let alice = graph.add_entity(Entity::new("person", "Alice")).await.unwrap();
        let bob = graph.add_entity(Entity::new("person", "Bob")).await.unwrap();
        let rel = graph
            .add_relationship(Relationship::new(&alice.id, &bob.id, "knows"))
            .await
            .unwrap();

        assert!(graph.remove_entity(&bob.id).await.unwrap());
        assert!(graph.find_related(&alice.id, None, Direction::Both).await.unwrap().is_empty());
        assert!(!graph.remove_relationship(&rel.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_path_and_neighborhood() {
        let graph = memory().await;
        let a = graph.add_entity(Entity::new("person", "A")).await.unwrap();
        let b = graph.add_entity(Entity::new("person", "B")).await.unwrap();
        let c = graph.add_entity(Entity::new("person", "C")).await.unwrap();
        graph.add_relationship(Relationship::new(&a.id, &b.id, "knows")).await.unwrap();
        graph.add_relationship(Relationship::new(&c.id, &b.id, "knows")).await.unwrap();

        let path = graph.find_path(&a.id, &c.id).await.unwrap().unwrap();
        assert_eq!(path.nodes.len(), 3);
        assert_eq!(path.edges.len(), 2);

        assert_eq!(graph.neighborhood(&a.id, 1).await.unwrap().len(), 1);
        assert_eq!(graph.neighborhood(&a.id, 2).await.unwrap().len(), 2);
    }
}
