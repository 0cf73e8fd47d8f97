//! Classification of `remember` content
//!
//! [`classify`] is a pure function turning caller content (plus an optional
//! explicit kind) into a list of [`Classified`] items: at most one fact, at
//! most one episode, any number of entities and relationships. The memory
//! system dispatches each item to its store.
//!
//! Shape rules for JSON objects:
//!
//! - `statement` (string) makes a fact; `confidence`, `source`, `tags` and
//!   string `entities` are read alongside it
//! - `logs` (array of log entries) makes an episode; `summary` is optional
//! - `entities` items that are objects with a `name` become entities
//! - `relationships` items with `from`, `to` and `type` become relationships;
//!   endpoints naming an entity of the same content resolve to its id

use crate::error::{RmemError, RmemResult};
use crate::facts::Fact;
use crate::graph::{Entity, Relationship};
use crate::working::LogEntry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Source recorded on facts that do not name one
pub const DEFAULT_SOURCE: &str = "remember";

/// Entity type used when an entity object has no `type`
pub const DEFAULT_ENTITY_TYPE: &str = "concept";

/// Explicit kind of remembered content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Fact,
    Episode,
    Entity,
    Relationship,
    /// Store and index only; no typed record
    Raw,
}

/// An episode to be built by episodic memory
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeDraft {
    pub context_id: String,
    pub logs: Vec<LogEntry>,
    /// Caller summary; derived from the logs when absent
    pub summary: Option<String>,
}

/// One typed item extracted from content
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Fact(Fact),
    Episode(EpisodeDraft),
    Entity(Entity),
    Relationship(Relationship),
}

fn str_field<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    object.get(key).and_then(Value::as_str)
}

fn string_list(object: &Map<String, Value>, key: &str) -> Vec<String> {
    object
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn fact_from_object(object: &Map<String, Value>, context_id: Option<&str>) -> RmemResult<Fact> {
    let statement = str_field(object, "statement").ok_or_else(|| {
        RmemError::validation("statement", "must be a string", Value::Object(object.clone()).to_string())
    })?;

    let mut fact = Fact::new(statement, str_field(object, "source").unwrap_or(DEFAULT_SOURCE));
    if let Some(confidence) = object.get("confidence").and_then(Value::as_f64) {
        fact = fact.with_confidence(confidence);
    }
    for tag in string_list(object, "tags") {
        fact = fact.with_tag(tag);
    }
    if let Some(Value::Array(items)) = object.get("entities") {
        for item in items {
            let name = match item {
                Value::String(name) => Some(name.as_str()),
                Value::Object(entity) => str_field(entity, "name"),
                _ => None,
            };
            if let Some(name) = name {
                fact = fact.with_entity(name);
            }
        }
    }
    if let Some(ctx) = str_field(object, "contextId").or(context_id) {
        fact = fact.with_context(ctx);
    }

    Ok(fact)
}

fn episode_from_object(
    object: &Map<String, Value>,
    context_id: Option<&str>,
) -> RmemResult<EpisodeDraft> {
    let context_id = str_field(object, "contextId")
        .or(context_id)
        .ok_or_else(|| RmemError::validation("context_id", "required for episodes", "none"))?;

    let logs = match object.get("logs") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                serde_json::from_value::<LogEntry>(item.clone())
                    .map_err(|e| RmemError::validation("logs", "must be log entries", e.to_string()))
            })
            .collect::<RmemResult<Vec<_>>>()?,
        Some(other) => {
            return Err(RmemError::validation("logs", "must be an array", other.to_string()));
        }
        None => Vec::new(),
    };

    Ok(EpisodeDraft {
        context_id: context_id.to_string(),
        logs,
        summary: str_field(object, "summary").map(str::to_string),
    })
}

fn entity_from_object(object: &Map<String, Value>) -> Option<Entity> {
    let name = str_field(object, "name")?;
    let mut entity = Entity::new(str_field(object, "type").unwrap_or(DEFAULT_ENTITY_TYPE), name);
    if let Some(id) = str_field(object, "id") {
        entity = entity.with_id(id);
    }
    if let Some(Value::Object(properties)) = object.get("properties") {
        for (key, value) in properties {
            entity = entity.with_property(key.clone(), value.clone());
        }
    }
    Some(entity)
}

fn relationship_from_object(
    object: &Map<String, Value>,
    names: &HashMap<String, String>,
) -> RmemResult<Relationship> {
    let field = |key: &'static str| {
        str_field(object, key).ok_or_else(|| {
            RmemError::validation(key, "required for relationships", Value::Object(object.clone()).to_string())
        })
    };

    let resolve = |endpoint: &str| {
        names
            .get(&endpoint.to_lowercase())
            .cloned()
            .unwrap_or_else(|| endpoint.to_string())
    };

    let mut relationship = Relationship::new(resolve(field("from")?), resolve(field("to")?), field("type")?);
    if let Some(Value::Object(properties)) = object.get("properties") {
        for (key, value) in properties {
            relationship = relationship.with_property(key.clone(), value.clone());
        }
    }
    Ok(relationship)
}

fn graph_items(object: &Map<String, Value>) -> RmemResult<Vec<Classified>> {
    let entities: Vec<Entity> = object
        .get("entities")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_object)
                .filter_map(entity_from_object)
                .collect()
        })
        .unwrap_or_default();

    let names: HashMap<String, String> = entities
        .iter()
        .map(|e| (e.name.to_lowercase(), e.id.clone()))
        .collect();

    let mut items: Vec<Classified> = entities.into_iter().map(Classified::Entity).collect();

    if let Some(Value::Array(relationships)) = object.get("relationships") {
        for rel in relationships.iter().filter_map(Value::as_object) {
            items.push(Classified::Relationship(relationship_from_object(rel, &names)?));
        }
    }

    Ok(items)
}

fn mismatch(kind: &str, content: &Value) -> RmemError {
    RmemError::validation("content", format!("cannot be classified as {}", kind), content.to_string())
}

/// Classify content into typed items.
///
/// With an explicit `kind` the content must have the matching shape (a bare
/// string is accepted as a fact statement or an episode summary). Without
/// one, the shape rules in the module docs apply and content matching none
/// of them yields no items.
pub fn classify(
    content: &Value,
    kind: Option<MemoryKind>,
    context_id: Option<&str>,
) -> RmemResult<Vec<Classified>> {
    match (kind, content) {
        (Some(MemoryKind::Raw), _) => Ok(Vec::new()),

        (Some(MemoryKind::Fact), Value::String(statement)) => {
            let mut fact = Fact::new(statement.as_str(), DEFAULT_SOURCE);
            if let Some(ctx) = context_id {
                fact = fact.with_context(ctx);
            }
            Ok(vec![Classified::Fact(fact)])
        }
        (Some(MemoryKind::Fact), Value::Object(object)) => {
            Ok(vec![Classified::Fact(fact_from_object(object, context_id)?)])
        }

        (Some(MemoryKind::Episode), Value::String(summary)) => {
            let context_id = context_id
                .ok_or_else(|| RmemError::validation("context_id", "required for episodes", "none"))?;
            Ok(vec![Classified::Episode(EpisodeDraft {
                context_id: context_id.to_string(),
                logs: Vec::new(),
                summary: Some(summary.clone()),
            })])
        }
        (Some(MemoryKind::Episode), Value::Object(object)) => {
            Ok(vec![Classified::Episode(episode_from_object(object, context_id)?)])
        }

        (Some(MemoryKind::Entity), Value::Object(object)) => entity_from_object(object)
            .map(|e| vec![Classified::Entity(e)])
            .ok_or_else(|| mismatch("entity", content)),

        (Some(MemoryKind::Relationship), Value::Object(object)) => Ok(vec![Classified::Relationship(
            relationship_from_object(object, &HashMap::new())?,
        )]),

        (Some(kind), _) => Err(mismatch(&format!("{:?}", kind).to_lowercase(), content)),

        (None, Value::Object(object)) => {
            let mut items = Vec::new();
            if object.get("statement").is_some_and(Value::is_string) {
                items.push(Classified::Fact(fact_from_object(object, context_id)?));
            }
            if object.get("logs").is_some_and(Value::is_array) {
                items.push(Classified::Episode(episode_from_object(object, context_id)?));
            }
            items.extend(graph_items(object)?);
            Ok(items)
        }

        (None, _) => Ok(Vec::new()),
    }
}
