//! # Storage Providers
//!
//! Backend contracts the memory engine is built on. Three independent
//! provider kinds exist:
//!
//! - **Key-value**: records, indexes and snapshots ([`KeyValueProvider`])
//! - **Vector**: similarity search over indexed text ([`VectorProvider`])
//! - **Graph**: entities and relationships ([`GraphProvider`])
//!
//! Any conforming backend (embedded, networked or in-memory) can be plugged in
//! without engine changes. The [`in_memory`] module holds the reference
//! implementations used by default and in tests.

pub mod graph;
pub mod in_memory;
pub mod kv;
pub mod vector;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use graph::{
    Direction, GraphEdge, GraphNode, GraphPath, GraphProvider, NodeFilter, TraverseOptions,
};
pub use in_memory::{InMemoryGraphProvider, InMemoryKvProvider, InMemoryVectorProvider};
pub use kv::{glob_to_regex, KeyValueProvider, KvScan, SetOptions};
pub use vector::{
    DocumentPatch, Metadata, VectorDocument, VectorProvider, VectorQuery, VectorSearchResult,
};

/// Provider health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational
    Healthy,
    /// Not usable
    Unhealthy,
    /// Usable with reduced functionality
    Degraded,
}

/// Result of a provider health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,

    /// Optional human-readable detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Backend specific figures (entry counts and the like)
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl HealthReport {
    /// Healthy report
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
            details: HashMap::new(),
        }
    }

    /// Unhealthy report with a reason
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            details: HashMap::new(),
        }
    }

    /// Degraded report with a reason
    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            details: HashMap::new(),
        }
    }

    /// Attach a detail value
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Whether the backend can serve requests
    pub fn is_usable(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }
}
