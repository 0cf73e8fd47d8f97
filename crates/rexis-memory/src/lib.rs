//! # Rexis Memory - Memory Engine for Autonomous Agents
//!
//! **Rexis Memory** gives an agent layered, persistent memory over pluggable
//! storage:
//!
//! - **Working Memory**: Per-context scratchpad of inputs, outputs, thoughts
//!   and action traffic, bounded by memory-manager policies
//! - **Episodic Memory**: Bounded interaction episodes, detected as they
//!   happen and searchable by similarity
//! - **Facts**: Confidence-scored statements with tags, entities and
//!   verification against neighbours
//! - **Semantic Memory**: Concepts and action patterns learned from outcomes
//! - **Graph Memory**: Entities and typed relationships
//!
//! [`MemorySystem`] ties them together behind `remember`, `recall` and
//! `forget`, with middleware hooks and lifecycle events.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rexis_memory::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> RmemResult<()> {
//!     let memory = MemorySystem::new(MemoryConfig::in_memory());
//!     memory.initialize().await?;
//!
//!     memory
//!         .remember(json!({"statement": "The deploy window is Friday"}), RememberOptions::new())
//!         .await?;
//!
//!     for result in memory.recall("deploy window", RecallOptions::new()).await? {
//!         println!("{:?} {}", result.result_type, result.content);
//!     }
//!
//!     memory.close().await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!               MemorySystem
//!     (middleware chain + event bus)
//!                   |
//!   +-------+-------+-------+---------+
//!   |       |       |       |         |
//! Working Episodic Facts Semantic   Graph
//!   |       |       |       |         |
//!   +---+---+---+---+-------+         |
//!       |       |                     |
//!      KV    Vector                 Graph
//!           (storage providers)
//! ```

#![doc(html_root_url = "https://docs.rs/rexis-memory/0.1.0")]

pub mod classify;
pub mod compression;
pub mod config;
pub mod contexts;
pub mod embedding;
pub mod episodic;
pub mod error;
pub mod events;
pub mod facts;
pub mod graph;
pub mod lock;
pub mod manager;
pub mod middleware;
pub mod recall;
pub mod semantic;
pub mod storage;
pub mod system;
pub mod telemetry;
pub mod working;

pub use config::{MemoryConfig, MemorySettings};
pub use error::{ErrorKind, RmemError, RmemResult};
pub use events::MemoryEvent;
pub use middleware::Middleware;
pub use recall::{MemoryResult, RecallOptions, RecallWeighting, ResultType};
pub use system::{ForgetCriteria, MemorySystem, RememberOptions, RememberReceipt, StoredMemory};

/// Commonly used types and traits
pub mod prelude {
    pub use crate::classify::MemoryKind;
    pub use crate::config::{MemoryConfig, MemorySettings};
    pub use crate::episodic::{Episode, EpisodeHooks, EpisodeType, EpisodicMemory};
    pub use crate::error::{ErrorKind, RmemError, RmemResult};
    pub use crate::events::MemoryEvent;
    pub use crate::facts::{Fact, FactStore};
    pub use crate::graph::{Entity, GraphMemory, Relationship};
    pub use crate::manager::{fifo_manager, FifoOptions, MemoryManager};
    pub use crate::middleware::Middleware;
    pub use crate::recall::{MemoryResult, RecallOptions, RecallWeighting, ResultType};
    pub use crate::semantic::{Pattern, SemanticMemory};
    pub use crate::storage::{
        Direction, GraphProvider, InMemoryGraphProvider, InMemoryKvProvider, InMemoryVectorProvider,
        KeyValueProvider, VectorProvider,
    };
    pub use crate::system::{ForgetCriteria, MemorySystem, RememberOptions, RememberReceipt};
    pub use crate::working::{LogEntry, LogRef, PushOptions, WorkingMemory, WorkingMemoryData};
}
