//! Lifecycle events of the memory system
//!
//! Events go to synchronous listeners first, in registration order, and then
//! to the broadcast channel, before the emitting call returns. Publishing with
//! no subscribers is a no-op.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default broadcast capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something that happened inside the memory system
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum MemoryEvent {
    Initialized {
        degraded: bool,
    },
    BeforeRemember {
        key: Option<String>,
    },
    AfterRemember {
        key: Option<String>,
        stored: usize,
    },
    BeforeRecall {
        query: String,
    },
    AfterRecall {
        query: String,
        results: usize,
    },
    BeforeForget,
    AfterForget {
        deleted: usize,
    },
    Closed,
    #[serde(rename = "kv.stored")]
    KvStored {
        key: String,
    },
    #[serde(rename = "vector.stored")]
    VectorStored {
        id: String,
    },
    #[serde(rename = "fact.stored")]
    FactStored {
        id: String,
    },
    #[serde(rename = "episode.stored")]
    EpisodeStored {
        id: String,
        context_id: String,
    },
    #[serde(rename = "entity.stored")]
    EntityStored {
        id: String,
    },
    #[serde(rename = "relationship.stored")]
    RelationshipStored {
        id: String,
    },
}

impl MemoryEvent {
    /// Stable event name
    pub fn name(&self) -> &'static str {
        match self {
            MemoryEvent::Initialized { .. } => "initialized",
            MemoryEvent::BeforeRemember { .. } => "beforeRemember",
            MemoryEvent::AfterRemember { .. } => "afterRemember",
            MemoryEvent::BeforeRecall { .. } => "beforeRecall",
            MemoryEvent::AfterRecall { .. } => "afterRecall",
            MemoryEvent::BeforeForget => "beforeForget",
            MemoryEvent::AfterForget { .. } => "afterForget",
            MemoryEvent::Closed => "closed",
            MemoryEvent::KvStored { .. } => "kv.stored",
            MemoryEvent::VectorStored { .. } => "vector.stored",
            MemoryEvent::FactStored { .. } => "fact.stored",
            MemoryEvent::EpisodeStored { .. } => "episode.stored",
            MemoryEvent::EntityStored { .. } => "entity.stored",
            MemoryEvent::RelationshipStored { .. } => "relationship.stored",
        }
    }
}

/// Synchronous event listener
pub type EventListener = Arc<dyn Fn(&MemoryEvent) + Send + Sync>;

/// Listener registry plus broadcast channel
pub struct EventBus {
    listeners: RwLock<Vec<EventListener>>,
    sender: broadcast::Sender<MemoryEvent>,
}

impl EventBus {
    /// Create a bus with the given broadcast capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            sender,
        }
    }

    /// Register a synchronous listener
    pub fn on(&self, listener: impl Fn(&MemoryEvent) + Send + Sync + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Receive every future event
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.sender.subscribe()
    }

    /// Deliver an event to listeners, then subscribers
    pub fn emit(&self, event: MemoryEvent) {
        // Listeners may register more listeners; call outside the lock
        let listeners: Vec<EventListener> = self.listeners.read().clone();
        for listener in &listeners {
            listener(&event);
        }

        tracing::trace!(event = event.name(), "Memory event");
        let _ = self.sender.send(event);
    }

    /// Number of synchronous listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
