//! Working Memory Tests
//!
//! Concurrency and eviction behaviour of per-context working memory:
//! - Idempotent first-access creation
//! - Lock mutual exclusion on one context, independence across contexts
//! - FIFO eviction through `push`
//! - Non-transactional `set_batch` with `if_not_exists`

use rexis_memory::error::ErrorKind;
use rexis_memory::lock::ContextLockManager;
use rexis_memory::manager::{fifo_manager, FifoOptions};
use rexis_memory::storage::{
    HealthReport, InMemoryKvProvider, KeyValueProvider, KvScan, SetOptions,
};
use rexis_memory::working::{LogEntry, PushOptions, WorkingMemory};
use rexis_memory::RmemResult;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Key-value provider that counts writes to working-memory records
struct CountingKv {
    inner: InMemoryKvProvider,
    working_writes: AtomicUsize,
}

impl CountingKv {
    async fn new() -> Arc<Self> {
        let inner = InMemoryKvProvider::new();
        inner.initialize().await.unwrap();
        Arc::new(Self {
            inner,
            working_writes: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl KeyValueProvider for CountingKv {
    async fn initialize(&self) -> RmemResult<()> {
        self.inner.initialize().await
    }

    async fn close(&self) -> RmemResult<()> {
        self.inner.close().await
    }

    async fn health(&self) -> RmemResult<HealthReport> {
        self.inner.health().await
    }

    async fn get(&self, key: &str) -> RmemResult<Option<Value>> {
        // Widen the race window between the first read and the locked write
        tokio::task::yield_now().await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value, options: SetOptions) -> RmemResult<()> {
        if key.starts_with("working-memory:") {
            self.working_writes.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.set(key, value, options).await
    }

    async fn delete(&self, key: &str) -> RmemResult<bool> {
        self.inner.delete(key).await
    }

    async fn keys(&self, pattern: Option<&str>) -> RmemResult<Vec<String>> {
        self.inner.keys(pattern).await
    }

    fn scan<'a>(&'a self, pattern: Option<&'a str>) -> KvScan<'a> {
        self.inner.scan(pattern)
    }
}

async fn setup_working_memory() -> (Arc<WorkingMemory>, Arc<ContextLockManager>) {
    let kv = InMemoryKvProvider::new();
    kv.initialize().await.unwrap();
    let locks = Arc::new(ContextLockManager::new());
    (Arc::new(WorkingMemory::new(Arc::new(kv), locks.clone())), locks)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_access_creates_once() {
    let kv = CountingKv::new().await;
    let working = Arc::new(WorkingMemory::new(kv.clone(), Arc::new(ContextLockManager::new())));

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let working = working.clone();
            tokio::spawn(async move {
                if i % 2 == 0 {
                    working.get("ctx-1").await
                } else {
                    working.create("ctx-1").await
                }
            })
        })
        .collect();

    for handle in handles {
        let data = handle.await.unwrap().unwrap();
        assert!(data.is_empty());
    }

    assert_eq!(kv.working_writes.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pushes_lose_nothing() {
    let (working, locks) = setup_working_memory().await;

    let writers: Vec<_> = (0..2)
        .map(|writer| {
            let working = working.clone();
            tokio::spawn(async move {
                for i in 0..25 {
                    working
                        .push("shared", LogEntry::input(format!("w{}-{}", writer, i)), PushOptions::new())
                        .await
                        .unwrap();
                }
            })
        })
        .collect();

    for writer in writers {
        writer.await.unwrap();
    }

    let data = working.get("shared").await.unwrap();
    assert_eq!(data.inputs.len(), 50);
    assert_eq!(locks.get_locked_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_contexts_do_not_block_each_other() {
    let (working, locks) = setup_working_memory().await;

    let _held = locks.acquire(&WorkingMemory::lock_key("ctx-a")).await;

    let other = tokio::time::timeout(
        Duration::from_secs(1),
        working.push("ctx-b", LogEntry::input("independent"), PushOptions::new()),
    )
    .await;
    assert!(other.is_ok(), "push on another context must not wait");

    let blocked = tokio::time::timeout(
        Duration::from_millis(50),
        working.push("ctx-a", LogEntry::input("waits"), PushOptions::new()),
    )
    .await;
    assert!(blocked.is_err(), "push on a held context must wait");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_context_named_like_an_index_key_has_its_own_lock() {
    let (working, locks) = setup_working_memory().await;

    let _index = locks.acquire("contexts").await;
    let _episodes = locks.acquire("episodes:context:contexts").await;

    let pushed = tokio::time::timeout(
        Duration::from_secs(1),
        working.push("contexts", LogEntry::input("not the index"), PushOptions::new()),
    )
    .await;
    assert!(pushed.is_ok(), "working memory must not share the index lock");
    assert_eq!(working.get("contexts").await.unwrap().inputs.len(), 1);
}

#[tokio::test]
async fn test_push_with_fifo_manager_keeps_most_recent() {
    let (working, _) = setup_working_memory().await;
    let options = PushOptions::new().with_manager(Arc::new(fifo_manager(
        FifoOptions::new(3).preserve_inputs(3),
    )));

    for i in 0..6 {
        working
            .push("fifo", LogEntry::input(format!("m{}", i)), options.clone())
            .await
            .unwrap();
    }

    let inputs: Vec<String> = working
        .get("fifo")
        .await
        .unwrap()
        .inputs
        .iter()
        .map(LogEntry::text)
        .collect();
    assert_eq!(inputs, vec!["m3", "m4", "m5"]);
}

#[tokio::test]
async fn test_set_batch_if_not_exists_is_not_transactional() {
    let kv = InMemoryKvProvider::new();
    kv.initialize().await.unwrap();
    kv.set("B", json!("original"), SetOptions::new()).await.unwrap();

    let entries = vec![
        ("A".to_string(), json!(1)),
        ("B".to_string(), json!(2)),
        ("C".to_string(), json!(3)),
    ];
    let err = kv
        .set_batch(entries, SetOptions::new().if_not_exists())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(kv.get("A").await.unwrap(), Some(json!(1)));
    assert_eq!(kv.get("B").await.unwrap(), Some(json!("original")));
    assert_eq!(kv.get("C").await.unwrap(), None);
}
