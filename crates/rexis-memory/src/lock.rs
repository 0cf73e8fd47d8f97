//! Per-context mutual exclusion
//!
//! Every read-modify-write against one context's working memory runs under
//! that context's lock. Locks are created on first use and dropped again once
//! the last holder and waiter are gone, so the table never grows unbounded.
//!
//! The manager is an ordinary value: construct one per engine and share it
//! through an `Arc`.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
struct LockSlot {
    mutex: Arc<Mutex<()>>,
    /// Holders plus waiters; the slot is removable at zero
    users: AtomicUsize,
}

type SlotTable = Arc<DashMap<String, Arc<LockSlot>>>;

/// Registration on a slot; unregisters (and reclaims the slot) on drop,
/// including when an acquire future is cancelled while waiting
struct SlotLease {
    key: String,
    slot: Arc<LockSlot>,
    slots: SlotTable,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if self.slot.users.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.slots.remove_if(&self.key, |_, slot| {
                Arc::ptr_eq(slot, &self.slot) && slot.users.load(Ordering::SeqCst) == 0
            });
        }
    }
}

/// Held lock on one context id; released when dropped
pub struct ContextLockGuard {
    // Field order matters: the mutex is released before the lease reclaims the slot
    _permit: OwnedMutexGuard<()>,
    lease: SlotLease,
}

impl ContextLockGuard {
    /// The locked key
    pub fn key(&self) -> &str {
        &self.lease.key
    }
}

impl std::fmt::Debug for ContextLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextLockGuard")
            .field("key", &self.lease.key)
            .finish()
    }
}

/// Lazily created mutex per string key
#[derive(Debug, Default, Clone)]
pub struct ContextLockManager {
    slots: SlotTable,
}

impl ContextLockManager {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock on `key` and hold it until the guard is dropped
    pub async fn acquire(&self, key: &str) -> ContextLockGuard {
        // Registering under the shard lock keeps `remove_if` from racing us
        let slot = {
            let slot = self.slots.entry(key.to_string()).or_default();
            slot.users.fetch_add(1, Ordering::SeqCst);
            slot.clone()
        };
        let mutex = slot.mutex.clone();

        let lease = SlotLease {
            key: key.to_string(),
            slot,
            slots: self.slots.clone(),
        };

        let permit = mutex.lock_owned().await;
        tracing::trace!(key = key, "Context lock acquired");

        ContextLockGuard {
            _permit: permit,
            lease,
        }
    }

    /// Run `f` while holding the lock on `key`.
    ///
    /// The lock is released on every exit path: normal return, an `Err`
    /// result, a panic unwinding through the future, or cancellation.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(key).await;
        f().await
    }

    /// Whether some task currently holds the lock on `key`
    pub fn is_locked(&self, key: &str) -> bool {
        self.slots
            .get(key)
            .map(|slot| slot.mutex.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of keys currently held
    pub fn get_locked_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.mutex.try_lock().is_err())
            .count()
    }

    /// Forget every lock slot. Guards already handed out stay valid but no
    /// longer exclude new acquirers; meant for test teardown.
    pub fn clear_all_locks(&self) {
        self.slots.clear();
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_released_after_success_and_error() {
        let locks = ContextLockManager::new();

        let value = locks.with_lock("ctx", || async { 7 }).await;
        assert_eq!(value, 7);
        assert!(!locks.is_locked("ctx"));

        let failed: Result<(), String> = locks
            .with_lock("ctx", || async { Err("boom".to_string()) })
            .await;
        assert!(failed.is_err());
        assert!(!locks.is_locked("ctx"));
        assert_eq!(locks.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_is_locked_and_count() {
        let locks = ContextLockManager::new();

        let a = locks.acquire("a").await;
        let _b = locks.acquire("b").await;
        assert!(locks.is_locked("a"));
        assert_eq!(locks.get_locked_count(), 2);
        assert_eq!(a.key(), "a");

        drop(a);
        assert!(!locks.is_locked("a"));
        assert_eq!(locks.get_locked_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_is_mutually_exclusive() {
        let locks = Arc::new(ContextLockManager::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                locks
                    .with_lock("shared", || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.slot_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_different_keys_do_not_wait_on_each_other() {
        let locks = Arc::new(ContextLockManager::new());
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let run = |key: &'static str| {
            let locks = locks.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                locks
                    .with_lock(key, || async {
                        // Both holders must be inside at the same time to pass
                        barrier.wait().await;
                    })
                    .await
            })
        };

        let both = async {
            let (a, b) = tokio::join!(run("ctx-a"), run("ctx-b"));
            a.unwrap();
            b.unwrap();
        };
        tokio::time::timeout(Duration::from_secs(5), both)
            .await
            .expect("locks on different keys serialized");
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak_slot() {
        let locks = ContextLockManager::new();
        let held = locks.acquire("ctx").await;

        let waiting = tokio::time::timeout(Duration::from_millis(20), locks.acquire("ctx")).await;
        assert!(waiting.is_err());

        drop(held);
        assert_eq!(locks.slot_count(), 0);
    }
}
