use super::ReadyFlag;
use crate::error::{RmemError, RmemResult};
use crate::storage::kv::{glob_to_regex, KeyValueProvider, KvScan, SetOptions};
use crate::storage::HealthReport;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const PROVIDER: &str = "kv";

#[derive(Debug, Clone)]
struct KvRecord {
    value: Value,
    expires_at: Option<Instant>,
}

impl KvRecord {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

/// Key-value provider backed by a process-local hash map.
///
/// Expired keys are dropped on access, and swept from the whole map whenever
/// keys are listed or health is checked.
#[derive(Debug, Default)]
pub struct InMemoryKvProvider {
    entries: RwLock<HashMap<String, KvRecord>>,
    ready: ReadyFlag,
}

impl InMemoryKvProvider {
    /// Create an uninitialized provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired record; returns the live entry count
    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, record| !record.is_expired(now));

        let purged = before - entries.len();
        if purged > 0 {
            tracing::trace!(provider = PROVIDER, purged, "Expired keys purged");
        }
        entries.len()
    }

    fn matching_keys(&self, pattern: Option<&str>) -> RmemResult<Vec<String>> {
        self.ready.ensure(PROVIDER)?;

        let matcher = pattern.map(glob_to_regex).transpose()?;
        self.purge_expired();
        let now = Instant::now();
        let entries = self.entries.read();

        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, record)| !record.is_expired(now))
            .filter(|(key, _)| matcher.as_ref().map(|m| m.is_match(key)).unwrap_or(true))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();

        Ok(keys)
    }
}

#[async_trait::async_trait]
impl KeyValueProvider for InMemoryKvProvider {
    async fn initialize(&self) -> RmemResult<()> {
        self.ready.set(true);
        tracing::debug!(provider = PROVIDER, "In-memory key-value provider initialized");
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
        let count = self.purge_expired();
        Ok(HealthReport::healthy().with_detail("entries", count))
    }

    async fn get(&self, key: &str) -> RmemResult<Option<Value>> {
        self.ready.ensure(PROVIDER)?;

        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return Ok(None),
                Some(record) if !record.is_expired(now) => return Ok(Some(record.value.clone())),
                Some(_) => {}
            }
        }

        // Expired: drop it
        let mut entries = self.entries.write();
        if entries.get(key).map(|r| r.is_expired(now)).unwrap_or(false) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, options: SetOptions) -> RmemResult<()> {
        self.ready.ensure(PROVIDER)?;

        let now = Instant::now();
        let mut entries = self.entries.write();

        if options.if_not_exists {
            if let Some(existing) = entries.get(key) {
                if !existing.is_expired(now) {
                    return Err(RmemError::conflict(key, "key already exists"));
                }
            }
        }

        entries.insert(
            key.to_string(),
            KvRecord {
                value,
                expires_at: options.ttl.map(|secs| now + Duration::from_secs(secs)),
            },
        );

        Ok(())
    }

    async fn delete(&self, key: &str) -> RmemResult<bool> {
        self.ready.ensure(PROVIDER)?;

        let now = Instant::now();
        let removed = self.entries.write().remove(key);
        Ok(removed.map(|r| !r.is_expired(now)).unwrap_or(false))
    }

    async fn keys(&self, pattern: Option<&str>) -> RmemResult<Vec<String>> {
        self.matching_keys(pattern)
    }

    fn scan<'a>(&'a self, pattern: Option<&'a str>) -> KvScan<'a> {
        let keys = match self.matching_keys(pattern) {
            Ok(keys) => keys,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };

        stream::iter(keys)
            .filter_map(move |key| async move {
                match self.get(&key).await {
                    Ok(Some(value)) => Some(Ok((key, value))),
                    Ok(None) => None,
                    Err(e) => Some(Err(e)),
                }
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use futures::TryStreamExt;
    use serde_json::json;

    async fn ready_provider() -> InMemoryKvProvider {
        let kv = InMemoryKvProvider::new();
        kv.initialize().await.unwrap();
        kv
    }

    #[tokio::test]
    async fn test_not_ready_before_initialize() {
        let kv = InMemoryKvProvider::new();
        let err = kv.get("a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotReady);

        let health = kv.health().await.unwrap();
        assert!(!health.is_usable());
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let kv = ready_provider().await;

        kv.set("fact:1", json!({"statement": "sky is blue"}), SetOptions::new())
            .await
            .unwrap();
        assert!(kv.exists("fact:1").await.unwrap());
        assert_eq!(
            kv.get("fact:1").await.unwrap(),
            Some(json!({"statement": "sky is blue"}))
        );

        assert!(kv.delete("fact:1").await.unwrap());
        assert!(!kv.delete("fact:1").await.unwrap());
        assert!(!kv.exists("fact:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_if_not_exists_conflict() {
        let kv = ready_provider().await;

        kv.set("k", json!(1), SetOptions::new()).await.unwrap();
        let err = kv
            .set("k", json!(2), SetOptions::new().if_not_exists())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(kv.get("k").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let kv = ready_provider().await;

        kv.set("short", json!("x"), SetOptions::new().with_ttl(1))
            .await
            .unwrap();
        assert!(kv.exists("short").await.unwrap());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!kv.exists("short").await.unwrap());
        assert_eq!(kv.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_keys_are_swept_from_the_map() {
        let kv = ready_provider().await;

        for i in 0..3 {
            kv.set(&format!("session:{}", i), json!(i), SetOptions::new().with_ttl(1))
                .await
                .unwrap();
        }
        kv.set("fact:kept", json!("f"), SetOptions::new()).await.unwrap();
        assert_eq!(kv.entries.read().len(), 4);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let health = kv.health().await.unwrap();
        assert_eq!(health.details.get("entries"), Some(&json!(1)));
        assert_eq!(kv.entries.read().len(), 1);

        kv.set("session:9", json!(9), SetOptions::new().with_ttl(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(kv.keys(Some("fact:*")).await.unwrap(), vec!["fact:kept".to_string()]);
        assert_eq!(kv.entries.read().len(), 1);
    }

    #[tokio::test]
    async fn test_keys_count_and_scan_with_pattern() {
        let kv = ready_provider().await;

        for i in 0..3 {
            kv.set(&format!("episode:{}", i), json!(i), SetOptions::new())
                .await
                .unwrap();
        }
        kv.set("fact:x", json!("f"), SetOptions::new()).await.unwrap();

        assert_eq!(kv.count(Some("episode:*")).await.unwrap(), 3);
        assert_eq!(kv.count(None).await.unwrap(), 4);
        assert_eq!(kv.keys(Some("fact:*")).await.unwrap(), vec!["fact:x".to_string()]);

        let scanned: Vec<(String, Value)> = kv.scan(Some("episode:*")).try_collect().await.unwrap();
        assert_eq!(scanned.len(), 3);
        assert_eq!(scanned[0], ("episode:0".to_string(), json!(0)));

        // Restart yields the same sequence
        let again: Vec<(String, Value)> = kv.scan(Some("episode:*")).try_collect().await.unwrap();
        assert_eq!(scanned, again);
    }

    #[tokio::test]
    async fn test_batch_operations() {
        let kv = ready_provider().await;

        kv.set_batch(
            vec![("a".to_string(), json!(1)), ("b".to_string(), json!(2))],
            SetOptions::new(),
        )
        .await
        .unwrap();

        let values = kv
            .get_batch(&["a".to_string(), "missing".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some(json!(1)), None, Some(json!(2))]);

        let deleted = kv
            .delete_batch(&["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn test_set_batch_if_not_exists_partially_applies() {
        let kv = ready_provider().await;
        kv.set("B", json!("original"), SetOptions::new()).await.unwrap();

        let err = kv
            .set_batch(
                vec![
                    ("A".to_string(), json!("a")),
                    ("B".to_string(), json!("b")),
                    ("C".to_string(), json!("c")),
                ],
                SetOptions::new().if_not_exists(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(kv.get("A").await.unwrap(), Some(json!("a")));
        assert_eq!(kv.get("B").await.unwrap(), Some(json!("original")));
        assert_eq!(kv.get("C").await.unwrap(), None);
    }
}
