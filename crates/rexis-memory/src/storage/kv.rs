//! Key-value provider contract

use super::HealthReport;
use crate::error::{RmemError, RmemResult};
use futures::stream::BoxStream;
use regex::Regex;
use serde_json::Value;

/// Lazy, forward-only sequence of `(key, value)` pairs.
///
/// Calling [`KeyValueProvider::scan`] again restarts the sequence from the
/// beginning.
pub type KvScan<'a> = BoxStream<'a, RmemResult<(String, Value)>>;

/// Options accepted by [`KeyValueProvider::set`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Auto-expiry in seconds
    pub ttl: Option<u64>,

    /// Fail with a conflict error if the key already exists
    pub if_not_exists: bool,
}

impl SetOptions {
    /// Default options (no ttl, overwrite allowed)
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire the key after `seconds`
    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    /// Reject the write if the key is already present
    pub fn if_not_exists(mut self) -> Self {
        self.if_not_exists = true;
        self
    }
}

/// Key-value storage backend.
///
/// Keys are plain strings; patterns accept glob-style `*` wildcards. All
/// operations fail with [`crate::error::ErrorKind::NotReady`] until
/// [`initialize`](KeyValueProvider::initialize) has completed.
#[async_trait::async_trait]
pub trait KeyValueProvider: Send + Sync {
    /// Provider name used in logs and errors
    fn name(&self) -> &'static str {
        "kv"
    }

    /// Prepare the backend for use
    async fn initialize(&self) -> RmemResult<()>;

    /// Release backend resources
    async fn close(&self) -> RmemResult<()>;

    /// Report backend health
    async fn health(&self) -> RmemResult<HealthReport>;

    /// Read a value
    async fn get(&self, key: &str) -> RmemResult<Option<Value>>;

    /// Write a value
    async fn set(&self, key: &str, value: Value, options: SetOptions) -> RmemResult<()>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> RmemResult<bool>;

    /// Whether a key is present
    async fn exists(&self, key: &str) -> RmemResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Keys matching a glob pattern (all keys when `None`)
    async fn keys(&self, pattern: Option<&str>) -> RmemResult<Vec<String>>;

    /// Number of keys matching a glob pattern
    async fn count(&self, pattern: Option<&str>) -> RmemResult<usize> {
        Ok(self.keys(pattern).await?.len())
    }

    /// Lazily iterate `(key, value)` pairs matching a pattern
    fn scan<'a>(&'a self, pattern: Option<&'a str>) -> KvScan<'a>;

    /// Read several keys, preserving order
    async fn get_batch(&self, keys: &[String]) -> RmemResult<Vec<Option<Value>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Write several entries in iteration order.
    ///
    /// Not transactional: with `if_not_exists`, the first conflicting key
    /// fails the call and every entry before it stays committed.
    async fn set_batch(&self, entries: Vec<(String, Value)>, options: SetOptions) -> RmemResult<()> {
        for (key, value) in entries {
            self.set(&key, value, options.clone()).await?;
        }
        Ok(())
    }

    /// Delete several keys, returning how many existed
    async fn delete_batch(&self, keys: &[String]) -> RmemResult<usize> {
        let mut deleted = 0;
        for key in keys {
            if self.delete(key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// Compile a glob pattern (`*` matches any run of characters) into an
/// anchored regex.
pub fn glob_to_regex(pattern: &str) -> RmemResult<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");

    Regex::new(&format!("^{}$", body))
        .map_err(|e| RmemError::validation("pattern", "must be a valid glob", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_matching() {
        let re = glob_to_regex("episode:*").unwrap();
        assert!(re.is_match("episode:abc"));
        assert!(re.is_match("episode:"));
        assert!(!re.is_match("episodes:context:abc"));

        let re = glob_to_regex("*:context:*").unwrap();
        assert!(re.is_match("episodes:context:c1"));
        assert!(!re.is_match("episode:c1"));
    }

    #[test]
    fn test_glob_escapes_regex_syntax() {
        let re = glob_to_regex("fact:(1).*").unwrap();
        assert!(re.is_match("fact:(1).x"));
        assert!(!re.is_match("fact:1x"));
    }

    #[test]
    fn test_set_options_builder() {
        let opts = SetOptions::new().with_ttl(30).if_not_exists();
        assert_eq!(opts.ttl, Some(30));
        assert!(opts.if_not_exists);
    }
}
