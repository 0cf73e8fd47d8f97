//! Middleware around `remember`, `recall` and `forget`
//!
//! Hooks run in registration order. A failing `before_*` hook aborts the
//! operation; a failing `after_*` hook is logged because the operation has
//! already been applied. `transform_store` and `transform_retrieve` chain,
//! each middleware receiving the previous one's output.

use crate::error::{ErrorKind, RmemError, RmemResult};
use crate::recall::{MemoryResult, RecallOptions};
use crate::system::{ForgetCriteria, RememberOptions, RememberReceipt};
use serde_json::Value;
use std::sync::Arc;

/// A hook set wrapped around memory operations
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in errors and logs
    fn name(&self) -> &str;

    /// Called once by `MemorySystem::initialize`
    async fn initialize(&self) -> RmemResult<()> {
        Ok(())
    }

    async fn before_remember(&self, _content: &Value, _options: &RememberOptions) -> RmemResult<()> {
        Ok(())
    }

    async fn after_remember(&self, _receipt: &RememberReceipt) -> RmemResult<()> {
        Ok(())
    }

    async fn before_recall(&self, _query: &str, _options: &RecallOptions) -> RmemResult<()> {
        Ok(())
    }

    async fn after_recall(&self, _query: &str, _results: &[MemoryResult]) -> RmemResult<()> {
        Ok(())
    }

    async fn before_forget(&self, _criteria: &ForgetCriteria) -> RmemResult<()> {
        Ok(())
    }

    async fn after_forget(&self, _criteria: &ForgetCriteria, _deleted: usize) -> RmemResult<()> {
        Ok(())
    }

    /// Rewrite content before it is classified and stored
    async fn transform_store(&self, content: Value) -> RmemResult<Value> {
        Ok(content)
    }

    /// Rewrite ranked results before they are returned
    async fn transform_retrieve(&self, results: Vec<MemoryResult>) -> RmemResult<Vec<MemoryResult>> {
        Ok(results)
    }
}

fn wrap(middleware: &dyn Middleware, stage: &'static str, err: RmemError) -> RmemError {
    if err.kind() == ErrorKind::Middleware {
        err
    } else {
        RmemError::middleware(middleware.name(), stage, err.to_string())
    }
}

/// Ordered middleware list
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    /// Chain over the given middlewares, in order
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self { middlewares }
    }

    /// Number of middlewares
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Whether the chain is empty
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Initialize every middleware independently; returns the names of
    /// those that failed
    pub async fn initialize(&self) -> Vec<String> {
        let mut failed = Vec::new();
        for middleware in &self.middlewares {
            if let Err(e) = middleware.initialize().await {
                tracing::warn!(middleware = middleware.name(), error = %e, "Middleware failed to initialize");
                failed.push(middleware.name().to_string());
            }
        }
        failed
    }

    pub async fn before_remember(&self, content: &Value, options: &RememberOptions) -> RmemResult<()> {
        for m in &self.middlewares {
            m.before_remember(content, options)
                .await
                .map_err(|e| wrap(m.as_ref(), "before_remember", e))?;
        }
        Ok(())
    }

    pub async fn after_remember(&self, receipt: &RememberReceipt) {
        for m in &self.middlewares {
            if let Err(e) = m.after_remember(receipt).await {
                tracing::warn!(middleware = m.name(), error = %e, "after_remember hook failed");
            }
        }
    }

    pub async fn before_recall(&self, query: &str, options: &RecallOptions) -> RmemResult<()> {
        for m in &self.middlewares {
            m.before_recall(query, options)
                .await
                .map_err(|e| wrap(m.as_ref(), "before_recall", e))?;
        }
        Ok(())
    }

    pub async fn after_recall(&self, query: &str, results: &[MemoryResult]) {
        for m in &self.middlewares {
            if let Err(e) = m.after_recall(query, results).await {
                tracing::warn!(middleware = m.name(), error = %e, "after_recall hook failed");
            }
        }
    }

    pub async fn before_forget(&self, criteria: &ForgetCriteria) -> RmemResult<()> {
        for m in &self.middlewares {
            m.before_forget(criteria)
                .await
                .map_err(|e| wrap(m.as_ref(), "before_forget", e))?;
        }
        Ok(())
    }

    pub async fn after_forget(&self, criteria: &ForgetCriteria, deleted: usize) {
        for m in &self.middlewares {
            if let Err(e) = m.after_forget(criteria, deleted).await {
                tracing::warn!(middleware = m.name(), error = %e, "after_forget hook failed");
            }
        }
    }

    pub async fn transform_store(&self, mut content: Value) -> RmemResult<Value> {
        for m in &self.middlewares {
            content = m
                .transform_store(content)
                .await
                .map_err(|e| wrap(m.as_ref(), "transform_store", e))?;
        }
        Ok(content)
    }

    pub async fn transform_retrieve(&self, mut results: Vec<MemoryResult>) -> RmemResult<Vec<MemoryResult>> {
        for m in &self.middlewares {
            results = m
                .transform_retrieve(results)
                .await
                .map_err(|e| wrap(m.as_ref(), "transform_retrieve", e))?;
        }
        Ok(results)
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.middlewares.iter().map(|m| m.name()))
            .finish()
    }
}
