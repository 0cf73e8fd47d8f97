//! In-memory reference providers
//!
//! Process-local implementations of the three provider contracts. They are the
//! default backends and the ones every test runs against.

mod graph;
mod kv;
mod vector;

pub use graph::InMemoryGraphProvider;
pub use kv::InMemoryKvProvider;
pub use vector::InMemoryVectorProvider;

use crate::error::{RmemError, RmemResult};
use std::sync::atomic::{AtomicBool, Ordering};

/// Initialization flag shared by the in-memory providers
#[derive(Debug, Default)]
pub(crate) struct ReadyFlag(AtomicBool);

impl ReadyFlag {
    pub(crate) fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure(&self, provider: &'static str) -> RmemResult<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(RmemError::not_ready(provider))
        }
    }
}
