//! Process-wide call counting and call limits
//!
//! Every provider invocation passes through [`BudgetedBackend`], which bumps a
//! shared atomic counter before the inner backend runs. The counter tracks
//! attempted calls, not successful ones, so retry loops cannot slip past the
//! limit.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use studyweave_utils::error::LlmError;

use crate::types::{LlmBackend, LlmInvocation, LlmResult};

/// Shared count of provider invocations. Clones observe the same count.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicU64>);

impl CallCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and return the count before the increment.
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// A wrapper that counts invocations and optionally enforces a limit.
pub struct BudgetedBackend {
    inner: Arc<dyn LlmBackend>,
    counter: CallCounter,
    limit: Option<u64>,
}

impl BudgetedBackend {
    pub fn new(inner: Arc<dyn LlmBackend>, counter: CallCounter, limit: Option<u64>) -> Self {
        debug!(limit = ?limit, provider = inner.name(), "Creating BudgetedBackend");
        Self {
            inner,
            counter,
            limit,
        }
    }

    #[must_use]
    pub fn counter(&self) -> &CallCounter {
        &self.counter
    }

    #[must_use]
    pub const fn limit(&self) -> Option<u64> {
        self.limit
    }
}

#[async_trait]
impl LlmBackend for BudgetedBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn invoke(&self, inv: LlmInvocation) -> Result<LlmResult, LlmError> {
        let current = self.counter.increment();

        if let Some(limit) = self.limit
            && current >= limit
        {
            let attempted = current + 1;
            warn!(limit, attempted, "Call limit exceeded");
            return Err(LlmError::BudgetExceeded { limit, attempted });
        }

        let result = self.inner.invoke(inv).await;
        if let Err(e) = &result {
            debug!(
                call_count = current + 1,
                error = %e,
                "Inner backend invocation failed (call still counted)"
            );
        }
        result
    }
}
