//! Scripted backends for tests.

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use studyweave_utils::error::LlmError;

use crate::types::{LlmBackend, LlmInvocation, LlmResult, StopReason};

/// One scripted provider answer.
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(LlmResult),
    Fail(LlmError),
    /// Never answers; only a timeout or cancellation ends the call.
    Hang,
}

impl Scripted {
    /// A complete reply carrying `text`, with token counts.
    pub fn json(text: impl Into<String>) -> Self {
        Self::Reply(LlmResult::new(text, "scripted", "scripted-model").with_tokens(100, 50))
    }

    /// A reply cut off at the output budget.
    pub fn truncated(text: impl Into<String>) -> Self {
        Self::Reply(
            LlmResult::new(text, "scripted", "scripted-model")
                .with_tokens(100, 256)
                .with_stop_reason(StopReason::MaxTokens),
        )
    }
}

type Responder = dyn Fn(&LlmInvocation, u32) -> Scripted + Send + Sync;

/// Backend answering from a script. Every invocation is recorded.
pub struct ScriptedBackend {
    responder: Box<Responder>,
    calls: AtomicU32,
    invocations: Mutex<Vec<LlmInvocation>>,
}

impl ScriptedBackend {
    /// Answer with `responder(invocation, zero_based_call_index)`.
    pub fn from_fn(responder: impl Fn(&LlmInvocation, u32) -> Scripted + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            calls: AtomicU32::new(0),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Answer in order; the last entry repeats once the script runs out.
    pub fn sequence(script: Vec<Scripted>) -> Self {
        Self::from_fn(move |_, index| {
            let index = (index as usize).min(script.len().saturating_sub(1));
            script
                .get(index)
                .cloned()
                .unwrap_or_else(|| Scripted::Fail(LlmError::Transport("empty script".into())))
        })
    }

    pub fn always(answer: Scripted) -> Self {
        Self::from_fn(move |_, _| answer.clone())
    }

    #[must_use]
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Output budgets requested so far, in call order.
    #[must_use]
    pub fn requested_budgets(&self) -> Vec<u32> {
        self.invocations()
            .iter()
            .map(|inv| inv.max_output_tokens)
            .collect()
    }

    #[must_use]
    pub fn invocations(&self) -> Vec<LlmInvocation> {
        self.invocations
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, inv: LlmInvocation) -> Result<LlmResult, LlmError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = (self.responder)(&inv, index);
        if let Ok(mut calls) = self.invocations.lock() {
            calls.push(inv);
        }
        match answer {
            Scripted::Reply(result) => Ok(result),
            Scripted::Fail(error) => Err(error),
            Scripted::Hang => std::future::pending().await,
        }
    }
}
