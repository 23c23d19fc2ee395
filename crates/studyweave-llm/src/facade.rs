//! Generation facade: one reliable structured-generation call
//!
//! The facade composes the provider backend, the retry engine and the
//! response parser. It owns the process-wide call counter and the limiter that
//! bounds concurrent outbound calls, applies a timeout to every attempt, and
//! reclassifies truncated output as a transient failure so that the retry
//! engine shrinks the output budget.
//!
//! Without a configured provider the facade runs in degraded mode and answers
//! every call with a deterministic fallback payload, flagged as such.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use studyweave_config::Config;
use studyweave_extraction::{
    ChecksumStatus, ParseOptions, ParsedResponse, ResponseError, parse_response,
};
use studyweave_utils::error::LlmError;
use studyweave_utils::logging::{AttemptLog, log_attempt};
use studyweave_utils::types::{CallLogRecord, Phase, TokenUsage};

use crate::budgeted_backend::{BudgetedBackend, CallCounter};
use crate::retry::{self, Attempt, AttemptEvent, AttemptRecord, RetryError, RetryPolicy};
use crate::types::{LlmBackend, LlmInvocation, Message};

/// Facade tuning, normally derived from [`Config`].
#[derive(Debug, Clone)]
pub struct FacadeSettings {
    pub analyze_policy: RetryPolicy,
    pub enhance_policy: RetryPolicy,
    pub attempt_timeout: Duration,
    pub max_concurrent_calls: usize,
    pub call_limit: Option<u64>,
}

impl Default for FacadeSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl FacadeSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            analyze_policy: RetryPolicy::from(config.retry_for(Phase::Analyze)),
            enhance_policy: RetryPolicy::from(config.retry_for(Phase::Enhance)),
            attempt_timeout: config.attempt_timeout(),
            max_concurrent_calls: config.concurrency.max_concurrent_calls,
            call_limit: config.llm.call_limit,
        }
    }

    #[must_use]
    pub const fn policy(&self, phase: Phase) -> &RetryPolicy {
        match phase {
            Phase::Analyze => &self.analyze_policy,
            Phase::Enhance => &self.enhance_policy,
        }
    }
}

/// One logical generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub phase: Phase,
    pub chapter_id: String,
    pub target_id: Option<String>,
    pub system_context: String,
    pub prompt: String,
    pub max_output_budget: u32,
    pub parse: ParseOptions,
    /// Payload returned in degraded mode. Defaults to every required field
    /// set to `null`.
    pub fallback: Option<Map<String, Value>>,
}

impl GenerationRequest {
    pub fn new(
        phase: Phase,
        chapter_id: impl Into<String>,
        system_context: impl Into<String>,
        prompt: impl Into<String>,
        max_output_budget: u32,
    ) -> Self {
        Self {
            phase,
            chapter_id: chapter_id.into(),
            target_id: None,
            system_context: system_context.into(),
            prompt: prompt.into(),
            max_output_budget,
            parse: ParseOptions::default(),
            fallback: None,
        }
    }

    #[must_use]
    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    #[must_use]
    pub fn with_parse_options(mut self, parse: ParseOptions) -> Self {
        self.parse = parse;
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: Map<String, Value>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn degraded_payload(&self) -> Map<String, Value> {
        self.fallback.clone().unwrap_or_else(|| {
            self.parse
                .required_fields
                .iter()
                .map(|field| (field.clone(), Value::Null))
                .collect()
        })
    }
}

/// Result of a successful logical call.
#[derive(Debug, Clone)]
pub struct Generation {
    pub response: ParsedResponse,
    /// Tokens summed over every attempt, failed ones included.
    pub usage: TokenUsage,
    pub attempts: u32,
    pub final_budget: u32,
    /// True when no provider is configured and `response` is the fallback.
    pub degraded: bool,
    pub history: Vec<AttemptRecord>,
}

/// Why one attempt failed, in provider-agnostic form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Provider(LlmError),
    #[error(transparent)]
    Response(ResponseError),
}

impl AttemptError {
    /// Retried by the engine: transient provider errors, truncation included.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_transient(),
            Self::Response(_) => false,
        }
    }
}

/// Failure of a logical call.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    /// Fatal provider error (authentication, call limit, bad request).
    #[error("provider call failed: {0}")]
    Provider(LlmError),

    /// Malformed or incomplete structured output.
    #[error("invalid structured response: {0}")]
    Response(ResponseError),

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: AttemptError,
        history: Vec<AttemptRecord>,
    },

    #[error("generation cancelled")]
    Cancelled,
}

impl GenerationError {
    #[must_use]
    pub const fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }
}

/// An attempt's outcome together with its telemetry.
struct Measured<T> {
    value: T,
    usage: TokenUsage,
    elapsed: Duration,
}

impl<T: fmt::Display> fmt::Display for Measured<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

pub struct GenerationFacade {
    backend: Option<BudgetedBackend>,
    counter: CallCounter,
    permits: Arc<Semaphore>,
    settings: FacadeSettings,
    call_log: Option<mpsc::UnboundedSender<CallLogRecord>>,
}

impl GenerationFacade {
    /// Build a facade. `None` selects degraded mode explicitly.
    pub fn new(backend: Option<Arc<dyn LlmBackend>>, settings: FacadeSettings) -> Self {
        let counter = CallCounter::new();
        let backend =
            backend.map(|inner| BudgetedBackend::new(inner, counter.clone(), settings.call_limit));
        if backend.is_none() {
            warn!("No LLM provider configured; generation runs in degraded mode");
        }
        Self {
            backend,
            counter,
            permits: Arc::new(Semaphore::new(settings.max_concurrent_calls.max(1))),
            settings,
            call_log: None,
        }
    }

    /// Send one [`CallLogRecord`] per provider invocation to `sender`.
    #[must_use]
    pub fn with_call_log(mut self, sender: mpsc::UnboundedSender<CallLogRecord>) -> Self {
        self.call_log = Some(sender);
        self
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.backend.is_none()
    }

    #[must_use]
    pub fn provider_name(&self) -> &str {
        self.backend.as_ref().map_or("none", |backend| backend.name())
    }

    /// Provider invocations made so far, across all tasks.
    #[must_use]
    pub fn calls_made(&self) -> u64 {
        self.counter.get()
    }

    #[must_use]
    pub const fn settings(&self) -> &FacadeSettings {
        &self.settings
    }

    /// Run one logical call to completion, cancellation, or failure.
    ///
    /// # Errors
    ///
    /// See [`GenerationError`]. Cancellation abandons the in-flight attempt.
    pub async fn call(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<Generation, GenerationError> {
        let Some(backend) = &self.backend else {
            return Ok(self.degraded(request));
        };
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }

        let policy = self.settings.policy(request.phase);
        let mut total = TokenUsage::default();

        let run = retry::execute(
            policy,
            request.max_output_budget,
            |attempt| self.attempt(backend, request, attempt),
            |failed: &Measured<AttemptError>| failed.value.is_transient(),
            |event| {
                let (usage, elapsed, error) = match event.result {
                    Ok(ok) => (ok.usage, ok.elapsed, None),
                    Err(failed) => (failed.usage, failed.elapsed, Some(failed.value.to_string())),
                };
                total.add(usage);
                self.observe(request, event.record, usage, elapsed, event.next_delay, error.as_deref());
            },
        );

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = run => Some(result),
        };
        let Some(result) = outcome else {
            debug!(chapter_id = %request.chapter_id, "generation abandoned on cancellation");
            return Err(GenerationError::Cancelled);
        };

        match result {
            Ok(success) => Ok(Generation {
                response: success.value.value,
                usage: total,
                attempts: success.attempts,
                final_budget: success.final_budget,
                degraded: false,
                history: success.history,
            }),
            Err(RetryError::Fatal { error, .. }) => Err(match error.value {
                AttemptError::Provider(e) => GenerationError::Provider(e),
                AttemptError::Response(e) => GenerationError::Response(e),
            }),
            Err(RetryError::Exhausted {
                attempts,
                last_error,
                history,
            }) => Err(GenerationError::RetryExhausted {
                attempts,
                last_error: last_error.value,
                history,
            }),
        }
    }

    async fn attempt(
        &self,
        backend: &BudgetedBackend,
        request: &GenerationRequest,
        attempt: Attempt,
    ) -> Result<Measured<ParsedResponse>, Measured<AttemptError>> {
        let failed = |error: LlmError, usage: TokenUsage, elapsed: Duration| Measured {
            value: AttemptError::Provider(error),
            usage,
            elapsed,
        };

        let _permit = self.permits.acquire().await.map_err(|_| {
            failed(
                LlmError::Misconfiguration("call limiter closed".to_string()),
                TokenUsage::default(),
                Duration::ZERO,
            )
        })?;

        let mut invocation = LlmInvocation::new(
            request.phase,
            request.chapter_id.clone(),
            self.settings.attempt_timeout,
            vec![
                Message::system(request.system_context.clone()),
                Message::user(request.prompt.clone()),
            ],
            attempt.output_budget,
        );
        invocation.target_id = request.target_id.clone();

        let started = Instant::now();
        let result =
            tokio::time::timeout(self.settings.attempt_timeout, backend.invoke(invocation)).await;
        let elapsed = started.elapsed();

        let reply = match result {
            Err(_) => {
                return Err(failed(
                    LlmError::Timeout {
                        duration: self.settings.attempt_timeout,
                    },
                    TokenUsage::default(),
                    elapsed,
                ));
            }
            Ok(Err(e)) => return Err(failed(e, TokenUsage::default(), elapsed)),
            Ok(Ok(reply)) => reply,
        };

        let usage = reply.usage();
        let truncated = LlmError::Truncated {
            budget: attempt.output_budget,
            output_tokens: usage.output_tokens,
        };
        if reply.stop_reason.is_truncated() {
            return Err(failed(truncated, usage, elapsed));
        }

        match parse_response(&reply.text, &request.parse) {
            Ok(response) => Ok(Measured {
                value: response,
                usage,
                elapsed,
            }),
            Err(e) if e.is_truncation() => Err(failed(truncated, usage, elapsed)),
            Err(e) => Err(Measured {
                value: AttemptError::Response(e),
                usage,
                elapsed,
            }),
        }
    }

    fn observe(
        &self,
        request: &GenerationRequest,
        record: &AttemptRecord,
        usage: TokenUsage,
        elapsed: Duration,
        next_delay: Option<Duration>,
        error: Option<&str>,
    ) {
        log_attempt(&AttemptLog {
            phase: request.phase,
            chapter_id: &request.chapter_id,
            target_id: request.target_id.as_deref(),
            attempt: record.attempt_number,
            outcome: record.outcome,
            requested_output_budget: record.requested_output_budget,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            delay_ms: next_delay.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            error,
        });

        if let Some(sender) = &self.call_log {
            let record = CallLogRecord {
                phase: request.phase,
                chapter_id: request.chapter_id.clone(),
                target_id: request.target_id.clone(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                attempt_count: record.attempt_number,
                duration: elapsed,
                cache_hit: false,
                outcome: Some(record.outcome),
            };
            if sender.send(record).is_err() {
                debug!("call log receiver dropped");
            }
        }
    }

    fn degraded(&self, request: &GenerationRequest) -> Generation {
        debug!(
            phase = %request.phase,
            chapter_id = %request.chapter_id,
            "returning degraded-mode payload"
        );
        Generation {
            response: ParsedResponse {
                data: request.degraded_payload(),
                raw_text: String::new(),
                checksum_valid: false,
                missing_required_fields: Default::default(),
                checksum_status: ChecksumStatus::NotChecked,
            },
            usage: TokenUsage::default(),
            attempts: 0,
            final_budget: request.max_output_budget,
            degraded: true,
            history: Vec::new(),
        }
    }
}
