//! Retry engine with exponential backoff and adaptive budget tightening
//!
//! [`execute`] drives a fallible async operation through the state machine
//! `Attempting(n) -> Success | TransientFailure | FatalFailure`. Transient
//! failures sleep for `min(base_delay * backoff_factor^(n-1), max_delay)` and
//! retry with a smaller output budget:
//! `next = max(min_output_budget, previous * shrink_factor)`.
//!
//! Backoff sleeps suspend only the calling task.

use std::future::Future;
use std::time::Duration;

use studyweave_config::RetrySettings;
use studyweave_utils::types::AttemptOutcome;
use thiserror::Error;

/// Retry policy of one call kind. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub min_output_budget: u32,
    pub shrink_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            min_output_budget: 256,
            shrink_factor: 0.75,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_attempts: s.max_attempts,
            base_delay: Duration::from_millis(s.base_delay_ms),
            backoff_factor: s.backoff_factor,
            max_delay: Duration::from_millis(s.max_delay_ms),
            min_output_budget: s.min_output_budget,
            shrink_factor: s.budget_shrink_factor,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failed_attempt`-th consecutive transient failure.
    ///
    /// `delay_for(1) == base_delay` (capped at `max_delay`), non-decreasing in
    /// `failed_attempt`.
    #[must_use]
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let exponent = i32::try_from(failed_attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let nanos = self.base_delay.as_nanos() as f64 * self.backoff_factor.max(1.0).powi(exponent);
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(nanos as u64)
            .max(self.base_delay)
            .min(self.max_delay)
    }

    /// Output budget for the attempt after one that used `previous`.
    ///
    /// Never larger than `previous` and never below `min_output_budget`.
    #[must_use]
    pub fn next_budget(&self, previous: u32) -> u32 {
        let shrunk = (f64::from(previous) * self.shrink_factor).floor();
        // The float-to-int cast saturates; shrunk is within 0..=previous.
        let shrunk = shrunk as u32;
        shrunk.max(self.min_output_budget).min(previous.max(self.min_output_budget))
    }

    /// Budget for the first attempt.
    #[must_use]
    pub fn initial_budget(&self, requested: u32) -> u32 {
        requested.max(self.min_output_budget)
    }
}

/// What the operation receives for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    pub output_budget: u32,
}

/// Observability record of one attempt. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub requested_output_budget: u32,
    pub delay_before_attempt: Duration,
    pub outcome: AttemptOutcome,
}

/// Passed to the observer after every attempt.
#[derive(Debug)]
pub struct AttemptEvent<'a, T, E> {
    pub record: &'a AttemptRecord,
    pub result: Result<&'a T, &'a E>,
    /// Set when another attempt follows after this delay.
    pub next_delay: Option<Duration>,
}

/// A successful run of the engine.
#[derive(Debug, Clone)]
pub struct RetrySuccess<T> {
    pub value: T,
    pub attempts: u32,
    pub final_budget: u32,
    pub history: Vec<AttemptRecord>,
}

/// Why the engine gave up.
#[derive(Debug, Clone, Error)]
pub enum RetryError<E: std::fmt::Display> {
    /// A non-retryable error, surfaced on first occurrence.
    #[error("attempt {attempts} failed: {error}")]
    Fatal {
        attempts: u32,
        error: E,
        history: Vec<AttemptRecord>,
    },

    /// `max_attempts` transient failures in a row.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        last_error: E,
        history: Vec<AttemptRecord>,
    },
}

impl<E: std::fmt::Display> RetryError<E> {
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    #[must_use]
    pub fn history(&self) -> &[AttemptRecord] {
        match self {
            Self::Fatal { history, .. } | Self::Exhausted { history, .. } => history,
        }
    }

    pub fn into_error(self) -> E {
        match self {
            Self::Fatal { error, .. } => error,
            Self::Exhausted { last_error, .. } => last_error,
        }
    }
}

/// Run `operation` under `policy`.
///
/// `retryable` decides which errors are transient. The observer sees every
/// attempt and cannot influence control flow.
///
/// # Errors
///
/// [`RetryError::Fatal`] for the first non-retryable error, and
/// [`RetryError::Exhausted`] once `max_attempts` transient failures occurred.
pub async fn execute<T, E, F, Fut, R, O>(
    policy: &RetryPolicy,
    requested_budget: u32,
    mut operation: F,
    retryable: R,
    mut observer: O,
) -> Result<RetrySuccess<T>, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    O: FnMut(&AttemptEvent<'_, T, E>),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut budget = policy.initial_budget(requested_budget);
    let mut delay_before = Duration::ZERO;
    let mut history = Vec::with_capacity(max_attempts as usize);

    let mut number = 0;
    loop {
        number += 1;
        let attempt = Attempt {
            number,
            output_budget: budget,
        };

        match operation(attempt).await {
            Ok(value) => {
                let record = AttemptRecord {
                    attempt_number: number,
                    requested_output_budget: budget,
                    delay_before_attempt: delay_before,
                    outcome: AttemptOutcome::Success,
                };
                observer(&AttemptEvent {
                    record: &record,
                    result: Ok(&value),
                    next_delay: None,
                });
                history.push(record);
                return Ok(RetrySuccess {
                    value,
                    attempts: number,
                    final_budget: budget,
                    history,
                });
            }
            Err(error) => {
                let transient = retryable(&error);
                let record = AttemptRecord {
                    attempt_number: number,
                    requested_output_budget: budget,
                    delay_before_attempt: delay_before,
                    outcome: if transient {
                        AttemptOutcome::TransientFailure
                    } else {
                        AttemptOutcome::FatalFailure
                    },
                };
                let next_delay =
                    (transient && number < max_attempts).then(|| policy.delay_for(number));
                observer(&AttemptEvent {
                    record: &record,
                    result: Err(&error),
                    next_delay,
                });
                history.push(record);

                if !transient {
                    return Err(RetryError::Fatal {
                        attempts: number,
                        error,
                        history,
                    });
                }
                let Some(delay) = next_delay else {
                    return Err(RetryError::Exhausted {
                        attempts: number,
                        last_error: error,
                        history,
                    });
                };

                tokio::time::sleep(delay).await;
                delay_before = delay;
                budget = policy.next_budget(budget);
            }
        }
    }
}
