//! Provider access for studyweave
//!
//! Backends implement [`LlmBackend`]; the [`GenerationFacade`] wraps one with
//! call counting, bounded concurrency, per-attempt timeouts, the retry engine
//! and response parsing. Everything above this crate sees only the facade.

mod anthropic_backend;
mod budgeted_backend;
mod facade;
pub(crate) mod http_client;
mod openrouter_backend;
pub mod retry;
mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use std::sync::Arc;

use tracing::{info, warn};

pub use budgeted_backend::{BudgetedBackend, CallCounter};
pub use facade::{
    AttemptError, FacadeSettings, Generation, GenerationError, GenerationFacade,
    GenerationRequest,
};
pub use retry::{AttemptRecord, RetryPolicy};
pub use types::{
    LlmBackend, LlmFallbackInfo, LlmInvocation, LlmResult, Message, Role, StopReason,
};
pub use studyweave_utils::error::LlmError;

pub(crate) use anthropic_backend::AnthropicBackend;
pub(crate) use openrouter_backend::OpenRouterBackend;

use studyweave_config::Config;
use studyweave_utils::redaction::redact_error_message;

/// Construct the backend named `provider`. No fallback handling.
///
/// # Errors
///
/// `LlmError::Unsupported` for unknown providers, `LlmError::Misconfiguration`
/// for missing keys or models.
fn construct_backend_for_provider(
    provider: &str,
    config: &Config,
) -> Result<Arc<dyn LlmBackend>, LlmError> {
    match provider {
        "anthropic" => Ok(Arc::new(AnthropicBackend::new_from_config(
            &config.llm.anthropic,
        )?)),
        "openrouter" => Ok(Arc::new(OpenRouterBackend::new_from_config(
            &config.llm.openrouter,
        )?)),
        unknown => Err(LlmError::Unsupported(format!(
            "Unknown LLM provider '{unknown}'. Supported providers: anthropic, openrouter, none."
        ))),
    }
}

/// Build the configured backend, falling back when the primary cannot be
/// constructed.
///
/// Returns `(None, None)` when no provider is configured or the provider is
/// `none`; the facade then runs in degraded mode.
///
/// # Errors
///
/// The primary provider's error when it fails and no fallback is configured,
/// or when the fallback fails as well.
pub fn from_config_with_fallback(
    config: &Config,
) -> Result<(Option<Arc<dyn LlmBackend>>, Option<LlmFallbackInfo>), LlmError> {
    let provider = match config.llm.provider.as_deref() {
        None | Some("none") => return Ok((None, None)),
        Some(provider) => provider,
    };

    let primary_error = match construct_backend_for_provider(provider, config) {
        Ok(backend) => return Ok((Some(backend), None)),
        Err(e) => e,
    };

    let Some(fallback_provider) = config
        .llm
        .fallback_provider
        .as_deref()
        .filter(|p| *p != "none")
    else {
        return Err(primary_error);
    };

    let reason = redact_error_message(&primary_error.to_string());
    warn!(
        primary = provider,
        fallback = fallback_provider,
        reason = %reason,
        "Primary provider failed during construction, trying fallback"
    );

    match construct_backend_for_provider(fallback_provider, config) {
        Ok(backend) => {
            info!(provider = fallback_provider, "Using fallback provider");
            Ok((
                Some(backend),
                Some(LlmFallbackInfo {
                    primary_provider: provider.to_string(),
                    fallback_provider: fallback_provider.to_string(),
                    reason,
                }),
            ))
        }
        Err(fallback_error) => {
            warn!(
                provider = fallback_provider,
                error = %redact_error_message(&fallback_error.to_string()),
                "Fallback provider failed as well"
            );
            Err(primary_error)
        }
    }
}

/// Build a facade from configuration, degraded when no provider is set.
///
/// # Errors
///
/// See [`from_config_with_fallback`].
pub fn facade_from_config(
    config: &Config,
) -> Result<(GenerationFacade, Option<LlmFallbackInfo>), LlmError> {
    let (backend, fallback) = from_config_with_fallback(config)?;
    Ok((
        GenerationFacade::new(backend, FacadeSettings::from_config(config)),
        fallback,
    ))
}

#[cfg(test)]
mod factory_tests {
    use super::*;
    use studyweave_utils::test_support::{ENV_LOCK, fake_anthropic_key};

    fn config_with(provider: Option<&str>, fallback: Option<&str>) -> Config {
        let mut config = Config::default();
        config.llm.provider = provider.map(str::to_string);
        config.llm.fallback_provider = fallback.map(str::to_string);
        config.llm.anthropic.api_key_env = "STUDYWEAVE_FACTORY_ANTHROPIC_KEY".to_string();
        config.llm.openrouter.api_key_env = "STUDYWEAVE_FACTORY_OPENROUTER_KEY".to_string();
        config
    }

    #[test]
    fn test_no_provider_is_degraded() {
        let (backend, fallback) = from_config_with_fallback(&config_with(None, None)).unwrap();
        assert!(backend.is_none());
        assert!(fallback.is_none());

        let (backend, _) = from_config_with_fallback(&config_with(Some("none"), None)).unwrap();
        assert!(backend.is_none());
    }

    #[test]
    fn test_unknown_provider_is_unsupported() {
        let err = from_config_with_fallback(&config_with(Some("gpt-cli"), None))
            .err()
            .unwrap();
        assert!(matches!(err, LlmError::Unsupported(msg) if msg.contains("gpt-cli")));
    }

    #[test]
    fn test_missing_key_without_fallback_fails() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::remove_var("STUDYWEAVE_FACTORY_ANTHROPIC_KEY") };

        let err = from_config_with_fallback(&config_with(Some("anthropic"), None))
            .err()
            .unwrap();
        assert!(matches!(err, LlmError::Misconfiguration(_)));
    }

    #[test]
    fn test_fallback_used_when_primary_cannot_be_built() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::remove_var("STUDYWEAVE_FACTORY_OPENROUTER_KEY");
            std::env::set_var("STUDYWEAVE_FACTORY_ANTHROPIC_KEY", fake_anthropic_key());
        }

        let (backend, fallback) =
            from_config_with_fallback(&config_with(Some("openrouter"), Some("anthropic")))
                .unwrap();
        assert_eq!(backend.unwrap().name(), "anthropic");
        let info = fallback.unwrap();
        assert_eq!(info.primary_provider, "openrouter");
        assert_eq!(info.fallback_provider, "anthropic");
        assert!(info.reason.contains("OpenRouter"));

        unsafe { std::env::remove_var("STUDYWEAVE_FACTORY_ANTHROPIC_KEY") };
    }

    #[test]
    fn test_primary_error_returned_when_both_fail() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::remove_var("STUDYWEAVE_FACTORY_ANTHROPIC_KEY");
            std::env::remove_var("STUDYWEAVE_FACTORY_OPENROUTER_KEY");
        }

        let err = from_config_with_fallback(&config_with(Some("anthropic"), Some("openrouter")))
            .err()
            .unwrap();
        assert!(matches!(err, LlmError::Misconfiguration(msg) if msg.contains("Anthropic")));
    }

    #[test]
    fn test_facade_from_config_without_provider() {
        let (facade, fallback) = facade_from_config(&config_with(None, None)).unwrap();
        assert!(facade.is_degraded());
        assert!(fallback.is_none());
    }
}
