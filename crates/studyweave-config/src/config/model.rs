use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use studyweave_utils::types::ConfigSource;

/// Resolved configuration for a studyweave run.
///
/// `Config` is hierarchical with precedence CLI arguments > config file >
/// built-in defaults. Use [`Config::discover()`] for CLI-like behavior that
/// searches for `.studyweave/config.toml` upward from the current directory.
///
/// # Configuration File Format
///
/// ```toml
/// [llm]
/// provider = "anthropic"
/// fallback_provider = "openrouter"
/// call_limit = 500
/// attempt_timeout_secs = 120
///
/// [llm.anthropic]
/// api_key_env = "ANTHROPIC_API_KEY"
/// model = "claude-3-5-haiku-latest"
///
/// [retry.phase1]
/// max_attempts = 3
/// base_delay_ms = 1000
///
/// [budgets]
/// phase1_max_output_tokens = 1024
/// phase2_max_output_tokens = 4096
///
/// [cache]
/// phase1_ttl_secs = 604800
///
/// [concurrency]
/// max_concurrent_calls = 4
/// ```
///
/// API keys never live in the file; `api_key_env` names the variable holding one.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub llm: LlmConfig,
    pub retry: RetryConfig,
    pub budgets: BudgetsConfig,
    pub cache: CacheConfig,
    pub concurrency: ConcurrencyConfig,
    pub pricing: PricingConfig,
    /// Source attribution per dotted key, e.g. `retry.phase1.max_attempts`.
    pub source_attribution: HashMap<String, ConfigSource>,
    /// File the configuration was read from, if any.
    pub config_path: Option<PathBuf>,
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// `anthropic`, `openrouter` or `none`. Unset means degraded mode.
    pub provider: Option<String>,
    pub fallback_provider: Option<String>,
    /// Upper bound on provider calls per process.
    pub call_limit: Option<u64>,
    pub attempt_timeout_secs: u64,
    pub anthropic: ProviderConfig,
    pub openrouter: ProviderConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: None,
            fallback_provider: None,
            call_limit: None,
            attempt_timeout_secs: 120,
            anthropic: ProviderConfig {
                api_key_env: "ANTHROPIC_API_KEY".to_string(),
                base_url: None,
                model: None,
                temperature: 0.2,
            },
            openrouter: ProviderConfig {
                api_key_env: "OPENROUTER_API_KEY".to_string(),
                base_url: None,
                model: None,
                temperature: 0.2,
            },
        }
    }
}

/// HTTP provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key_env: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub temperature: f32,
}

/// Per-phase retry policies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub phase1: RetrySettings,
    pub phase2: RetrySettings,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            phase1: RetrySettings {
                max_attempts: 3,
                base_delay_ms: 1_000,
                backoff_factor: 2.0,
                max_delay_ms: 30_000,
                min_output_budget: 256,
                budget_shrink_factor: 0.75,
            },
            phase2: RetrySettings {
                max_attempts: 4,
                base_delay_ms: 2_000,
                backoff_factor: 2.0,
                max_delay_ms: 60_000,
                min_output_budget: 512,
                budget_shrink_factor: 0.75,
            },
        }
    }
}

/// Retry policy of one call kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub min_output_budget: u32,
    pub budget_shrink_factor: f64,
}

/// Output budgets and fan-out limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetsConfig {
    pub phase1_max_output_tokens: u32,
    pub phase2_max_output_tokens: u32,
    pub max_targets_per_chapter: usize,
}

impl Default for BudgetsConfig {
    fn default() -> Self {
        Self {
            phase1_max_output_tokens: 1_024,
            phase2_max_output_tokens: 4_096,
            max_targets_per_chapter: 5,
        }
    }
}

/// Result cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Defaults to `<STUDYWEAVE_HOME>/cache`.
    pub dir: Option<String>,
    /// Phase 1 results are cheap to recompute and expire sooner.
    pub phase1_ttl_secs: u64,
    pub phase2_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            phase1_ttl_secs: 7 * 24 * 3600,
            phase2_ttl_secs: 30 * 24 * 3600,
        }
    }
}

/// Concurrency caps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Bounds outbound provider calls across all chapters and targets.
    pub max_concurrent_calls: usize,
    pub max_concurrent_chapters: usize,
    pub max_concurrent_targets: usize,
    /// Cancel the run after this many seconds.
    pub run_deadline_secs: Option<u64>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 4,
            max_concurrent_chapters: 2,
            max_concurrent_targets: 3,
            run_deadline_secs: None,
        }
    }
}

/// Token prices used for the cost estimate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingConfig {
    pub input_per_mtok_usd: f64,
    pub output_per_mtok_usd: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_per_mtok_usd: 3.0,
            output_per_mtok_usd: 15.0,
        }
    }
}
