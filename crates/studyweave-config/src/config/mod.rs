//! Hierarchical configuration: CLI > `.studyweave/config.toml` > defaults.

use std::time::Duration;

use camino::Utf8PathBuf;
use studyweave_utils::paths;
use studyweave_utils::types::Phase;

mod cli_args;
mod discovery;
mod model;
mod sources;
mod validation;

pub use cli_args::CliArgs;
pub use model::*;
pub use studyweave_utils::types::ConfigSource;

impl Config {
    /// Retry policy for calls of the given phase.
    #[must_use]
    pub const fn retry_for(&self, phase: Phase) -> &RetrySettings {
        match phase {
            Phase::Analyze => &self.retry.phase1,
            Phase::Enhance => &self.retry.phase2,
        }
    }

    /// Initial output token budget for the given phase.
    #[must_use]
    pub const fn output_budget_for(&self, phase: Phase) -> u32 {
        match phase {
            Phase::Analyze => self.budgets.phase1_max_output_tokens,
            Phase::Enhance => self.budgets.phase2_max_output_tokens,
        }
    }

    #[must_use]
    pub const fn cache_ttl_for(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Analyze => Duration::from_secs(self.cache.phase1_ttl_secs),
            Phase::Enhance => Duration::from_secs(self.cache.phase2_ttl_secs),
        }
    }

    #[must_use]
    pub const fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.attempt_timeout_secs)
    }

    /// Cache directory, `<STUDYWEAVE_HOME>/cache` unless configured.
    #[must_use]
    pub fn cache_dir(&self) -> Utf8PathBuf {
        self.cache
            .dir
            .as_deref()
            .map_or_else(paths::cache_dir, Utf8PathBuf::from)
    }
}
