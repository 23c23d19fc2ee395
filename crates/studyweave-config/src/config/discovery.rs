use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use studyweave_utils::error::ConfigError;
use studyweave_utils::paths;

use super::{CliArgs, Config, ConfigSource, RetrySettings};

/// TOML configuration file structure. Every field is optional so that the
/// file only overrides what it names.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlConfig {
    llm: Option<TomlLlm>,
    retry: Option<TomlRetry>,
    budgets: Option<TomlBudgets>,
    cache: Option<TomlCache>,
    concurrency: Option<TomlConcurrency>,
    pricing: Option<TomlPricing>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlLlm {
    provider: Option<String>,
    fallback_provider: Option<String>,
    call_limit: Option<u64>,
    attempt_timeout_secs: Option<u64>,
    anthropic: Option<TomlProvider>,
    openrouter: Option<TomlProvider>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlProvider {
    api_key_env: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlRetry {
    phase1: Option<TomlRetrySettings>,
    phase2: Option<TomlRetrySettings>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlRetrySettings {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    backoff_factor: Option<f64>,
    max_delay_ms: Option<u64>,
    min_output_budget: Option<u32>,
    budget_shrink_factor: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlBudgets {
    phase1_max_output_tokens: Option<u32>,
    phase2_max_output_tokens: Option<u32>,
    max_targets_per_chapter: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlCache {
    enabled: Option<bool>,
    dir: Option<String>,
    phase1_ttl_secs: Option<u64>,
    phase2_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlConcurrency {
    max_concurrent_calls: Option<usize>,
    max_concurrent_chapters: Option<usize>,
    max_concurrent_targets: Option<usize>,
    run_deadline_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlPricing {
    input_per_mtok_usd: Option<f64>,
    output_per_mtok_usd: Option<f64>,
}

/// Records where each resolved key came from.
struct Attribution<'a> {
    map: &'a mut HashMap<String, ConfigSource>,
    source: ConfigSource,
}

impl Attribution<'_> {
    fn set<T>(&mut self, key: &str, target: &mut T, value: Option<T>) {
        if let Some(value) = value {
            *target = value;
            self.map.insert(key.to_string(), self.source.clone());
        }
    }

    fn set_opt<T>(&mut self, key: &str, target: &mut Option<T>, value: Option<T>) {
        if value.is_some() {
            *target = value;
            self.map.insert(key.to_string(), self.source.clone());
        }
    }
}

/// Keys that always carry an attribution, `default` unless overridden.
const ATTRIBUTED_KEYS: &[&str] = &[
    "llm.provider",
    "llm.attempt_timeout_secs",
    "budgets.phase1_max_output_tokens",
    "budgets.phase2_max_output_tokens",
    "budgets.max_targets_per_chapter",
    "cache.enabled",
    "cache.phase1_ttl_secs",
    "cache.phase2_ttl_secs",
    "concurrency.max_concurrent_calls",
    "concurrency.max_concurrent_chapters",
    "concurrency.max_concurrent_targets",
    "retry.phase1.max_attempts",
    "retry.phase2.max_attempts",
];

impl Config {
    /// Discover and load configuration with precedence: CLI > file > defaults
    ///
    /// Uses the current working directory for config file discovery when no
    /// explicit path is provided in `cli_args`.
    pub fn discover(cli_args: &CliArgs) -> Result<Self> {
        let start_dir = std::env::current_dir().context("Failed to get current directory")?;
        Self::discover_from(&start_dir, cli_args)
    }

    /// Discover and load configuration starting from a specific directory.
    ///
    /// Errors are [`ConfigError`]s wrapped in `anyhow`, so callers can
    /// downcast to map them to an exit code.
    pub fn discover_from(start_dir: &Path, cli_args: &CliArgs) -> Result<Self> {
        let mut config = Config::default();
        for key in ATTRIBUTED_KEYS {
            config
                .source_attribution
                .insert((*key).to_string(), ConfigSource::Default);
        }

        let config_path = match &cli_args.config_path {
            Some(explicit) if !explicit.exists() => {
                return Err(ConfigError::NotFound {
                    path: explicit.display().to_string(),
                }
                .into());
            }
            Some(explicit) => Some(explicit.clone()),
            None => Self::discover_config_file_from(start_dir)?
                .or_else(|| paths::user_config_file().filter(|p| p.exists())),
        };

        if let Some(path) = &config_path {
            let file_config = Self::load_config_file(path)?;
            config.apply_file(file_config);
            config.config_path = Some(path.clone());
        }

        config.apply_cli(cli_args);
        config.validate()?;
        Ok(config)
    }

    /// Search upward from `start_dir` for `.studyweave/config.toml`, stopping
    /// at a repository root.
    pub fn discover_config_file_from(start_dir: &Path) -> Result<Option<PathBuf>> {
        let mut current_dir = start_dir.to_path_buf();

        loop {
            let config_path = current_dir.join(".studyweave").join("config.toml");
            if config_path.exists() {
                return Ok(Some(config_path));
            }

            if current_dir.join(".git").exists()
                || current_dir.join(".hg").exists()
                || current_dir.join(".svn").exists()
            {
                break;
            }

            match current_dir.parent() {
                Some(parent) => current_dir = parent.to_path_buf(),
                None => break,
            }
        }

        Ok(None)
    }

    fn load_config_file(path: &Path) -> Result<TomlConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).map_err(|e| {
            anyhow::Error::from(ConfigError::InvalidFile(format!("{}: {e}", path.display())))
        })
    }

    fn apply_file(&mut self, file: TomlConfig) {
        let mut attr = Attribution {
            map: &mut self.source_attribution,
            source: ConfigSource::Config,
        };

        if let Some(llm) = file.llm {
            attr.set_opt("llm.provider", &mut self.llm.provider, llm.provider);
            attr.set_opt(
                "llm.fallback_provider",
                &mut self.llm.fallback_provider,
                llm.fallback_provider,
            );
            attr.set_opt("llm.call_limit", &mut self.llm.call_limit, llm.call_limit);
            attr.set(
                "llm.attempt_timeout_secs",
                &mut self.llm.attempt_timeout_secs,
                llm.attempt_timeout_secs,
            );
            for (name, file_provider, target) in [
                ("anthropic", llm.anthropic, &mut self.llm.anthropic),
                ("openrouter", llm.openrouter, &mut self.llm.openrouter),
            ] {
                let Some(p) = file_provider else { continue };
                attr.set(
                    &format!("llm.{name}.api_key_env"),
                    &mut target.api_key_env,
                    p.api_key_env,
                );
                attr.set_opt(&format!("llm.{name}.base_url"), &mut target.base_url, p.base_url);
                attr.set_opt(&format!("llm.{name}.model"), &mut target.model, p.model);
                attr.set(
                    &format!("llm.{name}.temperature"),
                    &mut target.temperature,
                    p.temperature,
                );
            }
        }

        if let Some(retry) = file.retry {
            for (name, file_settings, target) in [
                ("phase1", retry.phase1, &mut self.retry.phase1),
                ("phase2", retry.phase2, &mut self.retry.phase2),
            ] {
                if let Some(s) = file_settings {
                    apply_retry(&mut attr, name, target, s);
                }
            }
        }

        if let Some(b) = file.budgets {
            attr.set(
                "budgets.phase1_max_output_tokens",
                &mut self.budgets.phase1_max_output_tokens,
                b.phase1_max_output_tokens,
            );
            attr.set(
                "budgets.phase2_max_output_tokens",
                &mut self.budgets.phase2_max_output_tokens,
                b.phase2_max_output_tokens,
            );
            attr.set(
                "budgets.max_targets_per_chapter",
                &mut self.budgets.max_targets_per_chapter,
                b.max_targets_per_chapter,
            );
        }

        if let Some(c) = file.cache {
            attr.set("cache.enabled", &mut self.cache.enabled, c.enabled);
            attr.set_opt("cache.dir", &mut self.cache.dir, c.dir);
            attr.set(
                "cache.phase1_ttl_secs",
                &mut self.cache.phase1_ttl_secs,
                c.phase1_ttl_secs,
            );
            attr.set(
                "cache.phase2_ttl_secs",
                &mut self.cache.phase2_ttl_secs,
                c.phase2_ttl_secs,
            );
        }

        if let Some(c) = file.concurrency {
            attr.set(
                "concurrency.max_concurrent_calls",
                &mut self.concurrency.max_concurrent_calls,
                c.max_concurrent_calls,
            );
            attr.set(
                "concurrency.max_concurrent_chapters",
                &mut self.concurrency.max_concurrent_chapters,
                c.max_concurrent_chapters,
            );
            attr.set(
                "concurrency.max_concurrent_targets",
                &mut self.concurrency.max_concurrent_targets,
                c.max_concurrent_targets,
            );
            attr.set_opt(
                "concurrency.run_deadline_secs",
                &mut self.concurrency.run_deadline_secs,
                c.run_deadline_secs,
            );
        }

        if let Some(p) = file.pricing {
            attr.set(
                "pricing.input_per_mtok_usd",
                &mut self.pricing.input_per_mtok_usd,
                p.input_per_mtok_usd,
            );
            attr.set(
                "pricing.output_per_mtok_usd",
                &mut self.pricing.output_per_mtok_usd,
                p.output_per_mtok_usd,
            );
        }
    }

    fn apply_cli(&mut self, cli: &CliArgs) {
        let mut attr = Attribution {
            map: &mut self.source_attribution,
            source: ConfigSource::Cli,
        };

        attr.set_opt("llm.provider", &mut self.llm.provider, cli.provider.clone());
        if let Some(model) = &cli.model {
            // --model applies to whichever provider ends up selected
            attr.set_opt("llm.anthropic.model", &mut self.llm.anthropic.model, Some(model.clone()));
            attr.set_opt(
                "llm.openrouter.model",
                &mut self.llm.openrouter.model,
                Some(model.clone()),
            );
        }
        attr.set_opt("llm.call_limit", &mut self.llm.call_limit, cli.call_limit);
        attr.set_opt("cache.dir", &mut self.cache.dir, cli.cache_dir.clone());
        if cli.no_cache {
            attr.set("cache.enabled", &mut self.cache.enabled, Some(false));
        }
        attr.set(
            "concurrency.max_concurrent_calls",
            &mut self.concurrency.max_concurrent_calls,
            cli.max_concurrent_calls,
        );
        attr.set_opt(
            "concurrency.run_deadline_secs",
            &mut self.concurrency.run_deadline_secs,
            cli.run_deadline_secs,
        );
    }
}

fn apply_retry(
    attr: &mut Attribution<'_>,
    phase: &str,
    target: &mut RetrySettings,
    s: TomlRetrySettings,
) {
    let key = |field: &str| format!("retry.{phase}.{field}");
    attr.set(&key("max_attempts"), &mut target.max_attempts, s.max_attempts);
    attr.set(&key("base_delay_ms"), &mut target.base_delay_ms, s.base_delay_ms);
    attr.set(&key("backoff_factor"), &mut target.backoff_factor, s.backoff_factor);
    attr.set(&key("max_delay_ms"), &mut target.max_delay_ms, s.max_delay_ms);
    attr.set(
        &key("min_output_budget"),
        &mut target.min_output_budget,
        s.min_output_budget,
    );
    attr.set(
        &key("budget_shrink_factor"),
        &mut target.budget_shrink_factor,
        s.budget_shrink_factor,
    );
}
