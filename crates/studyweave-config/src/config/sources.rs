use std::collections::BTreeMap;

use super::{Config, ConfigSource};

impl Config {
    fn source_of(&self, key: &str) -> ConfigSource {
        self.source_attribution
            .get(key)
            .cloned()
            .unwrap_or(ConfigSource::Default)
    }

    /// Effective configuration as `key -> (value, source)`, sorted by key.
    ///
    /// Secrets never appear here; only the name of the key variable does.
    #[must_use]
    pub fn effective_config(&self) -> BTreeMap<String, (String, ConfigSource)> {
        let mut out = BTreeMap::new();
        let mut add = |key: &str, value: String| {
            out.insert(key.to_string(), (value, self.source_of(key)));
        };

        add(
            "llm.provider",
            self.llm.provider.clone().unwrap_or_else(|| "none".to_string()),
        );
        if let Some(fallback) = &self.llm.fallback_provider {
            add("llm.fallback_provider", fallback.clone());
        }
        if let Some(limit) = self.llm.call_limit {
            add("llm.call_limit", limit.to_string());
        }
        add(
            "llm.attempt_timeout_secs",
            self.llm.attempt_timeout_secs.to_string(),
        );
        for (name, provider) in [
            ("anthropic", &self.llm.anthropic),
            ("openrouter", &self.llm.openrouter),
        ] {
            add(&format!("llm.{name}.api_key_env"), provider.api_key_env.clone());
            if let Some(model) = &provider.model {
                add(&format!("llm.{name}.model"), model.clone());
            }
        }

        for (name, s) in [("phase1", &self.retry.phase1), ("phase2", &self.retry.phase2)] {
            add(&format!("retry.{name}.max_attempts"), s.max_attempts.to_string());
            add(&format!("retry.{name}.base_delay_ms"), s.base_delay_ms.to_string());
            add(&format!("retry.{name}.backoff_factor"), s.backoff_factor.to_string());
            add(&format!("retry.{name}.max_delay_ms"), s.max_delay_ms.to_string());
            add(
                &format!("retry.{name}.min_output_budget"),
                s.min_output_budget.to_string(),
            );
            add(
                &format!("retry.{name}.budget_shrink_factor"),
                s.budget_shrink_factor.to_string(),
            );
        }

        add(
            "budgets.phase1_max_output_tokens",
            self.budgets.phase1_max_output_tokens.to_string(),
        );
        add(
            "budgets.phase2_max_output_tokens",
            self.budgets.phase2_max_output_tokens.to_string(),
        );
        add(
            "budgets.max_targets_per_chapter",
            self.budgets.max_targets_per_chapter.to_string(),
        );
        add("cache.enabled", self.cache.enabled.to_string());
        add("cache.dir", self.cache_dir().to_string());
        add("cache.phase1_ttl_secs", self.cache.phase1_ttl_secs.to_string());
        add("cache.phase2_ttl_secs", self.cache.phase2_ttl_secs.to_string());
        add(
            "concurrency.max_concurrent_calls",
            self.concurrency.max_concurrent_calls.to_string(),
        );
        add(
            "concurrency.max_concurrent_chapters",
            self.concurrency.max_concurrent_chapters.to_string(),
        );
        add(
            "concurrency.max_concurrent_targets",
            self.concurrency.max_concurrent_targets.to_string(),
        );

        out
    }
}
