use studyweave_utils::error::ConfigError;

use super::{Config, RetrySettings};

const KNOWN_PROVIDERS: &[&str] = &["anthropic", "openrouter", "none"];

fn invalid(key: &str, value: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.into(),
    }
}

impl Config {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, provider) in [
            ("llm.provider", &self.llm.provider),
            ("llm.fallback_provider", &self.llm.fallback_provider),
        ] {
            if let Some(name) = provider
                && !KNOWN_PROVIDERS.contains(&name.as_str())
            {
                return Err(invalid(
                    key,
                    format!("unknown provider '{name}' (expected anthropic, openrouter or none)"),
                ));
            }
        }

        if self.llm.call_limit == Some(0) {
            return Err(invalid("llm.call_limit", "must be greater than 0"));
        }
        if self.llm.attempt_timeout_secs == 0 {
            return Err(invalid("llm.attempt_timeout_secs", "must be greater than 0"));
        }
        for (name, provider) in [
            ("anthropic", &self.llm.anthropic),
            ("openrouter", &self.llm.openrouter),
        ] {
            if !(0.0..=2.0).contains(&provider.temperature) {
                return Err(invalid(
                    &format!("llm.{name}.temperature"),
                    format!("{} is outside 0.0..=2.0", provider.temperature),
                ));
            }
        }

        validate_retry("retry.phase1", &self.retry.phase1)?;
        validate_retry("retry.phase2", &self.retry.phase2)?;

        if self.budgets.phase1_max_output_tokens == 0 {
            return Err(invalid("budgets.phase1_max_output_tokens", "must be greater than 0"));
        }
        if self.budgets.phase2_max_output_tokens == 0 {
            return Err(invalid("budgets.phase2_max_output_tokens", "must be greater than 0"));
        }
        for (phase, retry, budget) in [
            ("phase1", &self.retry.phase1, self.budgets.phase1_max_output_tokens),
            ("phase2", &self.retry.phase2, self.budgets.phase2_max_output_tokens),
        ] {
            if retry.min_output_budget > budget {
                return Err(invalid(
                    &format!("retry.{phase}.min_output_budget"),
                    format!(
                        "{} exceeds budgets.{phase}_max_output_tokens {budget}",
                        retry.min_output_budget
                    ),
                ));
            }
        }
        if self.budgets.max_targets_per_chapter == 0 {
            return Err(invalid("budgets.max_targets_per_chapter", "must be greater than 0"));
        }

        for (key, value) in [
            (
                "concurrency.max_concurrent_calls",
                self.concurrency.max_concurrent_calls,
            ),
            (
                "concurrency.max_concurrent_chapters",
                self.concurrency.max_concurrent_chapters,
            ),
            (
                "concurrency.max_concurrent_targets",
                self.concurrency.max_concurrent_targets,
            ),
        ] {
            if value == 0 {
                return Err(invalid(key, "must be greater than 0"));
            }
        }
        if self.concurrency.run_deadline_secs == Some(0) {
            return Err(invalid("concurrency.run_deadline_secs", "must be greater than 0"));
        }

        if self.pricing.input_per_mtok_usd < 0.0 || self.pricing.output_per_mtok_usd < 0.0 {
            return Err(invalid("pricing", "prices cannot be negative"));
        }

        Ok(())
    }
}

fn validate_retry(prefix: &str, s: &RetrySettings) -> Result<(), ConfigError> {
    if s.max_attempts == 0 {
        return Err(invalid(&format!("{prefix}.max_attempts"), "must be greater than 0"));
    }
    if s.max_attempts > 20 {
        return Err(invalid(
            &format!("{prefix}.max_attempts"),
            "exceeds maximum limit of 20",
        ));
    }
    if !s.backoff_factor.is_finite() || s.backoff_factor < 1.0 {
        return Err(invalid(
            &format!("{prefix}.backoff_factor"),
            format!("{} must be at least 1.0", s.backoff_factor),
        ));
    }
    if s.base_delay_ms > s.max_delay_ms {
        return Err(invalid(
            &format!("{prefix}.base_delay_ms"),
            format!(
                "{} exceeds max_delay_ms {}",
                s.base_delay_ms, s.max_delay_ms
            ),
        ));
    }
    if !(s.budget_shrink_factor > 0.0 && s.budget_shrink_factor <= 1.0) {
        return Err(invalid(
            &format!("{prefix}.budget_shrink_factor"),
            format!("{} is outside (0, 1]", s.budget_shrink_factor),
        ));
    }
    if s.min_output_budget == 0 {
        return Err(invalid(
            &format!("{prefix}.min_output_budget"),
            "must be greater than 0",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_of(err: ConfigError) -> String {
        match err {
            ConfigError::InvalidValue { key, .. } => key,
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_backoff_below_one() {
        let mut config = Config::default();
        config.retry.phase1.backoff_factor = 0.5;
        assert_eq!(
            key_of(config.validate().unwrap_err()),
            "retry.phase1.backoff_factor"
        );
    }

    #[test]
    fn test_rejects_base_delay_above_max() {
        let mut config = Config::default();
        config.retry.phase2.base_delay_ms = 10_000;
        config.retry.phase2.max_delay_ms = 5_000;
        assert_eq!(
            key_of(config.validate().unwrap_err()),
            "retry.phase2.base_delay_ms"
        );
    }

    #[test]
    fn test_rejects_shrink_factor_out_of_range() {
        for bad in [0.0, -0.1, 1.5, f64::NAN] {
            let mut config = Config::default();
            config.retry.phase1.budget_shrink_factor = bad;
            assert_eq!(
                key_of(config.validate().unwrap_err()),
                "retry.phase1.budget_shrink_factor"
            );
        }
        let mut config = Config::default();
        config.retry.phase1.budget_shrink_factor = 1.0;
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_caps_and_budgets() {
        let mut config = Config::default();
        config.concurrency.max_concurrent_targets = 0;
        assert_eq!(
            key_of(config.validate().unwrap_err()),
            "concurrency.max_concurrent_targets"
        );

        let mut config = Config::default();
        config.budgets.phase2_max_output_tokens = 0;
        assert_eq!(
            key_of(config.validate().unwrap_err()),
            "budgets.phase2_max_output_tokens"
        );
    }

    #[test]
    fn test_rejects_floor_above_phase_budget() {
        let mut config = Config::default();
        config.retry.phase1.min_output_budget = 2_048;
        assert_eq!(
            key_of(config.validate().unwrap_err()),
            "retry.phase1.min_output_budget"
        );
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let mut config = Config::default();
        config.llm.provider = Some("gpt-cli".to_string());
        assert_eq!(key_of(config.validate().unwrap_err()), "llm.provider");
    }
}
