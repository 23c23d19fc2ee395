use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{EnumString, VariantNames};

/// Call phases of the two-phase enrichment strategy.
///
/// ```text
/// Phase1 (cheap, whole chapter) → Phase2 (targeted, one call per target)
/// ```
///
/// Phase 2 never runs for a chapter whose Phase 1 failed.
///
/// # Example
///
/// ```rust
/// use studyweave_utils::types::Phase;
///
/// assert_eq!(Phase::Analyze.as_str(), "phase1");
/// assert_eq!("phase2".parse::<Phase>().unwrap(), Phase::Enhance);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, VariantNames,
)]
pub enum Phase {
    /// Phase 1: whole-chapter analysis at a small output budget.
    #[serde(rename = "phase1")]
    #[strum(serialize = "phase1", serialize = "analyze")]
    Analyze,
    /// Phase 2: one enhancement call per target, excerpts only.
    #[serde(rename = "phase2")]
    #[strum(serialize = "phase2", serialize = "enhance")]
    Enhance,
}

impl Phase {
    /// Canonical name used in cache paths, call logs and reports.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "phase1",
            Self::Enhance => "phase2",
        }
    }

    /// All phases in execution order.
    #[must_use]
    pub const fn all() -> [Phase; 2] {
        [Phase::Analyze, Phase::Enhance]
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of a configuration value.
///
/// Serializes to lowercase strings: `"cli"`, `"config"`, `"default"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    /// Value came from a command-line flag.
    Cli,
    /// Value came from a configuration file.
    Config,
    /// Value came from built-in defaults.
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "cli"),
            Self::Config => write!(f, "config"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// Outcome of a single provider attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    FatalFailure,
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::TransientFailure => write!(f, "transient_failure"),
            Self::FatalFailure => write!(f, "fatal_failure"),
        }
    }
}

/// Input/output token pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One telemetry record for a call.
///
/// The generation facade writes one record per provider invocation, so a call
/// that needed three attempts produces three records. The orchestrator writes one
/// record with `cache_hit = true` and zero tokens for every cache hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallLogRecord {
    pub phase: Phase,
    pub chapter_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Attempt number of this invocation (0 for cache hits).
    pub attempt_count: u32,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<AttemptOutcome>,
}

impl CallLogRecord {
    /// Record for a cache hit: zero tokens, no provider invocation.
    #[must_use]
    pub fn cache_hit(phase: Phase, chapter_id: &str, target_id: Option<&str>) -> Self {
        Self {
            phase,
            chapter_id: chapter_id.to_string(),
            target_id: target_id.map(str::to_string),
            input_tokens: 0,
            output_tokens: 0,
            attempt_count: 0,
            duration: Duration::ZERO,
            cache_hit: true,
            outcome: Some(AttemptOutcome::Success),
        }
    }

    #[must_use]
    pub const fn tokens(&self) -> TokenUsage {
        TokenUsage::new(self.input_tokens, self.output_tokens)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_serialization() {
        assert_eq!(serde_json::to_string(&Phase::Analyze).unwrap(), r#""phase1""#);
        assert_eq!(serde_json::to_string(&Phase::Enhance).unwrap(), r#""phase2""#);

        let parsed: Phase = serde_json::from_str(r#""phase2""#).unwrap();
        assert_eq!(parsed, Phase::Enhance);
    }

    #[test]
    fn test_phase_from_str_accepts_aliases() {
        assert_eq!("phase1".parse::<Phase>().unwrap(), Phase::Analyze);
        assert_eq!("analyze".parse::<Phase>().unwrap(), Phase::Analyze);
        assert_eq!("enhance".parse::<Phase>().unwrap(), Phase::Enhance);
        assert!("phase3".parse::<Phase>().is_err());
    }

    #[test]
    fn test_token_usage_accumulates() {
        let mut usage = TokenUsage::default();
        usage.add(TokenUsage::new(100, 20));
        usage.add(TokenUsage::new(5, 7));
        assert_eq!(usage, TokenUsage::new(105, 27));
        assert_eq!(usage.total(), 132);
    }

    #[test]
    fn test_cache_hit_record_has_zero_cost() {
        let record = CallLogRecord::cache_hit(Phase::Enhance, "ch-1", Some("t-2"));
        assert!(record.cache_hit);
        assert_eq!(record.tokens().total(), 0);
        assert_eq!(record.attempt_count, 0);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["phase"], "phase2");
        assert_eq!(json["target_id"], "t-2");
        assert_eq!(json["duration"], 0);
    }
}
