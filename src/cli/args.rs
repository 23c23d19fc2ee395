//! CLI argument definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::Phase;

/// studyweave - two-phase LLM enrichment of study guides
#[derive(Parser, Debug)]
#[command(name = "studyweave")]
#[command(about = "Add cross-references and synthesis to textbook-derived study guides")]
#[command(long_about = r#"
studyweave enriches a document of study-guide chapters in two phases: a cheap
analysis of every chapter, then targeted enhancement calls for the passages the
analysis picked. Results are cached, so re-running only pays for what changed.

EXAMPLES:
  # Enhance a document with the configured provider
  studyweave enhance --input guide.json --out enhanced/

  # Use OpenRouter with a specific model, bypassing the cache
  studyweave enhance --input guide.json --out enhanced/ --provider openrouter \
      --model anthropic/claude-sonnet-4 --no-cache

  # Inspect and maintain the cache
  studyweave cache stats
  studyweave cache prune
  studyweave cache clear --phase phase1

CONFIGURATION:
  Precedence: CLI flags > config file > defaults.
  The config file is discovered by searching upward from the working directory
  for .studyweave/config.toml; --config names one explicitly.

EXIT CODES:
  0 complete, 3 some targets omitted, 4 a chapter failed, 2 bad arguments or
  input, 70 provider unusable, 130 cancelled.
"#)]
#[command(version)]
pub struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Cache directory (default: $STUDYWEAVE_HOME/cache)
    #[arg(long, global = true)]
    pub cache_dir: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as one JSON object per line
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Enhance every chapter of a document
    ///
    /// Writes `<out>/<chapter id>.md` for each enhanced chapter and
    /// `<out>/usage-report.json`.
    Enhance {
        /// Document bundle (JSON: title, chapters)
        #[arg(long)]
        input: PathBuf,

        /// Output directory
        #[arg(long)]
        out: PathBuf,

        /// Provider: anthropic, openrouter, or none (degraded mode)
        #[arg(long)]
        provider: Option<String>,

        /// Model for the selected provider
        #[arg(long)]
        model: Option<String>,

        /// Neither read nor write the cache
        #[arg(long)]
        no_cache: bool,

        /// Stop after this many provider calls
        #[arg(long)]
        call_limit: Option<u64>,

        /// Maximum concurrent provider calls
        #[arg(long)]
        max_concurrent_calls: Option<usize>,

        /// Cancel the run after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Inspect or maintain the result cache
    #[command(subcommand)]
    Cache(CacheCommands),
}

#[derive(Subcommand, Debug, Clone)]
pub enum CacheCommands {
    /// Show entry counts and disk usage
    Stats {
        /// Output as canonical JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove expired and unreadable entries
    Prune,

    /// Remove entries, all of them or one phase's
    Clear {
        /// Only this phase (phase1 or phase2)
        #[arg(long)]
        phase: Option<Phase>,
    },
}

impl Commands {
    /// Short operation name for error reports.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        match self {
            Self::Enhance { .. } => "enhance",
            Self::Cache(_) => "cache",
        }
    }
}
