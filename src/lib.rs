//! studyweave - resilient two-phase LLM enrichment of study guides
//!
//! studyweave takes a document of textbook-derived chapters and adds
//! cross-references and synthesis to each one. Phase 1 analyses a whole
//! chapter once at a small output budget; Phase 2 enhances the few targets
//! that analysis picked, seeing only their excerpts. Every call goes through
//! a content-addressed cache, an adaptive retry engine that tightens the
//! output budget on truncation, and a structured-response validator.
//!
//! # Quick Start (CLI)
//!
//! ```bash
//! studyweave enhance --input guide.json --out enhanced/
//! studyweave cache stats
//! studyweave cache prune
//! ```
//!
//! # Quick Start (Library)
//!
//! ```rust,no_run
//! use studyweave::{Config, Document, Orchestrator, OrchestratorSettings, facade_from_config};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = Config::default();
//! let (facade, _fallback) = facade_from_config(&config)?;
//! let document = Document::load(camino::Utf8Path::new("guide.json"))?;
//! let outcome = Orchestrator::new(facade, OrchestratorSettings::from_config(&config))
//!     .run(&document, &CancellationToken::new())
//!     .await;
//! println!("{} tokens", outcome.report.total_tokens);
//! # Ok(())
//! # }
//! ```
//!
//! # JSON Contracts
//!
//! The usage report is emitted in JCS (RFC 8785) canonical form; use
//! [`emit_jcs`] for your own integrations.

// ============================================================================
// Stable Public API
// ============================================================================

pub use studyweave_config::{CliArgs, Config, ConfigSource};
pub use studyweave_utils::cache::{CacheStats, CacheStore, Invalidation};
pub use studyweave_utils::canonicalization::emit_jcs;
pub use studyweave_utils::error::{
    ConfigError, ErrorCategory, LlmError, ParseError, StudyweaveError, UserFriendlyError,
    ValidationError,
};
pub use studyweave_utils::exit_codes::ExitCode;
pub use studyweave_utils::types::{CallLogRecord, Phase, TokenUsage};

pub use studyweave_extraction::{ParseOptions, ParsedResponse, parse_response};
pub use studyweave_llm::{
    FacadeSettings, Generation, GenerationError, GenerationFacade, GenerationRequest, LlmBackend,
    RetryPolicy, facade_from_config, from_config_with_fallback,
};
pub use studyweave_orchestrator::{
    ChapterEnhancementError, ChapterStatus, Document, EnhancementResult, Orchestrator,
    OrchestratorSettings, RunOutcome, UsageReport,
};

// ============================================================================
// CLI
// ============================================================================

#[doc(hidden)]
pub mod cli;

/// Module re-exports for callers that need more than the stable surface.
#[doc(hidden)]
pub mod internals {
    pub use studyweave_extraction as extraction;
    pub use studyweave_llm as llm;
    pub use studyweave_orchestrator as orchestrator;
    pub use studyweave_utils as utils;
}
