//! Two-phase chapter enhancement.
//!
//! [`Orchestrator::run`] takes a [`Document`], analyses every chapter once
//! (Phase 1), enhances the targets each analysis proposes (Phase 2), and
//! returns per-chapter results with a [`UsageReport`]. The [`report`] module
//! writes both to disk.

pub mod document;
mod orchestrator;
pub mod prompts;
pub mod report;
pub mod result;
pub mod state;
pub mod usage;

pub use document::{Chapter, CompanionExcerpt, Document};
pub use orchestrator::{Orchestrator, OrchestratorSettings, RunOutcome};
pub use prompts::{Analysis, CrossReference, Enrichment, Target};
pub use report::{render_markdown, write_chapter_documents, write_usage_report};
pub use result::{ChapterEnhancementError, ChapterUsage, EnhancementResult, Omission, TargetEnrichment};
pub use state::{ChapterState, ChapterStatus, ChapterTracker};
pub use usage::{UsageAggregator, UsageLedger, UsageReport, estimate_cost_usd};
