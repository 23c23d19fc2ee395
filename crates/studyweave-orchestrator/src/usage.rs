//! Token and call accounting
//!
//! A single aggregator task owns the [`UsageLedger`]. The generation facade
//! and the orchestrator only send [`CallLogRecord`]s over a channel, so the
//! ledger has exactly one writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use studyweave_config::PricingConfig;
use studyweave_utils::types::{CallLogRecord, Phase, TokenUsage};

use crate::result::{ChapterUsage, EnhancementResult};
use crate::state::ChapterStatus;

/// Accumulated usage of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageLedger {
    chapters: BTreeMap<String, ChapterUsage>,
    total: ChapterUsage,
    records: u64,
}

impl UsageLedger {
    pub fn record(&mut self, record: &CallLogRecord) {
        let chapter = self.chapters.entry(record.chapter_id.clone()).or_default();
        for usage in [chapter, &mut self.total] {
            match record.phase {
                Phase::Analyze => usage.phase1.add(record.tokens()),
                Phase::Enhance => usage.phase2.add(record.tokens()),
            }
            if record.cache_hit {
                usage.cache_hits += 1;
            } else {
                usage.provider_calls += 1;
            }
        }
        self.records += 1;
    }

    #[must_use]
    pub fn chapter(&self, chapter_id: &str) -> ChapterUsage {
        self.chapters.get(chapter_id).copied().unwrap_or_default()
    }

    #[must_use]
    pub const fn total(&self) -> ChapterUsage {
        self.total
    }

    /// Records received, cache hits included.
    #[must_use]
    pub const fn records(&self) -> u64 {
        self.records
    }
}

/// Handle on the aggregator task.
#[derive(Debug)]
pub struct UsageAggregator {
    handle: JoinHandle<UsageLedger>,
}

impl UsageAggregator {
    /// Start the aggregator. It runs until every sender is dropped.
    #[must_use]
    pub fn spawn() -> (mpsc::UnboundedSender<CallLogRecord>, Self) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<CallLogRecord>();
        let handle = tokio::spawn(async move {
            let mut ledger = UsageLedger::default();
            while let Some(record) = receiver.recv().await {
                ledger.record(&record);
            }
            ledger
        });
        (sender, Self { handle })
    }

    /// Wait for the remaining records and return the ledger.
    pub async fn finish(self) -> UsageLedger {
        match self.handle.await {
            Ok(ledger) => ledger,
            Err(e) => {
                warn!(error = %e, "usage aggregator failed; usage figures are incomplete");
                UsageLedger::default()
            }
        }
    }
}

/// Dollar estimate from per-million-token prices.
#[must_use]
pub fn estimate_cost_usd(usage: TokenUsage, pricing: &PricingConfig) -> f64 {
    let cost = (usage.input_tokens as f64 * pricing.input_per_mtok_usd
        + usage.output_tokens as f64 * pricing.output_per_mtok_usd)
        / 1_000_000.0;
    (cost * 1_000_000.0).round() / 1_000_000.0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTarget {
    pub chapter_id: String,
    pub target_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedChapter {
    pub chapter_id: String,
    pub status: ChapterStatus,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub chapter_id: String,
    pub status: ChapterStatus,
    pub enrichments: usize,
    pub omissions: usize,
    pub usage: ChapterUsage,
}

/// Document-level usage report, written as canonical JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub document_title: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_provider: Option<String>,
    pub degraded: bool,
    pub cancelled: bool,
    pub phase1_tokens: u64,
    pub phase2_tokens: u64,
    pub total_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub provider_calls: u64,
    pub logical_calls: u64,
    pub cache_hits: u64,
    pub cache_hit_ratio: f64,
    pub estimated_cost_usd: f64,
    pub failed_targets: Vec<FailedTarget>,
    pub failed_chapters: Vec<FailedChapter>,
    pub chapters: Vec<ChapterSummary>,
}

/// Everything besides the ledger that goes into a [`UsageReport`].
#[derive(Debug, Clone)]
pub struct ReportContext<'a> {
    pub document_title: &'a str,
    pub provider: &'a str,
    pub fallback_provider: Option<&'a str>,
    pub degraded: bool,
    pub cancelled: bool,
    /// Facade calls plus cache hits.
    pub logical_calls: u64,
    pub pricing: &'a PricingConfig,
}

impl UsageReport {
    pub const SCHEMA_VERSION: &'static str = "1";

    #[must_use]
    pub fn build(
        ledger: &UsageLedger,
        chapters: &[ChapterOutcomeView<'_>],
        ctx: &ReportContext<'_>,
    ) -> Self {
        let total = ledger.total();
        let mut tokens = total.phase1;
        tokens.add(total.phase2);

        let mut failed_targets = Vec::new();
        let mut failed_chapters = Vec::new();
        let mut summaries = Vec::new();
        for chapter in chapters {
            match chapter {
                ChapterOutcomeView::Enhanced(result) => {
                    failed_targets.extend(result.omissions.iter().map(|o| FailedTarget {
                        chapter_id: result.chapter_id.clone(),
                        target_id: o.target_id.clone(),
                        reason: o.reason.clone(),
                    }));
                    summaries.push(ChapterSummary {
                        chapter_id: result.chapter_id.clone(),
                        status: result.status(),
                        enrichments: result.enrichments.len(),
                        omissions: result.omissions.len(),
                        usage: ledger.chapter(&result.chapter_id),
                    });
                }
                ChapterOutcomeView::Failed {
                    chapter_id,
                    status,
                    reason,
                } => {
                    failed_chapters.push(FailedChapter {
                        chapter_id: (*chapter_id).to_string(),
                        status: *status,
                        reason: (*reason).to_string(),
                    });
                    summaries.push(ChapterSummary {
                        chapter_id: (*chapter_id).to_string(),
                        status: *status,
                        enrichments: 0,
                        omissions: 0,
                        usage: ledger.chapter(chapter_id),
                    });
                }
            }
        }

        let cache_hit_ratio = if ctx.logical_calls == 0 {
            0.0
        } else {
            total.cache_hits as f64 / ctx.logical_calls as f64
        };

        Self {
            schema_version: Self::SCHEMA_VERSION.to_string(),
            generated_at: Utc::now(),
            document_title: ctx.document_title.to_string(),
            provider: ctx.provider.to_string(),
            fallback_provider: ctx.fallback_provider.map(str::to_string),
            degraded: ctx.degraded,
            cancelled: ctx.cancelled,
            phase1_tokens: total.phase1.total(),
            phase2_tokens: total.phase2.total(),
            total_tokens: tokens.total(),
            input_tokens: tokens.input_tokens,
            output_tokens: tokens.output_tokens,
            provider_calls: total.provider_calls,
            logical_calls: ctx.logical_calls,
            cache_hits: total.cache_hits,
            cache_hit_ratio,
            estimated_cost_usd: estimate_cost_usd(tokens, ctx.pricing),
            failed_targets,
            failed_chapters,
            chapters: summaries,
        }
    }
}

/// Borrowed view of one chapter's outcome for report building.
#[derive(Debug, Clone, Copy)]
pub enum ChapterOutcomeView<'a> {
    Enhanced(&'a EnhancementResult),
    Failed {
        chapter_id: &'a str,
        status: ChapterStatus,
        reason: &'a str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use studyweave_utils::types::AttemptOutcome;

    fn provider_record(phase: Phase, chapter: &str, input: u64, output: u64) -> CallLogRecord {
        CallLogRecord {
            phase,
            chapter_id: chapter.to_string(),
            target_id: None,
            input_tokens: input,
            output_tokens: output,
            attempt_count: 1,
            duration: Duration::from_millis(10),
            cache_hit: false,
            outcome: Some(AttemptOutcome::Success),
        }
    }

    #[tokio::test]
    async fn test_aggregator_splits_phases_and_chapters() {
        let (sender, aggregator) = UsageAggregator::spawn();
        sender
            .send(provider_record(Phase::Analyze, "ch1", 1000, 100))
            .unwrap();
        sender
            .send(provider_record(Phase::Enhance, "ch1", 300, 400))
            .unwrap();
        sender
            .send(CallLogRecord::cache_hit(Phase::Analyze, "ch2", None))
            .unwrap();
        drop(sender);

        let ledger = aggregator.finish().await;
        let ch1 = ledger.chapter("ch1");
        assert_eq!(ch1.phase1, TokenUsage::new(1000, 100));
        assert_eq!(ch1.phase2, TokenUsage::new(300, 400));
        assert_eq!(ch1.provider_calls, 2);
        assert_eq!(ledger.chapter("ch2").cache_hits, 1);
        assert_eq!(ledger.total().total_tokens(), 1800);
        assert_eq!(ledger.records(), 3);
        assert_eq!(ledger.chapter("missing"), ChapterUsage::default());
    }

    #[tokio::test]
    async fn test_concurrent_senders_are_all_counted() {
        let (sender, aggregator) = UsageAggregator::spawn();
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..32 {
            let sender = sender.clone();
            tasks.spawn(async move {
                let phase = if i % 2 == 0 { Phase::Analyze } else { Phase::Enhance };
                sender.send(provider_record(phase, "ch1", 10, 1)).unwrap();
            });
        }
        while tasks.join_next().await.is_some() {}
        drop(sender);

        let total = aggregator.finish().await.total();
        assert_eq!(total.provider_calls, 32);
        assert_eq!(total.phase1.input_tokens, 160);
        assert_eq!(total.phase2.output_tokens, 16);
    }

    #[test]
    fn test_cost_estimate() {
        let pricing = PricingConfig {
            input_per_mtok_usd: 3.0,
            output_per_mtok_usd: 15.0,
        };
        let cost = estimate_cost_usd(TokenUsage::new(1_000_000, 100_000), &pricing);
        assert!((cost - 4.5).abs() < 1e-9);
        assert_eq!(estimate_cost_usd(TokenUsage::default(), &pricing), 0.0);
    }

    #[test]
    fn test_report_lists_failures() {
        let mut ledger = UsageLedger::default();
        ledger.record(&provider_record(Phase::Analyze, "ch1", 100, 10));
        ledger.record(&CallLogRecord::cache_hit(Phase::Analyze, "ch2", None));

        let pricing = PricingConfig::default();
        let ctx = ReportContext {
            document_title: "Book",
            provider: "scripted",
            fallback_provider: None,
            degraded: false,
            cancelled: false,
            logical_calls: 2,
            pricing: &pricing,
        };
        let chapters = [
            ChapterOutcomeView::Failed {
                chapter_id: "ch1",
                status: ChapterStatus::Failed,
                reason: "phase 1 failed",
            },
            ChapterOutcomeView::Failed {
                chapter_id: "ch2",
                status: ChapterStatus::Cancelled,
                reason: "cancelled",
            },
        ];
        let report = UsageReport::build(&ledger, &chapters, &ctx);

        assert_eq!(report.phase1_tokens, 110);
        assert_eq!(report.total_tokens, 110);
        assert_eq!(report.cache_hits, 1);
        assert!((report.cache_hit_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(report.failed_chapters.len(), 2);
        assert_eq!(report.chapters[1].usage.cache_hits, 1);
    }
}
