//! Two-phase orchestration of a document run
//!
//! Chapters run concurrently up to `max_concurrent_chapters`. Inside a
//! chapter, Phase 1 analyses the whole text once; Phase 2 then fans out one
//! call per target, up to `max_concurrent_targets` at a time. The facade's
//! own limiter bounds the outbound provider calls of all of them together.
//!
//! Every call consults the cache first. A Phase 1 failure ends its chapter; a
//! failed Phase 2 target is omitted and the chapter becomes partial. Neither
//! stops the document run.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

use studyweave_config::{Config, PricingConfig};
use studyweave_llm::{GenerationError, GenerationFacade, GenerationRequest, LlmFallbackInfo};
use studyweave_utils::cache::CacheStore;
use studyweave_utils::canonicalization::{blake3_hex, canonical_bytes};
use studyweave_utils::exit_codes::ExitCode;
use studyweave_utils::logging::{chapter_span, log_cache_hit};
use studyweave_utils::redaction::redact_error_message;
use studyweave_utils::types::{CallLogRecord, Phase};

use crate::document::{Chapter, CompanionExcerpt, Document};
use crate::prompts::{
    ANALYSIS_SYSTEM, Analysis, ENRICHMENT_SYSTEM, Enrichment, Target, analysis_fallback,
    analysis_parse_options, analysis_prompt, enrichment_fallback, enrichment_parse_options,
    enrichment_prompt,
};
use crate::result::{ChapterEnhancementError, EnhancementResult, Omission, TargetEnrichment};
use crate::state::{ChapterState, ChapterTracker};
use crate::usage::{ChapterOutcomeView, ReportContext, UsageAggregator, UsageReport};

/// Orchestrator tuning, normally derived from [`Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub phase1_budget: u32,
    pub phase2_budget: u32,
    pub phase1_ttl: Duration,
    pub phase2_ttl: Duration,
    pub max_targets_per_chapter: usize,
    pub max_concurrent_chapters: usize,
    pub max_concurrent_targets: usize,
    /// Cancel the run once it has been going this long.
    pub run_deadline: Option<Duration>,
    pub pricing: PricingConfig,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl OrchestratorSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            phase1_budget: config.output_budget_for(Phase::Analyze),
            phase2_budget: config.output_budget_for(Phase::Enhance),
            phase1_ttl: config.cache_ttl_for(Phase::Analyze),
            phase2_ttl: config.cache_ttl_for(Phase::Enhance),
            max_targets_per_chapter: config.budgets.max_targets_per_chapter,
            max_concurrent_chapters: config.concurrency.max_concurrent_chapters,
            max_concurrent_targets: config.concurrency.max_concurrent_targets,
            run_deadline: config.concurrency.run_deadline_secs.map(Duration::from_secs),
            pricing: config.pricing,
        }
    }

    const fn ttl(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Analyze => self.phase1_ttl,
            Phase::Enhance => self.phase2_ttl,
        }
    }
}

/// Outcome of a whole document run.
#[derive(Debug)]
pub struct RunOutcome {
    /// One entry per chapter, in document order.
    pub chapters: Vec<Result<EnhancementResult, ChapterEnhancementError>>,
    pub report: UsageReport,
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn enhanced(&self) -> impl Iterator<Item = &EnhancementResult> {
        self.chapters.iter().filter_map(|c| c.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ChapterEnhancementError> {
        self.chapters.iter().filter_map(|c| c.as_ref().err())
    }

    /// Process exit status of the run.
    ///
    /// Cancellation wins over chapter failures, which win over omissions.
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        if self.cancelled {
            ExitCode::CANCELLED
        } else if self.failures().next().is_some() {
            ExitCode::CHAPTER_FAILED
        } else if self.enhanced().any(EnhancementResult::is_partial) {
            ExitCode::PARTIAL_SUCCESS
        } else {
            ExitCode::SUCCESS
        }
    }
}

pub struct Orchestrator {
    facade: GenerationFacade,
    cache: Option<Arc<CacheStore>>,
    settings: OrchestratorSettings,
    fallback: Option<LlmFallbackInfo>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(facade: GenerationFacade, settings: OrchestratorSettings) -> Self {
        Self {
            facade,
            cache: None,
            settings,
            fallback: None,
        }
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Note in the report that a fallback provider is in use.
    #[must_use]
    pub fn with_fallback_info(mut self, fallback: Option<LlmFallbackInfo>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Enhance every chapter of `document`.
    ///
    /// Never fails as a whole: chapter and target failures are contained and
    /// reported. Cancelling `cancel` abandons in-flight calls; whatever has
    /// not finished is reported as cancelled.
    pub async fn run(self, document: &Document, cancel: &CancellationToken) -> RunOutcome {
        let run_cancel = cancel.child_token();
        let deadline = self.settings.run_deadline.map(|limit| {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!(deadline_secs = limit.as_secs(), "run deadline reached, cancelling");
                token.cancel();
            })
        });

        let (usage, aggregator) = UsageAggregator::spawn();
        let provider = self.facade.provider_name().to_string();
        let degraded = self.facade.is_degraded();
        let pricing = self.settings.pricing;
        let max_chapters = self.settings.max_concurrent_chapters.max(1);

        info!(
            document = %document.title,
            chapters = document.chapters.len(),
            provider = %provider,
            degraded,
            cache = self.cache.is_some(),
            "starting document run"
        );

        let shared = Arc::new(Shared {
            facade: self.facade.with_call_log(usage.clone()),
            cache: self.cache,
            settings: self.settings,
            usage,
            document: Arc::new(document.clone()),
        });

        let permits = Arc::new(Semaphore::new(max_chapters));
        let mut tasks = JoinSet::new();
        let mut task_index = HashMap::new();
        for (index, chapter) in document.chapters.iter().enumerate() {
            let shared = Arc::clone(&shared);
            let permits = Arc::clone(&permits);
            let cancel = run_cancel.clone();
            let span = chapter_span(&chapter.id, &chapter.title);
            let handle = tasks.spawn(
                async move {
                    let _permit = permits.acquire_owned().await.ok();
                    shared.process_chapter(index, cancel).await
                }
                .instrument(span),
            );
            task_index.insert(handle.id(), index);
        }

        let mut runs: Vec<Option<ChapterRun>> = document.chapters.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, run)) => {
                    if let Some(&index) = task_index.get(&id) {
                        runs[index] = Some(run);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "chapter task ended abnormally");
                    if let Some(&index) = task_index.get(&e.id()) {
                        runs[index] = Some(ChapterRun::aborted(
                            &document.chapters[index],
                            e.to_string(),
                        ));
                    }
                }
            }
        }
        if let Some(timer) = deadline {
            timer.abort();
        }
        let cancelled = run_cancel.is_cancelled();

        // Dropping the facade closes the call log, which lets the aggregator finish.
        drop(shared);
        let ledger = aggregator.finish().await;

        let mut logical_calls = 0;
        let chapters: Vec<_> = runs
            .into_iter()
            .zip(&document.chapters)
            .map(|(run, chapter)| {
                let run = run.unwrap_or_else(|| {
                    ChapterRun::aborted(chapter, "chapter task did not report".to_string())
                });
                logical_calls += run.logical_calls;
                run.outcome.map(|mut result| {
                    result.usage = ledger.chapter(&result.chapter_id);
                    result
                })
            })
            .collect();

        let reasons: Vec<String> = chapters
            .iter()
            .filter_map(|c| c.as_ref().err().map(ChapterEnhancementError::reason))
            .collect();
        let mut reasons_iter = reasons.iter();
        let views: Vec<ChapterOutcomeView<'_>> = chapters
            .iter()
            .map(|c| match c {
                Ok(result) => ChapterOutcomeView::Enhanced(result),
                Err(e) => ChapterOutcomeView::Failed {
                    chapter_id: e.chapter_id(),
                    status: e.status(),
                    reason: reasons_iter.next().map_or("", String::as_str),
                },
            })
            .collect();

        let report = UsageReport::build(
            &ledger,
            &views,
            &ReportContext {
                document_title: &document.title,
                provider: &provider,
                fallback_provider: self
                    .fallback
                    .as_ref()
                    .map(|f| f.fallback_provider.as_str()),
                degraded,
                cancelled,
                logical_calls,
                pricing: &pricing,
            },
        );

        info!(
            provider_calls = report.provider_calls,
            cache_hits = report.cache_hits,
            total_tokens = report.total_tokens,
            failed_chapters = report.failed_chapters.len(),
            failed_targets = report.failed_targets.len(),
            cancelled,
            "document run finished"
        );

        RunOutcome {
            chapters,
            report,
            cancelled,
        }
    }
}

/// What a chapter task hands back.
struct ChapterRun {
    outcome: Result<EnhancementResult, ChapterEnhancementError>,
    logical_calls: u64,
}

impl ChapterRun {
    fn aborted(chapter: &Chapter, reason: String) -> Self {
        Self {
            outcome: Err(ChapterEnhancementError::Aborted {
                chapter_id: chapter.id.clone(),
                reason,
            }),
            logical_calls: 0,
        }
    }
}

enum TargetOutcome {
    Enriched(TargetEnrichment),
    Omitted(Omission),
    Cancelled,
}

/// State shared by all chapter and target tasks of one run.
struct Shared {
    facade: GenerationFacade,
    cache: Option<Arc<CacheStore>>,
    settings: OrchestratorSettings,
    usage: mpsc::UnboundedSender<CallLogRecord>,
    document: Arc<Document>,
}

impl Shared {
    async fn process_chapter(self: Arc<Self>, index: usize, cancel: CancellationToken) -> ChapterRun {
        let chapter = &self.document.chapters[index];
        let mut tracker = ChapterTracker::new(chapter.id.as_str());
        let cancelled = |tracker: &mut ChapterTracker, logical_calls| {
            tracker.advance(ChapterState::Cancelled);
            ChapterRun {
                outcome: Err(ChapterEnhancementError::Cancelled {
                    chapter_id: chapter.id.clone(),
                }),
                logical_calls,
            }
        };

        if cancel.is_cancelled() {
            return cancelled(&mut tracker, 0);
        }

        tracker.advance(ChapterState::Phase1Running);
        let fingerprint = chapter.fingerprint();
        let (analysis, mut degraded) = match self.analyze(chapter, &fingerprint, &cancel).await {
            Ok(found) => found,
            Err(e) if e.is_cancelled() => return cancelled(&mut tracker, 1),
            Err(e) => {
                tracker.advance(ChapterState::Phase1Failed);
                warn!(chapter_id = %chapter.id, reason = %e.reason(), "phase 1 failed, chapter skipped");
                return ChapterRun {
                    outcome: Err(e),
                    logical_calls: 1,
                };
            }
        };
        tracker.advance(ChapterState::Phase1Done);

        let targets = select_targets(&analysis.targets, self.settings.max_targets_per_chapter);
        if targets.len() < analysis.targets.len() {
            debug!(
                chapter_id = %chapter.id,
                proposed = analysis.targets.len(),
                kept = targets.len(),
                "dropping surplus or duplicate targets"
            );
        }

        let mut enrichments = Vec::new();
        let mut omissions = Vec::new();
        let mut logical_calls = 1;

        if !targets.is_empty() {
            tracker.advance(ChapterState::Phase2Running {
                finished: 0,
                total: targets.len(),
            });
            let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_targets.max(1)));
            let mut tasks = JoinSet::new();
            let mut task_slot = HashMap::new();
            for (slot, target) in targets.iter().enumerate() {
                let shared = Arc::clone(&self);
                let permits = Arc::clone(&permits);
                let cancel = cancel.clone();
                let fingerprint = fingerprint.clone();
                let target = target.clone();
                let related = analysis.related_chapters.clone();
                let handle = tasks.spawn(
                    async move {
                        let _permit = permits.acquire_owned().await.ok();
                        shared
                            .enhance_target(index, &fingerprint, &target, &related, &cancel)
                            .await
                    }
                    .instrument(Span::current()),
                );
                task_slot.insert(handle.id(), slot);
            }

            let mut outcomes: Vec<Option<TargetOutcome>> = targets.iter().map(|_| None).collect();
            while let Some(joined) = tasks.join_next_with_id().await {
                match joined {
                    Ok((id, outcome)) => {
                        if let Some(&slot) = task_slot.get(&id) {
                            outcomes[slot] = Some(outcome);
                        }
                    }
                    Err(e) => warn!(chapter_id = %chapter.id, error = %e, "target task ended abnormally"),
                }
                tracker.target_finished();
            }

            let mut any_cancelled = false;
            for (target, outcome) in targets.iter().zip(outcomes) {
                logical_calls += 1;
                match outcome {
                    Some(TargetOutcome::Enriched(enrichment)) => enrichments.push(enrichment),
                    Some(TargetOutcome::Omitted(omission)) => omissions.push(omission),
                    Some(TargetOutcome::Cancelled) => any_cancelled = true,
                    None => omissions.push(Omission {
                        target_id: target.id.clone(),
                        concept: target.concept.clone(),
                        reason: "enhancement task aborted".to_string(),
                    }),
                }
            }
            if any_cancelled || cancel.is_cancelled() {
                return cancelled(&mut tracker, logical_calls);
            }
            degraded |= self.facade.is_degraded();
        }

        let partial = !omissions.is_empty();
        tracker.advance(ChapterState::Done { partial });
        info!(
            chapter_id = %chapter.id,
            enrichments = enrichments.len(),
            omissions = omissions.len(),
            partial,
            "chapter finished"
        );

        ChapterRun {
            outcome: Ok(EnhancementResult {
                chapter_id: chapter.id.clone(),
                title: chapter.title.clone(),
                original_text: chapter.text.clone(),
                analysis,
                enrichments,
                omissions,
                usage: Default::default(),
                degraded,
            }),
            logical_calls,
        }
    }

    /// Phase 1: cached analysis or one facade call over the whole chapter.
    async fn analyze(
        &self,
        chapter: &Chapter,
        fingerprint: &str,
        cancel: &CancellationToken,
    ) -> Result<(Analysis, bool), ChapterEnhancementError> {
        let input = analysis_cache_input(
            &self.document,
            chapter,
            fingerprint,
            self.settings.max_targets_per_chapter,
        );
        if let Some(analysis) = self.cached::<Analysis>(Phase::Analyze, &input, &chapter.id, None) {
            return Ok((analysis, false));
        }

        let request = GenerationRequest::new(
            Phase::Analyze,
            chapter.id.as_str(),
            ANALYSIS_SYSTEM,
            analysis_prompt(&self.document, chapter, self.settings.max_targets_per_chapter),
            self.settings.phase1_budget,
        )
        .with_parse_options(analysis_parse_options())
        .with_fallback(analysis_fallback());

        let generation = self
            .facade
            .call(&request, cancel)
            .await
            .map_err(|e| match e {
                GenerationError::Cancelled => ChapterEnhancementError::Cancelled {
                    chapter_id: chapter.id.clone(),
                },
                source => ChapterEnhancementError::Phase1 {
                    chapter_id: chapter.id.clone(),
                    source,
                },
            })?;

        let data = Value::Object(generation.response.data);
        let analysis: Analysis = serde_json::from_value(data.clone()).map_err(|e| {
            ChapterEnhancementError::InvalidAnalysis {
                chapter_id: chapter.id.clone(),
                reason: e.to_string(),
            }
        })?;
        if !generation.degraded {
            self.store(Phase::Analyze, &input, &data);
        }
        Ok((analysis, generation.degraded))
    }

    /// Phase 2 for one target: excerpt and companion sections only.
    async fn enhance_target(
        &self,
        index: usize,
        fingerprint: &str,
        target: &Target,
        related_chapters: &[String],
        cancel: &CancellationToken,
    ) -> TargetOutcome {
        let chapter = &self.document.chapters[index];
        let companions: Vec<&CompanionExcerpt> = target
            .companion_sections
            .iter()
            .filter_map(|id| {
                let found = chapter.excerpt(id);
                if found.is_none() {
                    debug!(target_id = %target.id, excerpt_id = %id, "unknown companion excerpt");
                }
                found
            })
            .collect();
        let cache_input = target_cache_input(fingerprint, target, &companions);

        if let Some(enrichment) =
            self.cached::<Enrichment>(Phase::Enhance, &cache_input, &chapter.id, Some(&target.id))
        {
            return TargetOutcome::Enriched(TargetEnrichment {
                target_id: target.id.clone(),
                concept: target.concept.clone(),
                enrichment,
                cache_hit: true,
            });
        }
        if cancel.is_cancelled() {
            return TargetOutcome::Cancelled;
        }

        let request = GenerationRequest::new(
            Phase::Enhance,
            chapter.id.as_str(),
            ENRICHMENT_SYSTEM,
            enrichment_prompt(chapter, target, &companions, related_chapters),
            self.settings.phase2_budget,
        )
        .with_target(target.id.as_str())
        .with_parse_options(enrichment_parse_options())
        .with_fallback(enrichment_fallback());

        let omitted = |reason: String| {
            let reason = redact_error_message(&reason);
            warn!(chapter_id = %chapter.id, target_id = %target.id, reason = %reason, "target omitted");
            TargetOutcome::Omitted(Omission {
                target_id: target.id.clone(),
                concept: target.concept.clone(),
                reason,
            })
        };

        match self.facade.call(&request, cancel).await {
            Ok(generation) => {
                let data = Value::Object(generation.response.data);
                match serde_json::from_value::<Enrichment>(data.clone()) {
                    Ok(enrichment) => {
                        if !generation.degraded {
                            self.store(Phase::Enhance, &cache_input, &data);
                        }
                        TargetOutcome::Enriched(TargetEnrichment {
                            target_id: target.id.clone(),
                            concept: target.concept.clone(),
                            enrichment,
                            cache_hit: false,
                        })
                    }
                    Err(e) => omitted(format!("unusable enrichment: {e}")),
                }
            }
            Err(GenerationError::Cancelled) => TargetOutcome::Cancelled,
            Err(e) => omitted(e.to_string()),
        }
    }

    /// Typed cache lookup. A hit is logged and sent to the usage ledger; an
    /// entry of the wrong shape counts as a miss.
    fn cached<T: serde::de::DeserializeOwned>(
        &self,
        phase: Phase,
        input: &str,
        chapter_id: &str,
        target_id: Option<&str>,
    ) -> Option<T> {
        let value = self.cache.as_ref()?.get(phase, input)?;
        match serde_json::from_value(value) {
            Ok(typed) => {
                log_cache_hit(phase, chapter_id, target_id);
                if self
                    .usage
                    .send(CallLogRecord::cache_hit(phase, chapter_id, target_id))
                    .is_err()
                {
                    debug!("usage aggregator gone");
                }
                Some(typed)
            }
            Err(e) => {
                debug!(phase = %phase, chapter_id, error = %e, "cached entry has an unexpected shape");
                None
            }
        }
    }

    fn store(&self, phase: Phase, input: &str, value: &Value) {
        if let Some(cache) = &self.cache {
            cache.put(phase, input, value, self.settings.ttl(phase));
        }
    }
}

/// Targets in proposal order, first occurrence of an id wins, capped.
fn select_targets(proposed: &[Target], max: usize) -> Vec<Target> {
    let mut seen = HashSet::new();
    proposed
        .iter()
        .filter(|t| !t.id.trim().is_empty() && seen.insert(t.id.as_str()))
        .take(max)
        .cloned()
        .collect()
}

/// Phase 1 cache input: the chapter fingerprint and a digest of the rest of
/// the analysis prompt (document title, chapter id, catalogue, target cap).
fn analysis_cache_input(
    document: &Document,
    chapter: &Chapter,
    fingerprint: &str,
    max_targets: usize,
) -> String {
    let catalogue: Vec<[&str; 2]> = document
        .chapters
        .iter()
        .filter(|c| c.id != chapter.id)
        .map(|c| [c.id.as_str(), c.title.as_str()])
        .collect();
    let material = serde_json::json!({
        "document_title": document.title,
        "chapter_id": chapter.id,
        "catalogue": catalogue,
        "max_targets": max_targets,
    });
    let digest = canonical_bytes(&material).map_or_else(
        |_| blake3_hex(material.to_string().as_bytes()),
        |bytes| blake3_hex(&bytes),
    );
    format!("{fingerprint}\n{digest}")
}

/// Phase 2 cache input: the chapter fingerprint, the target id, and a digest
/// of everything the target's prompt is built from.
fn target_cache_input(fingerprint: &str, target: &Target, companions: &[&CompanionExcerpt]) -> String {
    let material = serde_json::json!({
        "concept": target.concept,
        "excerpt": target.excerpt,
        "companions": companions,
    });
    let digest = canonical_bytes(&material).map_or_else(
        |_| blake3_hex(target.excerpt.as_bytes()),
        |bytes| blake3_hex(&bytes),
    );
    format!("{fingerprint}\n{}\n{digest}", target.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::CompanionExcerpt;
    use crate::state::ChapterStatus;
    use proptest::prelude::*;
    use studyweave_llm::testing::{Scripted, ScriptedBackend};
    use studyweave_llm::{FacadeSettings, LlmBackend, LlmError, LlmInvocation, RetryPolicy};
    use studyweave_utils::test_support::{sample_chapter_text, utf8_temp_dir};

    fn target(id: &str) -> Target {
        Target {
            id: id.to_string(),
            concept: format!("concept {id}"),
            excerpt: format!("excerpt {id}"),
            companion_sections: vec!["ddd-5".to_string()],
        }
    }

    #[test]
    fn test_select_targets_dedupes_and_caps() {
        let proposed = vec![target("t1"), target("t2"), target("t1"), target(" "), target("t3")];
        let kept = select_targets(&proposed, 2);
        assert_eq!(
            kept.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["t1", "t2"]
        );
    }

    proptest! {
        #[test]
        fn prop_selected_targets_are_unique_ordered_and_capped(
            ids in proptest::collection::vec("[a-d]", 0..12),
            max in 0usize..6,
        ) {
            let proposed: Vec<Target> = ids.iter().map(|id| target(id)).collect();
            let kept = select_targets(&proposed, max);

            prop_assert!(kept.len() <= max);
            let kept_ids: Vec<&str> = kept.iter().map(|t| t.id.as_str()).collect();
            let unique: HashSet<&str> = kept_ids.iter().copied().collect();
            prop_assert_eq!(unique.len(), kept_ids.len());

            let mut first_seen: Vec<&str> = Vec::new();
            for id in &ids {
                if !first_seen.contains(&id.as_str()) {
                    first_seen.push(id);
                }
            }
            first_seen.truncate(max);
            prop_assert_eq!(kept_ids, first_seen);
        }
    }

    #[test]
    fn test_target_cache_input_tracks_excerpts() {
        let excerpt = CompanionExcerpt {
            id: "ddd-5".into(),
            book: "DDD".into(),
            section: "5".into(),
            text: "Entities".into(),
        };
        let mut changed = excerpt.clone();
        changed.text.push('!');

        let a = target_cache_input("fp", &target("t1"), &[&excerpt]);
        assert_eq!(a, target_cache_input("fp", &target("t1"), &[&excerpt]));
        assert_ne!(a, target_cache_input("fp", &target("t1"), &[&changed]));
        assert_ne!(a, target_cache_input("fp", &target("t2"), &[&excerpt]));
        assert!(a.starts_with("fp\nt1\n"));
    }

    #[test]
    fn test_analysis_cache_input_tracks_catalogue_and_cap() {
        let doc = document(&["ch1", "ch2", "ch3"]);
        let chapter = &doc.chapters[0];
        let fp = chapter.fingerprint();
        let base = analysis_cache_input(&doc, chapter, &fp, 5);
        assert_eq!(base, analysis_cache_input(&doc, chapter, &fp, 5));
        assert!(base.starts_with(&format!("{fp}\n")));

        assert_ne!(base, analysis_cache_input(&doc, chapter, &fp, 3));

        let mut renamed = doc.clone();
        renamed.chapters[2].title = "Persistence".into();
        assert_ne!(base, analysis_cache_input(&renamed, &renamed.chapters[0], &fp, 5));

        let shrunk = document(&["ch1", "ch2"]);
        assert_ne!(base, analysis_cache_input(&shrunk, &shrunk.chapters[0], &fp, 5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_catalogue_change_misses_phase1_cache() {
        let (_temp, dir) = utf8_temp_dir();
        let cache = Arc::new(CacheStore::open(dir.join("cache")).unwrap());
        let backend = Arc::new(ScriptedBackend::always(Scripted::json(analysis_json(0))));

        for doc in [document(&["ch1", "ch2"]), document(&["ch1", "ch2"]), document(&["ch1"])] {
            let facade = fast_facade(Arc::clone(&backend) as Arc<dyn LlmBackend>);
            Orchestrator::new(facade, OrchestratorSettings::default())
                .with_cache(Arc::clone(&cache))
                .run(&doc, &CancellationToken::new())
                .await;
        }
        // Two analyses for the first run, none for the repeat, one for the
        // single-chapter document whose ch1 catalogue changed.
        assert_eq!(backend.call_count(), 3);
    }

    fn document(chapters: &[&str]) -> Document {
        Document {
            title: "Software Design".into(),
            chapters: chapters
                .iter()
                .map(|id| Chapter {
                    id: (*id).to_string(),
                    title: format!("Title {id}"),
                    text: sample_chapter_text().to_string(),
                    companion_excerpts: vec![CompanionExcerpt {
                        id: "ddd-5".into(),
                        book: "Domain-Driven Design".into(),
                        section: "5".into(),
                        text: "Entities and value objects.".into(),
                    }],
                })
                .collect(),
        }
    }

    fn analysis_json(targets: usize) -> String {
        let targets: Vec<String> = (1..=targets)
            .map(|i| {
                format!(
                    r#"{{"id": "t{i}", "concept": "c{i}", "excerpt": "e{i}", "companion_sections": ["ddd-5"]}}"#
                )
            })
            .collect();
        format!(
            r#"Here you go.
BEGIN_JSON
{{"summary": "s", "key_concepts": ["entity"], "related_chapters": ["ch2"], "targets": [{}]}}
END_JSON"#,
            targets.join(", ")
        )
    }

    const ENRICHMENT: &str = r#"BEGIN_JSON {"synthesis": "linked", "related_chapters": ["ch2"]} END_JSON"#;

    fn fast_facade(backend: Arc<dyn LlmBackend>) -> GenerationFacade {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(1),
            min_output_budget: 128,
            shrink_factor: 0.5,
        };
        GenerationFacade::new(
            Some(backend),
            FacadeSettings {
                analyze_policy: policy,
                enhance_policy: policy,
                attempt_timeout: Duration::from_secs(5),
                max_concurrent_calls: 4,
                call_limit: None,
            },
        )
    }

    fn responder(targets: usize, failing: Option<&'static str>) -> ScriptedBackend {
        ScriptedBackend::from_fn(move |inv: &LlmInvocation, _| match inv.phase {
            Phase::Analyze => Scripted::json(analysis_json(targets)),
            Phase::Enhance if inv.target_id.as_deref() == failing => {
                Scripted::Fail(LlmError::ProviderOutage("503".into()))
            }
            Phase::Enhance => Scripted::json(ENRICHMENT),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failed_target_makes_chapter_partial() {
        let backend = Arc::new(responder(5, Some("t3")));
        let orchestrator = Orchestrator::new(
            fast_facade(Arc::clone(&backend) as Arc<dyn LlmBackend>),
            OrchestratorSettings::default(),
        );

        let outcome = orchestrator
            .run(&document(&["ch1"]), &CancellationToken::new())
            .await;

        let result = outcome.chapters[0].as_ref().unwrap();
        assert_eq!(result.enrichments.len(), 4);
        assert_eq!(result.omissions.len(), 1);
        assert_eq!(result.omissions[0].target_id, "t3");
        assert!(result.omissions[0].reason.contains("retries exhausted"));
        assert_eq!(result.status(), ChapterStatus::Partial);
        assert_eq!(
            result
                .enrichments
                .iter()
                .map(|e| e.target_id.as_str())
                .collect::<Vec<_>>(),
            vec!["t1", "t2", "t4", "t5"]
        );

        assert_eq!(outcome.exit_code(), ExitCode::PARTIAL_SUCCESS);
        assert_eq!(outcome.report.failed_targets.len(), 1);
        // 1 analysis + 4 enrichments + 2 attempts at t3.
        assert_eq!(backend.call_count(), 7);
        assert_eq!(outcome.report.provider_calls, 7);
        assert_eq!(outcome.report.logical_calls, 6);
        assert_eq!(result.usage.provider_calls, 7);
        assert_eq!(result.usage.phase1.input_tokens, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase2_prompts_never_carry_chapter_text() {
        let backend = Arc::new(responder(2, None));
        let orchestrator = Orchestrator::new(
            fast_facade(Arc::clone(&backend) as Arc<dyn LlmBackend>),
            OrchestratorSettings::default(),
        );
        orchestrator
            .run(&document(&["ch1"]), &CancellationToken::new())
            .await;

        let invocations = backend.invocations();
        let text = sample_chapter_text();
        for inv in &invocations {
            let prompt = &inv.messages[1].content;
            match inv.phase {
                Phase::Analyze => assert!(prompt.contains(text)),
                Phase::Enhance => {
                    assert!(!prompt.contains(text));
                    assert!(inv.target_id.is_some());
                }
            }
        }
        assert_eq!(invocations.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase1_failure_does_not_stop_other_chapters() {
        let backend = Arc::new(ScriptedBackend::from_fn(|inv: &LlmInvocation, _| {
            match (inv.phase, inv.chapter_id.as_str()) {
                (Phase::Analyze, "ch1") => Scripted::json(r#"{"summary": "missing the rest"}"#),
                (Phase::Analyze, _) => Scripted::json(analysis_json(1)),
                (Phase::Enhance, _) => Scripted::json(ENRICHMENT),
            }
        }));
        let orchestrator = Orchestrator::new(
            fast_facade(backend as Arc<dyn LlmBackend>),
            OrchestratorSettings::default(),
        );

        let outcome = orchestrator
            .run(&document(&["ch1", "ch2"]), &CancellationToken::new())
            .await;

        let err = outcome.chapters[0].as_ref().unwrap_err();
        assert_eq!(err.status(), ChapterStatus::Failed);
        assert!(err.reason().contains("missing required fields"));
        assert!(outcome.chapters[1].is_ok());
        assert_eq!(outcome.exit_code(), ExitCode::CHAPTER_FAILED);
        assert_eq!(outcome.report.failed_chapters[0].chapter_id, "ch1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_is_served_from_cache() {
        let (_temp, dir) = utf8_temp_dir();
        let cache = Arc::new(CacheStore::open(dir.join("cache")).unwrap());
        let doc = document(&["ch1"]);

        let backend = Arc::new(responder(2, None));
        let first = Orchestrator::new(
            fast_facade(Arc::clone(&backend) as Arc<dyn LlmBackend>),
            OrchestratorSettings::default(),
        )
        .with_cache(Arc::clone(&cache))
        .run(&doc, &CancellationToken::new())
        .await;
        assert_eq!(first.report.provider_calls, 3);
        assert_eq!(first.report.cache_hits, 0);

        let second = Orchestrator::new(
            fast_facade(Arc::clone(&backend) as Arc<dyn LlmBackend>),
            OrchestratorSettings::default(),
        )
        .with_cache(Arc::clone(&cache))
        .run(&doc, &CancellationToken::new())
        .await;
        assert_eq!(backend.call_count(), 3);
        assert_eq!(second.report.provider_calls, 0);
        assert_eq!(second.report.cache_hits, 3);
        assert!((second.report.cache_hit_ratio - 1.0).abs() < f64::EPSILON);
        let result = second.chapters[0].as_ref().unwrap();
        assert!(result.enrichments.iter().all(|e| e.cache_hit));
        assert_eq!(result.usage.total_tokens(), 0);
    }

    #[tokio::test]
    async fn test_degraded_run_writes_nothing_to_cache() {
        let (_temp, dir) = utf8_temp_dir();
        let cache = Arc::new(CacheStore::open(dir.join("cache")).unwrap());
        let orchestrator = Orchestrator::new(
            GenerationFacade::new(None, FacadeSettings::default()),
            OrchestratorSettings::default(),
        )
        .with_cache(Arc::clone(&cache));

        let outcome = orchestrator
            .run(&document(&["ch1"]), &CancellationToken::new())
            .await;

        let result = outcome.chapters[0].as_ref().unwrap();
        assert!(result.degraded);
        assert!(result.enrichments.is_empty());
        assert!(outcome.report.degraded);
        assert_eq!(outcome.report.provider, "none");
        assert_eq!(cache.stats().writes, 0);
        assert_eq!(outcome.exit_code(), ExitCode::SUCCESS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_reports_unfinished_chapters() {
        let backend = Arc::new(ScriptedBackend::always(Scripted::Hang));
        let (_temp, dir) = utf8_temp_dir();
        let cache = Arc::new(CacheStore::open(dir.join("cache")).unwrap());
        let mut settings = OrchestratorSettings::default();
        settings.run_deadline = Some(Duration::from_secs(2));
        let orchestrator = Orchestrator::new(
            fast_facade(backend as Arc<dyn LlmBackend>),
            settings,
        )
        .with_cache(Arc::clone(&cache));

        let outcome = orchestrator
            .run(&document(&["ch1", "ch2", "ch3"]), &CancellationToken::new())
            .await;

        assert!(outcome.cancelled);
        assert!(outcome.report.cancelled);
        assert!(outcome.chapters.iter().all(|c| c
            .as_ref()
            .is_err_and(ChapterEnhancementError::is_cancelled)));
        assert_eq!(outcome.exit_code(), ExitCode::CANCELLED);
        assert_eq!(cache.stats().writes, 0);
    }
}
