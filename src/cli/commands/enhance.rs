//! `studyweave enhance`

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use studyweave_orchestrator::report::{write_chapter_documents, write_usage_report};

use crate::{
    CacheStore, Config, Document, ExitCode, Orchestrator, OrchestratorSettings, RunOutcome,
    StudyweaveError, UserFriendlyError, facade_from_config,
};

pub const USAGE_REPORT_FILE: &str = "usage-report.json";

/// Run both phases over the document at `input` and write results to `out`.
///
/// Chapter and target failures are reported and reflected in the returned
/// exit code; only run-level problems are errors.
pub async fn execute_enhance_command(input: &Path, out: &Path, config: &Config) -> Result<ExitCode> {
    let input = utf8(input)?;
    let out = utf8(out)?;

    let document = Document::load(&input)?;
    let (facade, fallback) = facade_from_config(config).map_err(StudyweaveError::Llm)?;
    if let Some(info) = &fallback {
        eprintln!(
            "⚠ Using fallback provider '{}' ({} unavailable)",
            info.fallback_provider, info.primary_provider
        );
    }

    let mut orchestrator = Orchestrator::new(facade, OrchestratorSettings::from_config(config))
        .with_fallback_info(fallback);
    if config.cache.enabled {
        match CacheStore::open(config.cache_dir()) {
            Ok(cache) => orchestrator = orchestrator.with_cache(Arc::new(cache)),
            Err(e) => warn!(error = %format!("{e:#}"), "cache unavailable, continuing without it"),
        }
    }

    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn(cancel_on_ctrl_c(cancel.clone()));
    let outcome = orchestrator.run(&document, &cancel).await;
    interrupt.abort();

    let enhanced: Vec<_> = outcome.enhanced().collect();
    let written = write_chapter_documents(&out, &enhanced)?;
    let report_path = out.join(USAGE_REPORT_FILE);
    write_usage_report(&report_path, &outcome.report)?;

    print_summary(&outcome, written.len(), &report_path);
    Ok(outcome.exit_code())
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupt received, cancelling in-flight chapters");
        eprintln!("⚠ Interrupted; finishing up and writing what is done");
        cancel.cancel();
    }
}

fn utf8(path: &Path) -> Result<Utf8PathBuf, StudyweaveError> {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).map_err(|p| StudyweaveError::InvalidInput {
        path: p.display().to_string(),
        reason: "path is not valid UTF-8".to_string(),
    })
}

fn print_summary(outcome: &RunOutcome, documents: usize, report_path: &Utf8Path) {
    let report = &outcome.report;
    println!("{}", report.document_title);
    for chapter in &report.chapters {
        println!(
            "  {:<10} {} ({} enrichments, {} omitted, {} tokens)",
            chapter.status.as_str(),
            chapter.chapter_id,
            chapter.enrichments,
            chapter.omissions,
            chapter.usage.total_tokens()
        );
    }
    for failed in &report.failed_targets {
        println!(
            "  ✗ target {}/{}: {}",
            failed.chapter_id, failed.target_id, failed.reason
        );
    }
    for failure in outcome.failures().filter(|f| !f.is_cancelled()) {
        println!("  ✗ {}", failure.user_message());
        for suggestion in failure.suggestions() {
            println!("      • {suggestion}");
        }
    }

    println!();
    println!(
        "Tokens: {} (phase 1: {}, phase 2: {})",
        report.total_tokens, report.phase1_tokens, report.phase2_tokens
    );
    println!(
        "Calls: {} provider, {} cache hits ({:.0}% of {} logical)",
        report.provider_calls,
        report.cache_hits,
        report.cache_hit_ratio * 100.0,
        report.logical_calls
    );
    println!("Estimated cost: ${:.4}", report.estimated_cost_usd);
    if report.degraded {
        println!("No provider configured: chapters were written without connections.");
    }
    if outcome.cancelled {
        println!("Run cancelled; re-run to finish from the cache.");
    }
    println!("Wrote {documents} chapter documents and {report_path}");
}
