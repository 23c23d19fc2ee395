//! Enhanced chapter documents and the usage report on disk

use camino::{Utf8Path, Utf8PathBuf};
use std::fmt::Write as _;
use tracing::info;

use studyweave_utils::atomic_write::write_file_atomic;
use studyweave_utils::canonicalization::emit_jcs;
use studyweave_utils::error::StudyweaveError;
use studyweave_utils::paths::{ensure_dir_all, sanitize_file_stem};

use crate::result::EnhancementResult;
use crate::usage::UsageReport;

/// Render one enhanced chapter as Markdown.
///
/// The original text comes first, unchanged. Each enrichment follows as its
/// own section under "Connections", then a note per omitted target.
#[must_use]
pub fn render_markdown(result: &EnhancementResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}\n", result.title);
    out.push_str(result.original_text.trim_end());
    out.push_str("\n\n");

    if result.degraded {
        out.push_str("> Generated without a language model; no connections were added.\n\n");
    }

    let analysis = &result.analysis;
    if !analysis.summary.is_empty() || !analysis.key_concepts.is_empty() {
        out.push_str("## Chapter Overview\n\n");
        if !analysis.summary.is_empty() {
            let _ = writeln!(out, "{}\n", analysis.summary);
        }
        if !analysis.key_concepts.is_empty() {
            let _ = writeln!(out, "Key concepts: {}\n", analysis.key_concepts.join(", "));
        }
    }

    if !result.enrichments.is_empty() || !result.omissions.is_empty() {
        out.push_str("## Connections\n\n");
    }
    for item in &result.enrichments {
        let enrichment = &item.enrichment;
        let _ = writeln!(out, "### {}\n", item.concept);
        let _ = writeln!(out, "{}\n", enrichment.synthesis.trim());
        if !enrichment.related_chapters.is_empty() {
            let _ = writeln!(
                out,
                "Related chapters: {}\n",
                enrichment.related_chapters.join(", ")
            );
        }
        for reference in &enrichment.cross_references {
            let _ = writeln!(
                out,
                "- *{}*, {}: {}",
                reference.book, reference.section, reference.note
            );
        }
        if !enrichment.cross_references.is_empty() {
            out.push('\n');
        }
    }
    for omission in &result.omissions {
        let _ = writeln!(
            out,
            "> Omitted: {} ({}). {}\n",
            omission.concept, omission.target_id, omission.reason
        );
    }

    out
}

/// Write `<out_dir>/<chapter id>.md` for every result.
///
/// # Errors
///
/// [`StudyweaveError::ReportWriteFailed`] on the first file that cannot be written.
pub fn write_chapter_documents(
    out_dir: &Utf8Path,
    results: &[&EnhancementResult],
) -> Result<Vec<Utf8PathBuf>, StudyweaveError> {
    ensure_dir_all(out_dir).map_err(|e| StudyweaveError::ReportWriteFailed {
        path: out_dir.to_string(),
        reason: e.to_string(),
    })?;

    let mut written = Vec::with_capacity(results.len());
    for result in results {
        let path = out_dir.join(format!("{}.md", sanitize_file_stem(&result.chapter_id)));
        write_file_atomic(&path, &render_markdown(result)).map_err(|e| {
            StudyweaveError::ReportWriteFailed {
                path: path.to_string(),
                reason: format!("{e:#}"),
            }
        })?;
        written.push(path);
    }
    info!(count = written.len(), dir = %out_dir, "chapter documents written");
    Ok(written)
}

/// Write the usage report as canonical JSON.
///
/// # Errors
///
/// [`StudyweaveError::ReportWriteFailed`] when serialization or the write fails.
pub fn write_usage_report(path: &Utf8Path, report: &UsageReport) -> Result<(), StudyweaveError> {
    let failed = |reason: String| StudyweaveError::ReportWriteFailed {
        path: path.to_string(),
        reason,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
        ensure_dir_all(parent).map_err(|e| failed(e.to_string()))?;
    }
    let json = emit_jcs(report).map_err(|e| failed(format!("{e:#}")))?;
    write_file_atomic(path, &json).map_err(|e| failed(format!("{e:#}")))?;
    info!(path = %path, "usage report written");
    Ok(())
}
