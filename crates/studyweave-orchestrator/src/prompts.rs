//! Prompts and structured result shapes of both phases.
//!
//! Phase 1 sees the whole chapter and answers with an [`Analysis`]: key
//! concepts, related chapters, and a handful of enhancement targets, each
//! quoting the excerpt it is about. Phase 2 sees one target's excerpt plus the
//! companion sections it names, never the chapter text, and answers with an
//! [`Enrichment`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use studyweave_extraction::ParseOptions;

use crate::document::{Chapter, CompanionExcerpt, Document};

pub const BLOCK_START: &str = "BEGIN_JSON";
pub const BLOCK_END: &str = "END_JSON";

pub const ANALYSIS_FIELDS: &[&str] = &["summary", "key_concepts", "related_chapters", "targets"];
pub const ENRICHMENT_FIELDS: &[&str] = &["synthesis", "related_chapters"];

/// Characters of a companion excerpt shown in the Phase 1 catalogue.
const CATALOGUE_PREVIEW_CHARS: usize = 240;

/// Phase 1 result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub summary: String,
    pub key_concepts: Vec<String>,
    pub related_chapters: Vec<String>,
    pub targets: Vec<Target>,
}

/// A section of a chapter worth a targeted enhancement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub concept: String,
    /// Passage of the chapter the enhancement is about.
    pub excerpt: String,
    /// Ids of the relevant companion excerpts.
    #[serde(default)]
    pub companion_sections: Vec<String>,
}

/// Phase 2 result for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrichment {
    pub synthesis: String,
    pub related_chapters: Vec<String>,
    #[serde(default)]
    pub cross_references: Vec<CrossReference>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossReference {
    pub book: String,
    pub section: String,
    pub note: String,
}

#[must_use]
pub fn analysis_parse_options() -> ParseOptions {
    ParseOptions::new()
        .delimiters(BLOCK_START, BLOCK_END)
        .require(ANALYSIS_FIELDS.iter().copied())
}

#[must_use]
pub fn enrichment_parse_options() -> ParseOptions {
    ParseOptions::new()
        .delimiters(BLOCK_START, BLOCK_END)
        .require(ENRICHMENT_FIELDS.iter().copied())
}

/// Degraded-mode Phase 1 payload: nothing to target.
#[must_use]
pub fn analysis_fallback() -> Map<String, Value> {
    let value = json!({
        "summary": "",
        "key_concepts": [],
        "related_chapters": [],
        "targets": [],
    });
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Degraded-mode Phase 2 payload.
#[must_use]
pub fn enrichment_fallback() -> Map<String, Value> {
    let value = json!({
        "synthesis": "",
        "related_chapters": [],
        "cross_references": [],
    });
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub const ANALYSIS_SYSTEM: &str = "You are a study-guide editor. You read one chapter of a \
textbook-derived study guide and decide where cross-references to other chapters and to \
companion books would help a reader most. You answer with a single JSON object between \
BEGIN_JSON and END_JSON and nothing else of substance.";

pub const ENRICHMENT_SYSTEM: &str = "You are a study-guide editor. You write a short synthesis \
connecting one passage of a chapter to companion-book sections and to other chapters. You \
answer with a single JSON object between BEGIN_JSON and END_JSON.";

/// Phase 1 prompt: the whole chapter plus catalogues of chapters and
/// companion excerpts to pick from.
#[must_use]
pub fn analysis_prompt(document: &Document, chapter: &Chapter, max_targets: usize) -> String {
    let chapters = document
        .chapters
        .iter()
        .filter(|c| c.id != chapter.id)
        .map(|c| format!("- {}: {}", c.id, c.title))
        .collect::<Vec<_>>()
        .join("\n");
    let companions = chapter
        .companion_excerpts
        .iter()
        .map(|e| format!("- {} ({}, {}): {}", e.id, e.book, e.section, preview(&e.text)))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"Document: {document_title}
Chapter {chapter_id}: {chapter_title}

# Other chapters

{chapters}

# Companion excerpts

{companions}

# Chapter text

{text}

# Your Task

Identify the key concepts of this chapter, the other chapters it relates to, and at most
{max_targets} passages that would benefit from a targeted cross-reference. For every target,
quote the passage verbatim and list the ids of the companion excerpts that are relevant to it.

Answer with exactly this shape:

{BLOCK_START}
{{
  "summary": "two sentences",
  "key_concepts": ["concept"],
  "related_chapters": ["chapter id"],
  "targets": [
    {{"id": "t1", "concept": "concept", "excerpt": "quoted passage", "companion_sections": ["excerpt id"]}}
  ]
}}
{BLOCK_END}"#,
        document_title = document.title,
        chapter_id = chapter.id,
        chapter_title = chapter.title,
        chapters = or_none(&chapters),
        companions = or_none(&companions),
        text = chapter.text,
    )
}

/// Phase 2 prompt: one target and its companion excerpts.
#[must_use]
pub fn enrichment_prompt(
    chapter: &Chapter,
    target: &Target,
    companions: &[&CompanionExcerpt],
    related_chapters: &[String],
) -> String {
    let companion_text = companions
        .iter()
        .map(|e| format!("## {} ({}, {})\n\n{}", e.id, e.book, e.section, e.text))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        r#"Chapter {chapter_id}: {chapter_title}
Concept: {concept}

# Passage

{excerpt}

# Companion sections

{companion_text}

# Related chapters

{related}

# Your Task

Write a synthesis of at most 150 words that connects the passage to the companion sections
and to the related chapters. Cite every companion section you use.

{BLOCK_START}
{{
  "synthesis": "text",
  "related_chapters": ["chapter id"],
  "cross_references": [{{"book": "title", "section": "section", "note": "why it matters"}}]
}}
{BLOCK_END}"#,
        chapter_id = chapter.id,
        chapter_title = chapter.title,
        concept = target.concept,
        excerpt = target.excerpt,
        companion_text = or_none(&companion_text),
        related = or_none(&related_chapters.join(", ")),
    )
}

fn preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(CATALOGUE_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}

fn or_none(section: &str) -> &str {
    if section.trim().is_empty() {
        "(none)"
    } else {
        section
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studyweave_extraction::parse_response;

    fn document() -> Document {
        let chapter = |id: &str, title: &str, text: &str| Chapter {
            id: id.to_string(),
            title: title.to_string(),
            text: text.to_string(),
            companion_excerpts: vec![CompanionExcerpt {
                id: "ddd-5".into(),
                book: "Domain-Driven Design".into(),
                section: "Chapter 5".into(),
                text: "word ".repeat(200),
            }],
        };
        Document {
            title: "Software Design".into(),
            chapters: vec![
                chapter("ch1", "Domain Modeling", "Entities have identity."),
                chapter("ch2", "Persistence", "Repositories store aggregates."),
            ],
        }
    }

    #[test]
    fn test_analysis_prompt_lists_other_chapters_only() {
        let doc = document();
        let prompt = analysis_prompt(&doc, &doc.chapters[0], 5);
        assert!(prompt.contains("- ch2: Persistence"));
        assert!(!prompt.contains("- ch1: Domain Modeling"));
        assert!(prompt.contains("Entities have identity."));
        assert!(prompt.contains("at most\n5 passages"));
        assert!(prompt.contains("..."));
    }

    #[test]
    fn test_enrichment_prompt_excludes_chapter_text() {
        let doc = document();
        let chapter = &doc.chapters[0];
        let target = Target {
            id: "t1".into(),
            concept: "Identity".into(),
            excerpt: "Entities have".into(),
            companion_sections: vec!["ddd-5".into()],
        };
        let companions: Vec<&CompanionExcerpt> = chapter.companion_excerpts.iter().collect();
        let prompt = enrichment_prompt(chapter, &target, &companions, &["ch2".to_string()]);
        assert!(prompt.contains("Concept: Identity"));
        assert!(prompt.contains("## ddd-5"));
        assert!(!prompt.contains("Entities have identity."));
    }

    #[test]
    fn test_fallbacks_satisfy_required_fields() {
        let raw = format!(
            "{BLOCK_START}\n{}\n{BLOCK_END}",
            Value::Object(analysis_fallback())
        );
        let parsed = parse_response(&raw, &analysis_parse_options()).unwrap();
        let analysis: Analysis = parsed.into_typed().unwrap();
        assert!(analysis.targets.is_empty());

        let enrichment: Enrichment =
            serde_json::from_value(Value::Object(enrichment_fallback())).unwrap();
        assert!(enrichment.cross_references.is_empty());
    }

    #[test]
    fn test_target_defaults_companion_sections() {
        let target: Target =
            serde_json::from_str(r#"{"id": "t1", "concept": "c", "excerpt": "e"}"#).unwrap();
        assert!(target.companion_sections.is_empty());
    }
}
