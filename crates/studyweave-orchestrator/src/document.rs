//! Input document bundle handed over by the extraction pipeline.

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use studyweave_utils::canonicalization::{blake3_hex, canonical_bytes};
use studyweave_utils::error::StudyweaveError;

/// A document: its chapters in reading order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    pub chapters: Vec<Chapter>,
}

/// One chapter plus the companion-book context selected for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: String,
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub companion_excerpts: Vec<CompanionExcerpt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanionExcerpt {
    pub id: String,
    pub book: String,
    pub section: String,
    pub text: String,
}

impl Document {
    /// Read and validate a JSON document bundle.
    ///
    /// # Errors
    ///
    /// `StudyweaveError::InvalidInput` if the file cannot be read, is not a
    /// document, or fails [`Document::validate`].
    pub fn load(path: &Utf8Path) -> Result<Self, StudyweaveError> {
        let invalid = |reason: String| StudyweaveError::InvalidInput {
            path: path.to_string(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let document: Self = serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?;
        document.validate().map_err(invalid)?;
        Ok(document)
    }

    /// Chapter ids must be non-empty and unique; so must excerpt ids within
    /// a chapter.
    pub fn validate(&self) -> Result<(), String> {
        if self.chapters.is_empty() {
            return Err("document has no chapters".to_string());
        }
        let mut seen = HashSet::new();
        for chapter in &self.chapters {
            if chapter.id.trim().is_empty() {
                return Err(format!("chapter '{}' has an empty id", chapter.title));
            }
            if !seen.insert(chapter.id.as_str()) {
                return Err(format!("duplicate chapter id '{}'", chapter.id));
            }
            let mut excerpt_ids = HashSet::new();
            for excerpt in &chapter.companion_excerpts {
                if !excerpt_ids.insert(excerpt.id.as_str()) {
                    return Err(format!(
                        "duplicate companion excerpt id '{}' in chapter '{}'",
                        excerpt.id, chapter.id
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Chapter {
    /// Content hash of the chapter and its companion context.
    ///
    /// Ids do not take part, so a renamed chapter keeps its cache entries.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let content = serde_json::json!({
            "title": self.title,
            "text": self.text,
            "companion_excerpts": self.companion_excerpts,
        });
        // Serializing a `Value` built from strings cannot fail.
        canonical_bytes(&content).map_or_else(
            |_| blake3_hex(self.text.as_bytes()),
            |bytes| blake3_hex(&bytes),
        )
    }

    #[must_use]
    pub fn excerpt(&self, id: &str) -> Option<&CompanionExcerpt> {
        self.companion_excerpts.iter().find(|e| e.id == id)
    }
}
