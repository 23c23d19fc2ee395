//! Shared fixtures for unit and integration tests.

use camino::Utf8PathBuf;
use std::sync::Mutex;
use tempfile::TempDir;

/// Serializes tests that touch process environment variables.
pub static ENV_LOCK: Mutex<()> = Mutex::new(());

const ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

fn make_from(alphabet: &[u8], len: usize, seed: usize) -> String {
    let mut output = String::with_capacity(len);
    let mut idx = seed % alphabet.len();
    for _ in 0..len {
        output.push(alphabet[idx] as char);
        idx = (idx + 7) % alphabet.len();
    }
    output
}

/// Fake Anthropic-shaped key, never valid.
#[must_use]
pub fn fake_anthropic_key() -> String {
    format!("sk-ant-api03-{}", make_from(ALNUM, 40, 1))
}

/// Fake OpenRouter-shaped key, never valid.
#[must_use]
pub fn fake_openrouter_key() -> String {
    format!("sk-or-v1-{}", make_from(ALNUM, 48, 2))
}

/// Temp dir plus its UTF-8 path.
#[must_use]
pub fn utf8_temp_dir() -> (TempDir, Utf8PathBuf) {
    let temp = TempDir::new().expect("create temp dir");
    let path = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf-8 temp path");
    (temp, path)
}

/// A short chapter used across orchestrator tests.
#[must_use]
pub fn sample_chapter_text() -> &'static str {
    "Domain Modeling\n\n\
     An entity is defined by its identity, a value object by its attributes. \
     Aggregates draw consistency boundaries around clusters of entities, and \
     repositories hand out aggregate roots. Bounded contexts keep models honest."
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redaction::redact_error_message;

    #[test]
    fn test_fake_keys_are_redacted() {
        for key in [fake_anthropic_key(), fake_openrouter_key()] {
            let redacted = redact_error_message(&format!("bad key {key} rejected"));
            assert!(!redacted.contains(&key));
        }
    }

    #[test]
    fn test_utf8_temp_dir_exists() {
        let (_temp, path) = utf8_temp_dir();
        assert!(path.is_dir());
    }
}
