use anyhow::{Context, Result};
use blake3::Hasher;
use serde::Serialize;
use serde_json::Value;
use unicode_normalization::UnicodeNormalization;

use crate::types::Phase;

/// Version tag mixed into every fingerprint. Bump it to orphan all cache entries.
pub const FINGERPRINT_VERSION: &str = "sw-fp-v1";
pub const CANONICALIZATION_BACKEND: &str = "jcs-rfc8785";

/// Emit a value as JCS-canonical JSON (RFC 8785).
///
/// This is the standard way to emit JSON for usage reports, cache entries
/// and checksums. JCS gives byte-identical output regardless of map ordering.
///
/// # Example
///
/// ```rust
/// use studyweave_utils::canonicalization::emit_jcs;
/// use serde_json::json;
///
/// let json = emit_jcs(&json!({"b": 1, "a": [true, null]})).unwrap();
/// assert_eq!(json, r#"{"a":[true,null],"b":1}"#);
/// ```
pub fn emit_jcs<T: Serialize>(value: &T) -> Result<String> {
    let json_bytes = canonical_bytes(value)?;
    String::from_utf8(json_bytes).with_context(|| "JCS output contained invalid UTF-8")
}

/// JCS bytes of any serializable value.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json_value =
        serde_json::to_value(value).with_context(|| "Failed to serialize value to JSON")?;
    serde_json_canonicalizer::to_vec(&json_value)
        .with_context(|| "Failed to canonicalize JSON using JCS")
}

/// BLAKE3 hex digest of raw bytes.
#[must_use]
pub fn blake3_hex(bytes: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize().to_hex().to_string()
}

/// Checksum of a structured payload: BLAKE3 over its JCS form.
///
/// Key order and whitespace never change the checksum; any change to a key or
/// value does.
pub fn payload_checksum(value: &Value) -> Result<String> {
    let bytes = serde_json_canonicalizer::to_vec(value)
        .with_context(|| "Failed to canonicalize payload for checksum")?;
    Ok(blake3_hex(&bytes))
}

/// Normalizes call inputs before they are fingerprinted.
///
/// Rules, applied in order:
/// 1. Unicode NFC
/// 2. `\r\n` and `\r` become `\n`
/// 3. Trailing whitespace removed from every line
/// 4. Leading and trailing blank space of the whole input removed
///
/// Two inputs that differ only in these respects share a cache entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct Canonicalizer;

impl Canonicalizer {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    #[must_use]
    pub const fn backend(&self) -> &'static str {
        CANONICALIZATION_BACKEND
    }

    #[must_use]
    pub fn normalize_input(&self, input: &str) -> String {
        let nfc: String = input.nfc().collect();
        let unified = self.normalize_line_endings(&nfc);
        let lines: Vec<&str> = unified.lines().map(str::trim_end).collect();
        lines.join("\n").trim().to_string()
    }

    /// Deterministic cache key for `(phase, input)`.
    ///
    /// Stable across calls and processes: it depends only on the version tag,
    /// the phase name and the normalized input.
    #[must_use]
    pub fn fingerprint(&self, phase: Phase, input: &str) -> String {
        let normalized = self.normalize_input(input);
        let mut hasher = Hasher::new();
        hasher.update(FINGERPRINT_VERSION.as_bytes());
        hasher.update(&[0]);
        hasher.update(phase.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(normalized.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    fn normalize_line_endings(&self, content: &str) -> String {
        content.replace("\r\n", "\n").replace('\r', "\n")
    }
}

/// Shorthand for `Canonicalizer::new().fingerprint(phase, input)`.
#[must_use]
pub fn fingerprint(phase: Phase, input: &str) -> String {
    Canonicalizer::new().fingerprint(phase, input)
}
