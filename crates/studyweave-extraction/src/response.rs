use std::collections::BTreeSet;

use serde_json::{Map, Value};
use studyweave_utils::canonicalization::payload_checksum;
use studyweave_utils::error::{ParseError, ValidationError};
use thiserror::Error;

use crate::block::{self, Delimiters};

/// Where the expected checksum of a payload comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChecksumPolicy {
    #[default]
    Skip,
    /// The payload carries its own checksum under this top-level key. The key
    /// is removed from `data` before the checksum is computed.
    Embedded { field: String },
    /// The caller already knows the checksum.
    Expected(String),
}

/// Outcome of the checksum comparison, before it is enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChecksumStatus {
    #[default]
    NotChecked,
    Matched,
    Missing,
    Mismatched { expected: String, actual: String },
}

#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    pub delimiters: Option<Delimiters>,
    pub required_fields: Vec<String>,
    pub checksum: ChecksumPolicy,
}

impl ParseOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn delimiters(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.delimiters = Some(Delimiters::new(start, end));
        self
    }

    #[must_use]
    pub fn require<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn checksum(mut self, policy: ChecksumPolicy) -> Self {
        self.checksum = policy;
        self
    }
}

/// A structured payload extracted from a provider response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub data: Map<String, Value>,
    pub raw_text: String,
    /// True only when a checksum was requested and matched.
    pub checksum_valid: bool,
    pub missing_required_fields: BTreeSet<String>,
    pub checksum_status: ChecksumStatus,
}

impl ParsedResponse {
    /// Enforce the required fields and checksum findings.
    ///
    /// All missing fields are reported together.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if !self.missing_required_fields.is_empty() {
            return Err(ValidationError::MissingFields {
                missing: self.missing_required_fields.iter().cloned().collect(),
            });
        }
        match &self.checksum_status {
            ChecksumStatus::Missing => Err(ValidationError::ChecksumMissing),
            ChecksumStatus::Mismatched { expected, actual } => {
                Err(ValidationError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual: actual.clone(),
                })
            }
            ChecksumStatus::NotChecked | ChecksumStatus::Matched => Ok(self),
        }
    }

    /// Deserialize `data` into a caller type.
    pub fn into_typed<T: serde::de::DeserializeOwned>(self) -> Result<T, ParseError> {
        serde_json::from_value(Value::Object(self.data)).map_err(|e| ParseError::Malformed {
            reason: e.to_string(),
        })
    }
}

/// Either stage of [`parse_response`] failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ResponseError {
    /// A truncated payload, worth retrying with a smaller output budget.
    #[must_use]
    pub const fn is_truncation(&self) -> bool {
        match self {
            Self::Parse(err) => err.is_truncation(),
            Self::Validation(_) => false,
        }
    }
}

const fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_checksum(data: &mut Map<String, Value>, policy: &ChecksumPolicy) -> ChecksumStatus {
    let expected = match policy {
        ChecksumPolicy::Skip => return ChecksumStatus::NotChecked,
        ChecksumPolicy::Expected(expected) => expected.clone(),
        ChecksumPolicy::Embedded { field } => match data.shift_remove(field) {
            Some(Value::String(expected)) => expected,
            Some(other) => other.to_string(),
            None => return ChecksumStatus::Missing,
        },
    };

    let actual = match payload_checksum(&Value::Object(data.clone())) {
        Ok(actual) => actual,
        Err(e) => {
            tracing::warn!(error = %e, "payload could not be canonicalized for checksum");
            String::new()
        }
    };
    if !actual.is_empty() && actual.eq_ignore_ascii_case(expected.trim()) {
        ChecksumStatus::Matched
    } else {
        ChecksumStatus::Mismatched { expected, actual }
    }
}

/// Extract the payload and record validation findings without enforcing them.
pub fn parse_unvalidated(raw: &str, options: &ParseOptions) -> Result<ParsedResponse, ParseError> {
    let block = block::locate(raw, options.delimiters.as_ref())?;

    let value: Value = serde_json::from_str(block).map_err(|e| {
        if e.is_eof() {
            ParseError::Incomplete {
                reason: e.to_string(),
            }
        } else {
            ParseError::Malformed {
                reason: e.to_string(),
            }
        }
    })?;

    let mut data = match value {
        Value::Object(map) => map,
        other => {
            return Err(ParseError::NotAnObject {
                kind: kind_of(&other).to_string(),
            });
        }
    };

    let checksum_status = check_checksum(&mut data, &options.checksum);
    let missing_required_fields = options
        .required_fields
        .iter()
        .filter(|field| !data.contains_key(field.as_str()))
        .cloned()
        .collect();

    Ok(ParsedResponse {
        data,
        raw_text: raw.to_string(),
        checksum_valid: checksum_status == ChecksumStatus::Matched,
        missing_required_fields,
        checksum_status,
    })
}

/// Parse and validate a raw provider response.
///
/// Fails with [`ResponseError::Parse`] when no object can be extracted and
/// with [`ResponseError::Validation`] when required fields are missing or the
/// checksum does not match.
pub fn parse_response(raw: &str, options: &ParseOptions) -> Result<ParsedResponse, ResponseError> {
    Ok(parse_unvalidated(raw, options)?.validate()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn checksum_of(value: &Value) -> String {
        payload_checksum(value).unwrap()
    }

    #[test]
    fn test_rejects_non_objects() {
        for (raw, kind) in [("[1, 2]", "array"), ("42", "number"), ("\"s\"", "string")] {
            let err = parse_response(raw, &ParseOptions::new()).unwrap_err();
            assert_eq!(
                err,
                ResponseError::Parse(ParseError::NotAnObject {
                    kind: kind.to_string()
                })
            );
        }
    }

    #[test]
    fn test_missing_required_fields_aggregated() {
        let options = ParseOptions::new().require(["summary", "related_chapters", "concepts"]);
        let err = parse_response("{\"summary\": \"s\"}", &options).unwrap_err();
        assert_eq!(
            err,
            ResponseError::Validation(ValidationError::MissingFields {
                missing: vec!["concepts".to_string(), "related_chapters".to_string()]
            })
        );
        assert!(!err.is_truncation());
    }

    #[test]
    fn test_unvalidated_reports_missing_without_failing() {
        let options = ParseOptions::new().require(["related_chapters"]);
        let parsed = parse_unvalidated("{\"summary\": null}", &options).unwrap();
        assert!(parsed.missing_required_fields.contains("related_chapters"));
        assert_eq!(parsed.data.get("summary"), Some(&Value::Null));
    }

    #[test]
    fn test_null_value_satisfies_required_field() {
        let options = ParseOptions::new().require(["related_chapters"]);
        parse_response("{\"related_chapters\": null}", &options).unwrap();
    }

    #[test]
    fn test_truncated_payload_is_truncation() {
        let err = parse_response("{\"summary\": \"cut off mid", &ParseOptions::new()).unwrap_err();
        assert!(err.is_truncation());
    }

    #[test]
    fn test_stray_brace_in_prose_does_not_hide_payload() {
        let raw = "Note: I left the {placeholder unclosed. {\"k\": \"v\"}";
        let parsed = parse_response(raw, &ParseOptions::new().require(["k"])).unwrap();
        assert_eq!(parsed.data["k"], "v");
    }

    #[test]
    fn test_expected_checksum() {
        let payload = json!({"b": [1, 2, {"z": null}], "a": "é"});
        let raw = payload.to_string();

        let ok = ParseOptions::new().checksum(ChecksumPolicy::Expected(checksum_of(&payload)));
        assert!(parse_response(&raw, &ok).unwrap().checksum_valid);

        let bad = ParseOptions::new().checksum(ChecksumPolicy::Expected("00".repeat(32)));
        assert!(matches!(
            parse_response(&raw, &bad),
            Err(ResponseError::Validation(
                ValidationError::ChecksumMismatch { .. }
            ))
        ));
    }

    #[test]
    fn test_embedded_checksum() {
        let payload = json!({"summary": "s", "concepts": ["x", "y"]});
        let mut with_sum = payload.clone();
        with_sum["checksum"] = Value::String(checksum_of(&payload));
        let options = ParseOptions::new().checksum(ChecksumPolicy::Embedded {
            field: "checksum".to_string(),
        });

        let parsed = parse_response(&format!("Result:\n{with_sum}\n"), &options).unwrap();
        assert!(parsed.checksum_valid);
        assert!(!parsed.data.contains_key("checksum"));
        assert_eq!(Value::Object(parsed.data), payload);

        let err = parse_response(&payload.to_string(), &options).unwrap_err();
        assert_eq!(
            err,
            ResponseError::Validation(ValidationError::ChecksumMissing)
        );
    }

    #[test]
    fn test_skip_checksum_is_not_valid_but_passes() {
        let parsed = parse_response("{\"a\": 1}", &ParseOptions::new()).unwrap();
        assert!(!parsed.checksum_valid);
        assert_eq!(parsed.checksum_status, ChecksumStatus::NotChecked);
    }

    #[test]
    fn test_large_payload_keeps_order_and_items() {
        let items: Vec<Value> = (0..5_000)
            .map(|i| json!({"id": i, "label": format!("概念 {i}")}))
            .collect();
        let payload = json!({"zeta": 1, "items": items, "alpha": 2});
        let raw = format!("Here you go:\n```json\n{payload}\n```");
        let parsed = parse_response(&raw, &ParseOptions::new().require(["items"])).unwrap();
        let keys: Vec<&str> = parsed.data.keys().map(String::as_str).collect();
        assert_eq!(keys, ["zeta", "items", "alpha"]);
        assert_eq!(parsed.data["items"].as_array().unwrap().len(), 5_000);
        assert_eq!(parsed.raw_text, raw);
    }

    #[test]
    fn test_into_typed() {
        #[derive(serde::Deserialize)]
        struct Out {
            summary: String,
        }
        let parsed = parse_response("{\"summary\": \"ok\"}", &ParseOptions::new()).unwrap();
        assert_eq!(parsed.into_typed::<Out>().unwrap().summary, "ok");
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "\\PC{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    fn arb_object() -> impl Strategy<Value = Map<String, Value>> {
        prop::collection::btree_map("[a-z_]{1,8}", arb_json(), 1..6)
            .prop_map(|m| m.into_iter().collect())
    }

    proptest! {
        #[test]
        fn prop_delimited_prose_matches_bare(
            object in arb_object(),
            before in "[A-Za-z .,!?]{0,40}",
            after in "[A-Za-z .,!?]{0,40}",
        ) {
            let payload = Value::Object(object);
            let bare = parse_response(&payload.to_string(), &ParseOptions::new()).unwrap();
            let raw = format!("{before}<<BEGIN>>\n{payload}\n<<end>>{after}");
            let wrapped = parse_response(&raw, &ParseOptions::new().delimiters("<<begin>>", "<<END>>")).unwrap();
            prop_assert_eq!(bare.data, wrapped.data);
        }

        #[test]
        fn prop_checksum_round_trip(object in arb_object()) {
            let payload = Value::Object(object);
            let options = ParseOptions::new().checksum(ChecksumPolicy::Expected(checksum_of(&payload)));
            prop_assert!(parse_response(&payload.to_string(), &options).unwrap().checksum_valid);
        }

        #[test]
        fn prop_checksum_detects_mutation(object in arb_object()) {
            let payload = Value::Object(object.clone());
            let options = ParseOptions::new().checksum(ChecksumPolicy::Expected(checksum_of(&payload)));
            let mut mutated = object;
            mutated.insert("__mutated".to_string(), Value::Bool(true));
            let result = parse_response(&Value::Object(mutated).to_string(), &options);
            let is_mismatch = matches!(
                result,
                Err(ResponseError::Validation(ValidationError::ChecksumMismatch { .. }))
            );
            prop_assert!(is_mismatch);
        }
    }
}
