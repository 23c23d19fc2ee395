//! Turns free-form provider output into validated structured records.
//!
//! Provider responses are untrusted text. A response may wrap its payload in
//! prose, in custom delimiters, or in a Markdown code fence, and it may be cut
//! off mid-object when the provider hit its output limit. This crate finds the
//! payload, insists that it is a JSON object, and checks it against the
//! caller's required fields and checksum policy.
//!
//! Truncated payloads are reported as [`ParseError::Incomplete`] so that the
//! caller can retry with a smaller output budget.

mod block;
mod response;

pub use block::Delimiters;
pub use response::{
    parse_response, parse_unvalidated, ChecksumPolicy, ChecksumStatus, ParseOptions,
    ParsedResponse, ResponseError,
};
pub use studyweave_utils::error::{ParseError, ValidationError};
