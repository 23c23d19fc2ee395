//! Exit code constants for the `studyweave` binary.
//!
//! # Exit Code Table
//!
//! | Code | Constant | Description |
//! |------|----------|-------------|
//! | 0 | `SUCCESS` | Every chapter enhanced completely |
//! | 1 | `INTERNAL` | General/internal failure |
//! | 2 | `CLI_ARGS` | Invalid CLI arguments, configuration or input document |
//! | 3 | `PARTIAL_SUCCESS` | Some Phase 2 targets omitted, no chapter failed |
//! | 4 | `CHAPTER_FAILED` | At least one chapter's Phase 1 failed |
//! | 70 | `PROVIDER_FAILURE` | Provider unusable before any chapter ran |
//! | 130 | `CANCELLED` | Run interrupted or past its deadline |

/// Exit codes matching the documented exit code table.
///
/// # Example
///
/// ```rust
/// use studyweave_utils::exit_codes::ExitCode;
///
/// assert_eq!(ExitCode::SUCCESS.as_i32(), 0);
/// assert_eq!(ExitCode::from_i32(3), ExitCode::PARTIAL_SUCCESS);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(i32);

impl ExitCode {
    /// Success - every chapter was enhanced completely
    pub const SUCCESS: ExitCode = ExitCode(0);

    /// Internal error - general failure
    pub const INTERNAL: ExitCode = ExitCode(1);

    /// CLI arguments error - invalid arguments, configuration or input
    pub const CLI_ARGS: ExitCode = ExitCode(2);

    /// Partial success - one or more Phase 2 targets were omitted
    pub const PARTIAL_SUCCESS: ExitCode = ExitCode(3);

    /// Chapter failed - at least one chapter had no usable Phase 1 result
    pub const CHAPTER_FAILED: ExitCode = ExitCode(4);

    /// Provider failure - the provider could not be used at all
    pub const PROVIDER_FAILURE: ExitCode = ExitCode(70);

    /// Cancelled - interrupted by the user or the run deadline
    pub const CANCELLED: ExitCode = ExitCode(130);

    /// Get the numeric exit code value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Create an ExitCode from a raw i32 value.
    ///
    /// Prefer using the named constants when possible.
    #[must_use]
    pub const fn from_i32(code: i32) -> Self {
        ExitCode(code)
    }

    /// Stable name for the code, used in the usage report.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self.0 {
            0 => "success",
            2 => "cli_args",
            3 => "partial_success",
            4 => "chapter_failed",
            70 => "provider_failure",
            130 => "cancelled",
            _ => "internal",
        }
    }
}

impl From<i32> for ExitCode {
    fn from(code: i32) -> Self {
        ExitCode(code)
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.0
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(u8::try_from(code.0).unwrap_or(1))
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
