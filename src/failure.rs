//! The captured output of a failed command.

use crate::runner::ExecutionResult;
use std::fmt;

/// Combined output of one failed attempt.
///
/// Built once and never edited: the same bytes feed the diagnosis prompt and the
/// matcher-store fingerprint, so both always agree on what failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureLog(String);

impl FailureLog {
    /// Stderr first (it carries most of the signal), then stdout.
    pub fn from_result(result: &ExecutionResult) -> Self {
        Self(format!("{}\n{}", result.stderr, result.stdout))
    }

    /// A log handed in from outside, e.g. piped on stdin.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Raw captured bytes; invalid UTF-8 is replaced rather than rejected.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for FailureLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
