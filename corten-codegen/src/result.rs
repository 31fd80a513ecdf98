//! Result and error types shared by every compilation stage.
//!
//! The middle end uses a single closed error enumeration. Only the
//! `Analysis` and `NotSupported` kinds ever reach the user as diagnostics;
//! the remaining kinds abort the translation unit with an internal error
//! message.

use core::fmt;
use thiserror::Error;

/// Position in the preprocessed source text an `Analysis` error refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    /// Name of the source file.
    pub source: String,
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number.
    pub column: u32,
}

impl SourceLocation {
    /// Create a source location.
    pub fn new(source: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            source: source.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}:{}", self.source, self.line, self.column)
    }
}

/// A compilation error.
///
/// Every fallible operation in the middle end returns [`Result`]; callers
/// propagate errors upward with `?`. No partial state is usable after an
/// error: the caller is expected to discard the affected compiler contexts.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum Error {
    /// API misuse: null-equivalent input, bounds violation and the like.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Internal consistency violation detected during a pass.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The allocator or classifier could not satisfy a request.
    #[error("internal error: {0}")]
    InternalError(&'static str),

    /// User-visible source-level error.
    #[error("{location}: {message}")]
    Analysis {
        /// Offending source position.
        location: SourceLocation,
        /// Diagnostic text.
        message: &'static str,
    },

    /// The upstream memory allocator failed.
    ///
    /// The implementation relies on the infallible host allocator, so this
    /// kind is never constructed here; it is part of the closed error set
    /// for embedders that plug in their own allocation layer.
    #[error("memory allocation failure")]
    MemAllocFailure,

    /// Lookup miss. Also used as plain control flow by the traversal
    /// helpers of the flow-control tree.
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// The construct is valid C but outside the implemented subset.
    #[error("not supported: {0}")]
    NotSupported(&'static str),
}

/// Convenience alias used throughout the middle end.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let err = Error::Analysis {
            location: SourceLocation::new("file.c", 3, 14),
            message: "bad jump",
        };
        assert_eq!(err.to_string(), "file.c@3:14: bad jump");
        assert_eq!(
            Error::InvalidState("oops").to_string(),
            "invalid state: oops"
        );
    }
}
