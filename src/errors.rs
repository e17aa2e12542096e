//! Compile errors and diagnostics
//!
//! Two propagation regimes coexist in the pipeline:
//!
//! - User-level diagnostics (bad patterns, unknown record fields, ...)
//!   accumulate in the `Compilation`'s error list so a single pass can
//!   report several problems at once. The driver checks the list between
//!   passes and stops when it is non-empty.
//! - Invariant violations are fatal: the offending function returns
//!   `Err(CompileError::Internal { .. })`, which unwinds the pass through
//!   `?` and aborts the compilation with the source location and the
//!   violated invariant.

use thiserror::Error;

use crate::loc::Loc;

/// A single diagnostic: kind, location, message
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("{loc}: syntax error: {msg}")]
    Syntax { loc: Loc, msg: String },

    #[error("{loc}: type error: {msg}")]
    Type { loc: Loc, msg: String },

    #[error("{loc}: pattern match error: {msg}")]
    PatternMatch { loc: Loc, msg: String },

    #[error("{loc}: name resolution error: {msg}")]
    NameResolution { loc: Loc, msg: String },

    #[error("{loc}: internal compiler error: {msg}")]
    Internal { loc: Loc, msg: String },
}

impl CompileError {
    pub fn loc(&self) -> Loc {
        match self {
            CompileError::Syntax { loc, .. }
            | CompileError::Type { loc, .. }
            | CompileError::PatternMatch { loc, .. }
            | CompileError::NameResolution { loc, .. }
            | CompileError::Internal { loc, .. } => *loc,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            CompileError::Syntax { msg, .. }
            | CompileError::Type { msg, .. }
            | CompileError::PatternMatch { msg, .. }
            | CompileError::NameResolution { msg, .. }
            | CompileError::Internal { msg, .. } => msg,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, CompileError::Internal { .. })
    }
}

/// Result type used by every fallible stage of the pipeline
pub type CResult<T> = Result<T, CompileError>;

/// Shorthand constructors; the call sites read better with these than
/// with struct literals.
pub fn syntax_err(loc: Loc, msg: impl Into<String>) -> CompileError {
    CompileError::Syntax { loc, msg: msg.into() }
}

pub fn type_err(loc: Loc, msg: impl Into<String>) -> CompileError {
    CompileError::Type { loc, msg: msg.into() }
}

pub fn pattern_err(loc: Loc, msg: impl Into<String>) -> CompileError {
    CompileError::PatternMatch { loc, msg: msg.into() }
}

pub fn name_err(loc: Loc, msg: impl Into<String>) -> CompileError {
    CompileError::NameResolution { loc, msg: msg.into() }
}

pub fn internal_err(loc: Loc, msg: impl Into<String>) -> CompileError {
    CompileError::Internal { loc, msg: msg.into() }
}
