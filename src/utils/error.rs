//! Error handling for the Veld compiler

use crate::utils::Span;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Compiler error
///
/// Every kind is fatal to the compilation cycle of the current
/// top-level unit. The interactive driver catches these at the top
/// level and continues with the next input; batch mode exits nonzero.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // ==================== Parser Errors ====================

    #[error("Unexpected token: expected {expected}, got {got}")]
    UnexpectedToken {
        expected: String,
        got: String,
        span: Span,
    },

    #[error("Expected identifier")]
    ExpectedIdent { span: Span },

    #[error("Expected expression")]
    ExpectedExpr { span: Span },

    // ==================== Resolution Errors ====================

    #[error("Unresolved symbol: {}", qualified(.namespace, .name))]
    UnresolvedSymbol {
        name: String,
        namespace: Vec<String>,
        span: Span,
    },

    #[error("Duplicate declaration: {name}")]
    DuplicateDeclaration { name: String, span: Span },

    #[error("Invalid promotion: no common type for {lhs} and {rhs}")]
    InvalidPromotion {
        lhs: String,
        rhs: String,
        span: Span,
    },

    #[error("Constant {value} does not fit type {target}")]
    RangeOverflow {
        value: String,
        target: String,
        span: Span,
    },

    #[error("Call to {name} expects {expected} arguments, got {got}")]
    ArityMismatch {
        name: String,
        expected: usize,
        got: usize,
        span: Span,
    },

    #[error("Expression is not callable")]
    NotCallable { span: Span },

    #[error("Expression is not a struct")]
    NotAStruct { span: Span },

    #[error("Expression is not an assignable location")]
    NotAddressable { span: Span },

    #[error("Unknown field: {field}")]
    UnknownField { field: String, span: Span },

    // ==================== Generation Errors ====================

    #[error("Control flow falls through without a return in {context}")]
    MalformedControlFlow { context: String, span: Span },

    #[error("Cannot resolve import {path}: {reason}")]
    UnresolvedImport { path: String, reason: String },

    #[error("Backend failure: {0}")]
    BackendFailure(String),

    #[error("IO error: {0}")]
    Io(String),

    /// Implementation bug, never a user error. Raised when the two
    /// passes disagree (e.g. generation derives a different type than
    /// resolution annotated).
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

fn qualified(namespace: &[String], name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", namespace.join("."), name)
    }
}

impl Error {
    /// Get the source location associated with this error, if any
    pub fn span(&self) -> Option<Span> {
        match self {
            Self::UnexpectedToken { span, .. } => Some(*span),
            Self::ExpectedIdent { span } => Some(*span),
            Self::ExpectedExpr { span } => Some(*span),
            Self::UnresolvedSymbol { span, .. } => Some(*span),
            Self::DuplicateDeclaration { span, .. } => Some(*span),
            Self::InvalidPromotion { span, .. } => Some(*span),
            Self::RangeOverflow { span, .. } => Some(*span),
            Self::ArityMismatch { span, .. } => Some(*span),
            Self::NotCallable { span } => Some(*span),
            Self::NotAStruct { span } => Some(*span),
            Self::NotAddressable { span } => Some(*span),
            Self::UnknownField { span, .. } => Some(*span),
            Self::MalformedControlFlow { span, .. } => Some(*span),
            Self::UnresolvedImport { .. }
            | Self::BackendFailure(_)
            | Self::Io(_)
            | Self::Internal(_) => None,
        }
    }
}
