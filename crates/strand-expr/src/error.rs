// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for expression compilation and evaluation.

/// Result type using ExprError.
pub type Result<T> = std::result::Result<T, ExprError>;

/// Errors from compiling or evaluating an expression.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ExprError {
    /// The source text is not a valid expression.
    #[error("syntax error at byte {pos}: {message}")]
    Syntax {
        /// Byte offset into the source where the error was detected.
        pos: usize,
        /// Human-readable description.
        message: String,
    },

    /// Function-call syntax was used. Macros are not supported.
    #[error("macro '{name}' at byte {pos} is not supported")]
    MacroUnsupported {
        /// The identifier that was called.
        name: String,
        /// Byte offset of the call.
        pos: usize,
    },

    /// The expression evaluated to a non-boolean top-level value.
    #[error("expression did not evaluate to a boolean (got {got})")]
    NotBoolean {
        /// JSON type name of the actual result.
        got: &'static str,
    },

    /// Two operands could not be compared with the given operator.
    #[error("cannot apply '{op}' to {lhs} and {rhs}")]
    TypeMismatch {
        /// Operator symbol.
        op: &'static str,
        /// JSON type name of the left operand.
        lhs: &'static str,
        /// JSON type name of the right operand.
        rhs: &'static str,
    },

    /// A path referenced a scope that does not exist for this filter target.
    #[error("unsupported path root '{root}': {message}")]
    UnsupportedPath {
        /// First path segment.
        root: String,
        /// Why the root is rejected.
        message: String,
    },
}
