// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Strand expression language.
//!
//! Triggers, pauses, concurrency keys, and debounce/batch keys all filter or
//! key off event payloads with small boolean/string expressions such as
//!
//! ```text
//! event.data.amount >= 100 && event.data.region in ['eu-1', 'eu-2']
//! async.data.continue == 'yes'
//! ```
//!
//! This crate provides:
//!
//! - [`parser::parse`]: source -> AST with position-reporting syntax errors.
//!   Function-call syntax is rejected (no macros).
//! - [`eval::Evaluator`]: compile-once cache plus evaluation against a JSON
//!   scope (`{"event": ..., "async": ...}`).
//! - [`aggregator::Aggregator`]: sub-linear matching of many registered
//!   predicates against a single event, used for pause resolution.
//! - [`sqlfilter::to_sql_filter`]: compiles `event.*` predicates into
//!   parameterized SQL for historic event search.

#![deny(missing_docs)]

/// AST node types.
pub mod ast;
/// Error types for compilation and evaluation.
pub mod error;
/// Expression evaluation and the compile cache.
pub mod eval;
/// Tokenizer.
pub mod lexer;
/// Recursive-descent parser.
pub mod parser;
/// Aggregated many-predicate matching.
pub mod aggregator;
/// SQL filter generation for historic event search.
pub mod sqlfilter;

pub use aggregator::Aggregator;
pub use ast::{BinOp, Expr};
pub use error::ExprError;
pub use eval::{Compiled, Evaluator};
pub use parser::parse;
pub use sqlfilter::{SqlFilter, to_sql_filter};
