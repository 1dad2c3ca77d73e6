// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Abstract syntax tree for compiled expressions.

use serde_json::Value;

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `==`
    Eq,
    /// `!=`
    Neq,
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `&&`
    And,
    /// `||`
    Or,
    /// `in`
    In,
}

impl BinOp {
    /// Operator symbol for error messages.
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Eq => "==",
            BinOp::Neq => "!=",
            BinOp::Lt => "<",
            BinOp::Lte => "<=",
            BinOp::Gt => ">",
            BinOp::Gte => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::In => "in",
        }
    }
}

/// A parsed expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Dotted path into the evaluation scope, e.g. `event.data.amount`.
    Path(Vec<String>),
    /// Literal JSON value.
    Lit(Value),
    /// List literal, only valid as the right-hand side of `in`.
    List(Vec<Expr>),
    /// Logical negation.
    Not(Box<Expr>),
    /// Binary operation.
    Bin {
        /// Operator.
        op: BinOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
}

impl Expr {
    /// If this expression is a simple `path == literal` predicate, return
    /// the path and literal. Used by the aggregator to build its fast index.
    pub fn as_eq_predicate(&self) -> Option<(&[String], &Value)> {
        if let Expr::Bin { op: BinOp::Eq, lhs, rhs } = self {
            match (lhs.as_ref(), rhs.as_ref()) {
                (Expr::Path(p), Expr::Lit(v)) => return Some((p, v)),
                (Expr::Lit(v), Expr::Path(p)) => return Some((p, v)),
                _ => {}
            }
        }
        None
    }
}
