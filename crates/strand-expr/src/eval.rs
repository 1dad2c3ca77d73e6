// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Expression evaluation against JSON scopes.
//!
//! Expressions are compiled once and cached by source string; evaluation
//! resolves dotted paths against a scope object such as
//! `{"event": {...}, "async": {...}}`.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::ast::{BinOp, Expr};
use crate::error::ExprError;
use crate::parser::parse;

/// A compiled expression, cheap to clone and safe to share across threads.
#[derive(Debug, Clone)]
pub struct Compiled {
    source: Arc<str>,
    ast: Arc<Expr>,
}

impl Compiled {
    /// Compile an expression from source.
    pub fn new(source: &str) -> Result<Self, ExprError> {
        let ast = parse(source)?;
        Ok(Self { source: Arc::from(source), ast: Arc::new(ast) })
    }

    /// The original source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The parsed AST.
    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Evaluate against a scope, requiring a boolean result.
    pub fn matches(&self, scope: &Value) -> Result<bool, ExprError> {
        match eval(&self.ast, scope)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExprError::NotBoolean { got: type_name(&other) }),
        }
    }

    /// Evaluate against a scope, returning whatever value the expression
    /// produces. Used for key and priority expressions.
    pub fn value(&self, scope: &Value) -> Result<Value, ExprError> {
        eval(&self.ast, scope)
    }
}

/// Process-wide compile cache. Expressions are compiled once per source
/// string; repeat lookups are a map hit.
#[derive(Debug, Default)]
pub struct Evaluator {
    cache: DashMap<String, Compiled>,
}

impl Evaluator {
    /// Create an empty evaluator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile (or fetch from cache) and return the compiled expression.
    pub fn compile(&self, source: &str) -> Result<Compiled, ExprError> {
        if let Some(hit) = self.cache.get(source) {
            return Ok(hit.clone());
        }
        let compiled = Compiled::new(source)?;
        self.cache.insert(source.to_string(), compiled.clone());
        Ok(compiled)
    }

    /// Compile and evaluate in one call.
    pub fn matches(&self, source: &str, scope: &Value) -> Result<bool, ExprError> {
        self.compile(source)?.matches(scope)
    }

    /// Compile and evaluate to a value in one call.
    pub fn value(&self, source: &str, scope: &Value) -> Result<Value, ExprError> {
        self.compile(source)?.value(scope)
    }

    /// Number of cached expressions.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

/// Resolve a dotted path within a scope value. Missing segments yield Null,
/// matching the "absent field compares as null" semantics triggers rely on.
pub fn resolve_path<'a>(scope: &'a Value, path: &[String]) -> &'a Value {
    let mut cur = scope;
    for segment in path {
        match cur {
            Value::Object(map) => match map.get(segment) {
                Some(v) => cur = v,
                None => return &Value::Null,
            },
            _ => return &Value::Null,
        }
    }
    cur
}

fn eval(expr: &Expr, scope: &Value) -> Result<Value, ExprError> {
    match expr {
        Expr::Path(path) => Ok(resolve_path(scope, path).clone()),
        Expr::Lit(v) => Ok(v.clone()),
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, scope)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Not(inner) => match eval(inner, scope)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(ExprError::TypeMismatch {
                op: "!",
                lhs: type_name(&other),
                rhs: "bool",
            }),
        },
        Expr::Bin { op, lhs, rhs } => eval_bin(*op, lhs, rhs, scope),
    }
}

fn eval_bin(op: BinOp, lhs: &Expr, rhs: &Expr, scope: &Value) -> Result<Value, ExprError> {
    // Short-circuit logical operators.
    match op {
        BinOp::And => {
            let l = expect_bool(op, eval(lhs, scope)?)?;
            if !l {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(expect_bool(op, eval(rhs, scope)?)?));
        }
        BinOp::Or => {
            let l = expect_bool(op, eval(lhs, scope)?)?;
            if l {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(expect_bool(op, eval(rhs, scope)?)?));
        }
        _ => {}
    }

    let l = eval(lhs, scope)?;
    let r = eval(rhs, scope)?;

    let result = match op {
        BinOp::Eq => values_eq(&l, &r),
        BinOp::Neq => !values_eq(&l, &r),
        BinOp::In => match &r {
            Value::Array(items) => items.iter().any(|item| values_eq(&l, item)),
            other => {
                return Err(ExprError::TypeMismatch {
                    op: "in",
                    lhs: type_name(&l),
                    rhs: type_name(other),
                });
            }
        },
        BinOp::Lt | BinOp::Lte | BinOp::Gt | BinOp::Gte => {
            let ord = compare(op, &l, &r)?;
            match op {
                BinOp::Lt => ord == std::cmp::Ordering::Less,
                BinOp::Lte => ord != std::cmp::Ordering::Greater,
                BinOp::Gt => ord == std::cmp::Ordering::Greater,
                BinOp::Gte => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            }
        }
        BinOp::And | BinOp::Or => unreachable!(),
    };

    Ok(Value::Bool(result))
}

fn expect_bool(op: BinOp, v: Value) -> Result<bool, ExprError> {
    match v {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::TypeMismatch {
            op: op.symbol(),
            lhs: type_name(&other),
            rhs: "bool",
        }),
    }
}

/// Equality: numbers compare numerically regardless of int/float storage;
/// everything else compares structurally.
fn values_eq(l: &Value, r: &Value) -> bool {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => l == r,
    }
}

fn compare(op: BinOp, l: &Value, r: &Value) -> Result<std::cmp::Ordering, ExprError> {
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        return a.partial_cmp(&b).ok_or(ExprError::TypeMismatch {
            op: op.symbol(),
            lhs: "number",
            rhs: "number",
        });
    }
    if let (Value::String(a), Value::String(b)) = (l, r) {
        return Ok(a.cmp(b));
    }
    Err(ExprError::TypeMismatch {
        op: op.symbol(),
        lhs: type_name(l),
        rhs: type_name(r),
    })
}

/// JSON type name for error messages.
pub fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
