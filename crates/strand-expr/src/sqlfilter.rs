// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Translation of `event.*` predicates into SQL filters.
//!
//! Historic event search in the UI accepts the same expression syntax as
//! triggers, but runs against the SQL event store instead of live events.
//! This module compiles an expression into a parameterized WHERE fragment.
//! Only paths rooted at `event` are allowed here; `async.*` references are
//! runtime-only and rejected.
//!
//! Column mapping:
//! - `event.name` -> `name`
//! - `event.id` -> `event_id`
//! - `event.ts` -> `ts`
//! - `event.version` -> `version`
//! - `event.data.*` / `event.user.*` -> `json_extract(data, '$.path')`
//!   (identical syntax on SQLite and PostgreSQL 16+)

use serde_json::Value;

use crate::ast::{BinOp, Expr};
use crate::error::ExprError;
use crate::parser::parse;

/// A parameterized SQL fragment with positional `?` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFilter {
    /// WHERE-clause fragment, parenthesized.
    pub clause: String,
    /// Bind values in placeholder order.
    pub binds: Vec<Value>,
}

/// Compile an expression into a SQL filter over the events table.
pub fn to_sql_filter(source: &str) -> Result<SqlFilter, ExprError> {
    let ast = parse(source)?;
    let mut binds = Vec::new();
    let clause = emit(&ast, &mut binds)?;
    Ok(SqlFilter { clause, binds })
}

fn column_for(path: &[String]) -> Result<String, ExprError> {
    let root = path.first().map(String::as_str).unwrap_or("");
    if root != "event" {
        return Err(ExprError::UnsupportedPath {
            root: root.to_string(),
            message: "only event.* paths can be used in historic search".to_string(),
        });
    }
    match path.get(1).map(String::as_str) {
        Some("name") if path.len() == 2 => Ok("name".to_string()),
        Some("id") if path.len() == 2 => Ok("event_id".to_string()),
        Some("ts") if path.len() == 2 => Ok("ts".to_string()),
        Some("version") if path.len() == 2 => Ok("version".to_string()),
        Some(field @ ("data" | "user")) => {
            let rest = &path[2..];
            if rest.is_empty() {
                return Err(ExprError::UnsupportedPath {
                    root: field.to_string(),
                    message: format!("event.{field} requires a nested field"),
                });
            }
            let json_path = rest.join(".");
            Ok(format!("json_extract({field}, '$.{json_path}')"))
        }
        other => Err(ExprError::UnsupportedPath {
            root: other.unwrap_or("").to_string(),
            message: "unknown event field".to_string(),
        }),
    }
}

fn emit(expr: &Expr, binds: &mut Vec<Value>) -> Result<String, ExprError> {
    match expr {
        Expr::Bin { op: BinOp::And, lhs, rhs } => {
            let l = emit(lhs, binds)?;
            let r = emit(rhs, binds)?;
            Ok(format!("({l} AND {r})"))
        }
        Expr::Bin { op: BinOp::Or, lhs, rhs } => {
            let l = emit(lhs, binds)?;
            let r = emit(rhs, binds)?;
            Ok(format!("({l} OR {r})"))
        }
        Expr::Not(inner) => {
            let i = emit(inner, binds)?;
            Ok(format!("(NOT {i})"))
        }
        Expr::Bin { op, lhs, rhs } => {
            let (path, lit, flipped) = match (lhs.as_ref(), rhs.as_ref()) {
                (Expr::Path(p), Expr::Lit(v)) => (p, Lit::One(v), false),
                (Expr::Lit(v), Expr::Path(p)) => (p, Lit::One(v), true),
                (Expr::Path(p), Expr::List(items)) => (p, Lit::Many(items), false),
                _ => {
                    return Err(ExprError::UnsupportedPath {
                        root: String::new(),
                        message: "filters must compare an event path with a literal".to_string(),
                    });
                }
            };
            let column = column_for(path)?;
            match (op, lit) {
                (BinOp::In, Lit::Many(items)) => {
                    let mut placeholders = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            Expr::Lit(v) => {
                                binds.push(v.clone());
                                placeholders.push("?");
                            }
                            _ => {
                                return Err(ExprError::UnsupportedPath {
                                    root: String::new(),
                                    message: "in-lists may only contain literals".to_string(),
                                });
                            }
                        }
                    }
                    Ok(format!("({column} IN ({}))", placeholders.join(", ")))
                }
                (BinOp::In, Lit::One(_)) => Err(ExprError::UnsupportedPath {
                    root: String::new(),
                    message: "'in' requires a list on the right-hand side".to_string(),
                }),
                (op, Lit::One(v)) => {
                    if v.is_null() {
                        return match op {
                            BinOp::Eq => Ok(format!("({column} IS NULL)")),
                            BinOp::Neq => Ok(format!("({column} IS NOT NULL)")),
                            _ => Err(ExprError::TypeMismatch {
                                op: op.symbol(),
                                lhs: "column",
                                rhs: "null",
                            }),
                        };
                    }
                    binds.push(v.clone());
                    let sql_op = match (op, flipped) {
                        (BinOp::Eq, _) => "=",
                        (BinOp::Neq, _) => "!=",
                        (BinOp::Lt, false) | (BinOp::Gt, true) => "<",
                        (BinOp::Lte, false) | (BinOp::Gte, true) => "<=",
                        (BinOp::Gt, false) | (BinOp::Lt, true) => ">",
                        (BinOp::Gte, false) | (BinOp::Lte, true) => ">=",
                        _ => unreachable!("logical ops handled above"),
                    };
                    Ok(format!("({column} {sql_op} ?)"))
                }
                (_, Lit::Many(_)) => Err(ExprError::UnsupportedPath {
                    root: String::new(),
                    message: "lists are only valid with 'in'".to_string(),
                }),
            }
        }
        _ => Err(ExprError::UnsupportedPath {
            root: String::new(),
            message: "filters must be comparisons joined by &&, || and !".to_string(),
        }),
    }
}

enum Lit<'a> {
    One(&'a Value),
    Many(&'a [Expr]),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_name_equality() {
        let f = to_sql_filter("event.name == 'order/created'").unwrap();
        assert_eq!(f.clause, "(name = ?)");
        assert_eq!(f.binds, vec![json!("order/created")]);
    }

    #[test]
    fn test_data_path_extraction() {
        let f = to_sql_filter("event.data.cart.total >= 100").unwrap();
        assert_eq!(f.clause, "(json_extract(data, '$.cart.total') >= ?)");
        assert_eq!(f.binds, vec![json!(100)]);
    }

    #[test]
    fn test_flipped_comparison() {
        let f = to_sql_filter("100 < event.data.total").unwrap();
        assert_eq!(f.clause, "(json_extract(data, '$.total') > ?)");
    }

    #[test]
    fn test_logical_combination() {
        let f =
            to_sql_filter("event.name == 'a' && (event.ts > 5 || event.data.x == 1)").unwrap();
        assert_eq!(f.clause, "((name = ?) AND ((ts > ?) OR (json_extract(data, '$.x') = ?)))");
        assert_eq!(f.binds.len(), 3);
    }

    #[test]
    fn test_in_list() {
        let f = to_sql_filter("event.data.region in ['eu-1', 'eu-2']").unwrap();
        assert_eq!(f.clause, "(json_extract(data, '$.region') IN (?, ?))");
        assert_eq!(f.binds.len(), 2);
    }

    #[test]
    fn test_null_handling() {
        let f = to_sql_filter("event.data.deleted == null").unwrap();
        assert_eq!(f.clause, "(json_extract(data, '$.deleted') IS NULL)");
        assert!(f.binds.is_empty());
    }

    #[test]
    fn test_async_paths_rejected() {
        let err = to_sql_filter("async.data.x == 1").unwrap_err();
        assert!(matches!(err, ExprError::UnsupportedPath { .. }));
    }

    #[test]
    fn test_path_to_path_rejected() {
        assert!(to_sql_filter("event.data.a == event.data.b").is_err());
    }
}
