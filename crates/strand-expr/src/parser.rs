// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recursive-descent parser for strand expressions.
//!
//! Grammar (loosest binding first):
//!
//! ```text
//! or       := and ('||' and)*
//! and      := cmp ('&&' cmp)*
//! cmp      := unary (('==' | '!=' | '<' | '<=' | '>' | '>=' | 'in') unary)?
//! unary    := '!' unary | primary
//! primary  := path | literal | list | '(' or ')'
//! path     := ident ('.' ident)*
//! list     := '[' (literal (',' literal)*)? ']'
//! ```
//!
//! Function-call syntax (`ident(...)`) is rejected: the language deliberately
//! has no macros, and the parser reports them with the call position.

use serde_json::Value;

use crate::ast::{BinOp, Expr};
use crate::error::ExprError;
use crate::lexer::{Spanned, Token, tokenize};

/// Parse an expression source string into an AST.
pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, idx: 0, src_len: src.len() };
    let expr = parser.parse_or()?;
    if let Some(t) = parser.peek() {
        return Err(ExprError::Syntax {
            pos: t.pos,
            message: format!("unexpected trailing token {:?}", t.token),
        });
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    idx: usize,
    src_len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.idx)
    }

    fn next(&mut self) -> Option<Spanned> {
        let t = self.tokens.get(self.idx).cloned();
        if t.is_some() {
            self.idx += 1;
        }
        t
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek().map(|t| &t.token) == Some(token) {
            self.idx += 1;
            true
        } else {
            false
        }
    }

    fn pos(&self) -> usize {
        self.peek().map(|t| t.pos).unwrap_or(self.src_len)
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            lhs = Expr::Bin { op: BinOp::Or, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_cmp()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_cmp()?;
            lhs = Expr::Bin { op: BinOp::And, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_unary()?;
        let op = match self.peek().map(|t| &t.token) {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Neq) => BinOp::Neq,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Lte) => BinOp::Lte,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Gte) => BinOp::Gte,
            Some(Token::In) => BinOp::In,
            _ => return Ok(lhs),
        };
        self.idx += 1;
        let rhs = self.parse_unary()?;
        Ok(Expr::Bin { op, lhs: Box::new(lhs), rhs: Box::new(rhs) })
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Not) {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let pos = self.pos();
        let Some(spanned) = self.next() else {
            return Err(ExprError::Syntax {
                pos,
                message: "unexpected end of expression".to_string(),
            });
        };

        match spanned.token {
            Token::Ident(first) => {
                // Calls are macros; we don't support them.
                if self.peek().map(|t| &t.token) == Some(&Token::LParen) {
                    return Err(ExprError::MacroUnsupported { name: first, pos: spanned.pos });
                }
                let mut segments = vec![first];
                while self.eat(&Token::Dot) {
                    let seg_pos = self.pos();
                    match self.next() {
                        Some(Spanned { token: Token::Ident(seg), .. }) => {
                            if self.peek().map(|t| &t.token) == Some(&Token::LParen) {
                                return Err(ExprError::MacroUnsupported { name: seg, pos: seg_pos });
                            }
                            segments.push(seg);
                        }
                        _ => {
                            return Err(ExprError::Syntax {
                                pos: seg_pos,
                                message: "expected identifier after '.'".to_string(),
                            });
                        }
                    }
                }
                Ok(Expr::Path(segments))
            }
            Token::Str(s) => Ok(Expr::Lit(Value::String(s))),
            Token::Int(v) => Ok(Expr::Lit(Value::from(v))),
            Token::Float(v) => Ok(Expr::Lit(Value::from(v))),
            Token::True => Ok(Expr::Lit(Value::Bool(true))),
            Token::False => Ok(Expr::Lit(Value::Bool(false))),
            Token::Null => Ok(Expr::Lit(Value::Null)),
            Token::LParen => {
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err(ExprError::Syntax {
                        pos: self.pos(),
                        message: "expected ')'".to_string(),
                    });
                }
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.parse_primary()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        return Err(ExprError::Syntax {
                            pos: self.pos(),
                            message: "expected ',' or ']' in list".to_string(),
                        });
                    }
                }
                Ok(Expr::List(items))
            }
            other => Err(ExprError::Syntax {
                pos: spanned.pos,
                message: format!("unexpected token {:?}", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_equality() {
        let expr = parse("event.data.ok == true").unwrap();
        let (path, value) = expr.as_eq_predicate().unwrap();
        assert_eq!(path, ["event", "data", "ok"]);
        assert_eq!(value, &Value::Bool(true));
    }

    #[test]
    fn test_parse_precedence() {
        // && binds tighter than ||.
        let expr = parse("a == 1 || b == 2 && c == 3").unwrap();
        match expr {
            Expr::Bin { op: BinOp::Or, rhs, .. } => match *rhs {
                Expr::Bin { op: BinOp::And, .. } => {}
                other => panic!("expected And on rhs, got {other:?}"),
            },
            other => panic!("expected Or at top, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_parenthesized() {
        let expr = parse("(a == 1 || b == 2) && c == 3").unwrap();
        match expr {
            Expr::Bin { op: BinOp::And, lhs, .. } => match *lhs {
                Expr::Bin { op: BinOp::Or, .. } => {}
                other => panic!("expected Or on lhs, got {other:?}"),
            },
            other => panic!("expected And at top, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_in_list() {
        let expr = parse("event.data.region in ['eu-1', 'eu-2']").unwrap();
        match expr {
            Expr::Bin { op: BinOp::In, rhs, .. } => match *rhs {
                Expr::List(items) => assert_eq!(items.len(), 2),
                other => panic!("expected list, got {other:?}"),
            },
            other => panic!("expected In, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_not() {
        let expr = parse("!(event.data.ok == true)").unwrap();
        assert!(matches!(expr, Expr::Not(_)));
    }

    #[test]
    fn test_macro_rejected_with_position() {
        let err = parse("event.data.exists(x)").unwrap_err();
        match err {
            ExprError::MacroUnsupported { name, pos } => {
                assert_eq!(name, "exists");
                assert_eq!(pos, 11);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_top_level_macro_rejected() {
        assert!(matches!(
            parse("size(event.data.items) > 0"),
            Err(ExprError::MacroUnsupported { .. })
        ));
    }

    #[test]
    fn test_trailing_garbage() {
        let err = parse("a == 1 b").unwrap_err();
        assert!(matches!(err, ExprError::Syntax { pos: 7, .. }));
    }

    #[test]
    fn test_missing_rhs() {
        assert!(parse("event.data.x ==").is_err());
    }
}
