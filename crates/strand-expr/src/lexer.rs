// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lexer for strand trigger/pause expressions.
//!
//! Tokenizes a predicate such as `event.data.amount >= 100 && async.data.ok == true`
//! into a stream of tokens for the parser. Every token carries the byte offset
//! where it starts so syntax errors can point at the offending position.

use crate::error::ExprError;

/// Token types in the expression language.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Bare identifier segment (`event`, `data`, `amount`).
    Ident(String),
    /// Single-quoted or double-quoted string literal.
    Str(String),
    /// Integer literal.
    Int(i64),
    /// Floating point literal.
    Float(f64),
    /// `true`
    True,
    /// `false`
    False,
    /// `null`
    Null,
    /// `in`
    In,
    /// `.`
    Dot,
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `[`
    LBracket,
    /// `]`
    RBracket,
    /// `,`
    Comma,
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
    /// `!`
    Not,
}

/// A token plus the byte offset at which it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    /// The token.
    pub token: Token,
    /// Byte offset of the token's first character.
    pub pos: usize,
}

/// Tokenize an expression source string.
pub fn tokenize(src: &str) -> Result<Vec<Spanned>, ExprError> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                i += 1;
            }
            '.' => {
                out.push(Spanned { token: Token::Dot, pos: i });
                i += 1;
            }
            '(' => {
                out.push(Spanned { token: Token::LParen, pos: i });
                i += 1;
            }
            ')' => {
                out.push(Spanned { token: Token::RParen, pos: i });
                i += 1;
            }
            '[' => {
                out.push(Spanned { token: Token::LBracket, pos: i });
                i += 1;
            }
            ']' => {
                out.push(Spanned { token: Token::RBracket, pos: i });
                i += 1;
            }
            ',' => {
                out.push(Spanned { token: Token::Comma, pos: i });
                i += 1;
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push(Spanned { token: Token::Eq, pos: i });
                    i += 2;
                } else {
                    return Err(ExprError::Syntax {
                        pos: i,
                        message: "single '=' is not valid, use '=='".to_string(),
                    });
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push(Spanned { token: Token::Neq, pos: i });
                    i += 2;
                } else {
                    out.push(Spanned { token: Token::Not, pos: i });
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push(Spanned { token: Token::Lte, pos: i });
                    i += 2;
                } else {
                    out.push(Spanned { token: Token::Lt, pos: i });
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push(Spanned { token: Token::Gte, pos: i });
                    i += 2;
                } else {
                    out.push(Spanned { token: Token::Gt, pos: i });
                    i += 1;
                }
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    out.push(Spanned { token: Token::And, pos: i });
                    i += 2;
                } else {
                    return Err(ExprError::Syntax {
                        pos: i,
                        message: "single '&' is not valid, use '&&'".to_string(),
                    });
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    out.push(Spanned { token: Token::Or, pos: i });
                    i += 2;
                } else {
                    return Err(ExprError::Syntax {
                        pos: i,
                        message: "single '|' is not valid, use '||'".to_string(),
                    });
                }
            }
            '\'' | '"' => {
                let (s, next) = lex_string(src, i, c)?;
                out.push(Spanned { token: Token::Str(s), pos: i });
                i = next;
            }
            '0'..='9' | '-' => {
                let (tok, next) = lex_number(src, i)?;
                out.push(Spanned { token: tok, pos: i });
                i = next;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let b = bytes[i] as char;
                    if b.is_ascii_alphanumeric() || b == '_' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word = &src[start..i];
                let token = match word {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "in" => Token::In,
                    _ => Token::Ident(word.to_string()),
                };
                out.push(Spanned { token, pos: start });
            }
            other => {
                return Err(ExprError::Syntax {
                    pos: i,
                    message: format!("unexpected character '{}'", other),
                });
            }
        }
    }

    Ok(out)
}

fn lex_string(src: &str, start: usize, quote: char) -> Result<(String, usize), ExprError> {
    let bytes = src.as_bytes();
    let mut i = start + 1;
    let mut value = String::new();

    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == quote {
            return Ok((value, i + 1));
        }
        if c == '\\' {
            match bytes.get(i + 1).map(|b| *b as char) {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some('\\') => value.push('\\'),
                Some(q) if q == quote => value.push(q),
                other => {
                    return Err(ExprError::Syntax {
                        pos: i,
                        message: format!("invalid escape '\\{}'", other.unwrap_or(' ')),
                    });
                }
            }
            i += 2;
            continue;
        }
        // Multi-byte chars are copied verbatim.
        let ch_len = src[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
        value.push_str(&src[i..i + ch_len]);
        i += ch_len;
    }

    Err(ExprError::Syntax {
        pos: start,
        message: "unterminated string literal".to_string(),
    })
}

fn lex_number(src: &str, start: usize) -> Result<(Token, usize), ExprError> {
    let bytes = src.as_bytes();
    let mut i = start;
    if bytes[i] == b'-' {
        i += 1;
    }
    let mut is_float = false;
    while i < bytes.len() {
        match bytes[i] {
            b'0'..=b'9' => i += 1,
            b'.' => {
                // A second dot ends the number (path syntax never follows a number).
                if is_float {
                    break;
                }
                // Only treat as decimal point when a digit follows.
                if matches!(bytes.get(i + 1), Some(b'0'..=b'9')) {
                    is_float = true;
                    i += 1;
                } else {
                    break;
                }
            }
            _ => break,
        }
    }

    let text = &src[start..i];
    if text == "-" {
        return Err(ExprError::Syntax {
            pos: start,
            message: "expected digits after '-'".to_string(),
        });
    }
    if is_float {
        let v: f64 = text.parse().map_err(|_| ExprError::Syntax {
            pos: start,
            message: format!("invalid number '{}'", text),
        })?;
        Ok((Token::Float(v), i))
    } else {
        let v: i64 = text.parse().map_err(|_| ExprError::Syntax {
            pos: start,
            message: format!("invalid number '{}'", text),
        })?;
        Ok((Token::Int(v), i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_comparison() {
        let tokens = tokenize("event.data.amount >= 100").unwrap();
        assert_eq!(tokens[0].token, Token::Ident("event".to_string()));
        assert_eq!(tokens[1].token, Token::Dot);
        assert_eq!(tokens[2].token, Token::Ident("data".to_string()));
        assert_eq!(tokens[4].token, Token::Ident("amount".to_string()));
        assert_eq!(tokens[5].token, Token::Gte);
        assert_eq!(tokens[6].token, Token::Int(100));
    }

    #[test]
    fn test_tokenize_strings_both_quotes() {
        let tokens = tokenize(r#"event.name == 'a/b' || event.name == "c""#).unwrap();
        assert!(tokens.iter().any(|t| t.token == Token::Str("a/b".to_string())));
        assert!(tokens.iter().any(|t| t.token == Token::Str("c".to_string())));
        assert!(tokens.iter().any(|t| t.token == Token::Or));
    }

    #[test]
    fn test_tokenize_positions() {
        let tokens = tokenize("a == b").unwrap();
        assert_eq!(tokens[0].pos, 0);
        assert_eq!(tokens[1].pos, 2);
        assert_eq!(tokens[2].pos, 5);
    }

    #[test]
    fn test_tokenize_negative_float() {
        let tokens = tokenize("event.data.x < -1.5").unwrap();
        assert_eq!(tokens.last().unwrap().token, Token::Float(-1.5));
    }

    #[test]
    fn test_single_equals_rejected() {
        let err = tokenize("a = b").unwrap_err();
        match err {
            ExprError::Syntax { pos, .. } => assert_eq!(pos, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unterminated_string() {
        assert!(tokenize("event.name == 'oops").is_err());
    }

    #[test]
    fn test_string_escapes() {
        let tokens = tokenize(r"'a\nb'").unwrap();
        assert_eq!(tokens[0].token, Token::Str("a\nb".to_string()));
    }
}
