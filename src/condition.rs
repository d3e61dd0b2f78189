//! Boolean conditions over engine variables
//!
//! Used by `DetectCondition`, `InstallCondition`, search gates and the UX's
//! `evaluate_condition`.
//!
//! ```text
//! expr     := or
//! or       := and ( "OR" and )*
//! and      := not ( "AND" not )*
//! not      := "NOT" not | primary
//! primary  := "(" expr ")" | operand ( op operand )?
//! operand  := name | "string" | integer | v1.2.3.4
//! op       := = <> < <= > >= ~= ~<> >< << >>
//! ```
//!
//! A bare variable is true when it is set and non-zero/non-empty. `~` makes a
//! string comparison case-insensitive; `><` is "contains", `<<` "starts with",
//! `>>` "ends with". An empty condition is true.

use crate::error::{BurnError, Result};
use crate::variables::{Variables, Variant};
use crate::version::Version;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(i64),
    Ver(Version),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    EqNoCase,
    NeNoCase,
    Contains,
    StartsWith,
    EndsWith,
}

/// Evaluate `condition` against `vars`.
pub fn evaluate(condition: &str, vars: &Variables) -> Result<bool> {
    let tokens = tokenize(condition)?;
    if tokens.is_empty() {
        return Ok(true);
    }
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        vars,
    };
    let value = parser.parse_or()?;
    if parser.pos != tokens.len() {
        return Err(BurnError::condition(format!(
            "unexpected token {:?} in '{}'",
            tokens[parser.pos], condition
        )));
    }
    Ok(value)
}

/// Check that `condition` parses, without evaluating variables.
pub fn validate(condition: &str) -> Result<()> {
    evaluate(condition, &Variables::new()).map(|_| ())
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '"')
                    .map(|p| start + p)
                    .ok_or_else(|| BurnError::condition(format!("unterminated string in '{}'", input)))?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '=' | '<' | '>' | '~' => {
                let (op, len) = read_operator(&chars[i..])
                    .ok_or_else(|| BurnError::condition(format!("bad operator in '{}'", input)))?;
                tokens.push(Token::Op(op));
                i += len;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: i64 = text
                    .parse()
                    .map_err(|_| BurnError::condition(format!("number out of range: {}", text)))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(classify_word(word)?);
            }
            other => {
                return Err(BurnError::condition(format!(
                    "unexpected character '{}' in '{}'",
                    other, input
                )));
            }
        }
    }

    Ok(tokens)
}

fn classify_word(word: String) -> Result<Token> {
    Ok(match word.as_str() {
        "AND" => Token::And,
        "OR" => Token::Or,
        "NOT" => Token::Not,
        w if (w.starts_with('v') || w.starts_with('V'))
            && w[1..].starts_with(|c: char| c.is_ascii_digit()) =>
        {
            let version = w
                .parse::<Version>()
                .map_err(|e| BurnError::condition(format!("bad version literal: {}", e)))?;
            Token::Ver(version)
        }
        _ => Token::Ident(word),
    })
}

fn read_operator(chars: &[char]) -> Option<(CompareOp, usize)> {
    let two: String = chars.iter().take(3).collect();
    let table: &[(&str, CompareOp)] = &[
        ("~<>", CompareOp::NeNoCase),
        ("~=", CompareOp::EqNoCase),
        ("<>", CompareOp::Ne),
        ("<=", CompareOp::Le),
        (">=", CompareOp::Ge),
        ("><", CompareOp::Contains),
        ("<<", CompareOp::StartsWith),
        (">>", CompareOp::EndsWith),
        ("=", CompareOp::Eq),
        ("<", CompareOp::Lt),
        (">", CompareOp::Gt),
    ];
    table
        .iter()
        .find(|(text, _)| two.starts_with(text))
        .map(|(text, op)| (*op, text.chars().count()))
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    vars: &'a Variables,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<bool> {
        let mut value = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn parse_and(&mut self) -> Result<bool> {
        let mut value = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_not()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn parse_not(&mut self) -> Result<bool> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(!self.parse_not()?);
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<bool> {
        match self.next().cloned() {
            Some(Token::LParen) => {
                let value = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(BurnError::condition("missing ')'")),
                }
            }
            Some(token) => {
                let lhs = self.operand(&token)?;
                if let Some(Token::Op(op)) = self.peek().cloned() {
                    self.pos += 1;
                    let rhs_token = self
                        .next()
                        .cloned()
                        .ok_or_else(|| BurnError::condition("missing right operand"))?;
                    let rhs = self.operand(&rhs_token)?;
                    compare(op, lhs, rhs)
                } else {
                    Ok(lhs.is_some_and(|v| v.is_truthy()))
                }
            }
            None => Err(BurnError::condition("unexpected end of condition")),
        }
    }

    fn operand(&self, token: &Token) -> Result<Option<Variant>> {
        match token {
            Token::Ident(name) => Ok(self.vars.get(name)),
            Token::Str(s) => Ok(Some(Variant::String(s.clone()))),
            Token::Num(n) => Ok(Some(Variant::Numeric(*n))),
            Token::Ver(v) => Ok(Some(Variant::Version(*v))),
            other => Err(BurnError::condition(format!("expected operand, found {:?}", other))),
        }
    }
}

fn compare(op: CompareOp, lhs: Option<Variant>, rhs: Option<Variant>) -> Result<bool> {
    let (lhs, rhs) = match (lhs, rhs) {
        (Some(l), Some(r)) => (l, r),
        (None, None) => return Ok(matches!(op, CompareOp::Eq | CompareOp::EqNoCase)),
        _ => return Ok(matches!(op, CompareOp::Ne | CompareOp::NeNoCase)),
    };

    match (&lhs, &rhs) {
        (Variant::Version(_), _) | (_, Variant::Version(_)) => {
            let ordering = lhs
                .as_version()
                .and_then(|l| Ok(l.cmp(&rhs.as_version()?)))
                .map_err(|e| BurnError::condition(e.to_string()))?;
            ordered(op, ordering)
        }
        (Variant::Numeric(l), Variant::Numeric(r)) => ordered(op, l.cmp(r)),
        (Variant::Numeric(_), Variant::String(_)) | (Variant::String(_), Variant::Numeric(_)) => {
            match (lhs.as_numeric(), rhs.as_numeric()) {
                (Ok(l), Ok(r)) => ordered(op, l.cmp(&r)),
                _ => strings(op, &lhs.to_string(), &rhs.to_string()),
            }
        }
        (Variant::String(l), Variant::String(r)) => strings(op, l, r),
    }
}

fn ordered(op: CompareOp, ordering: Ordering) -> Result<bool> {
    Ok(match op {
        CompareOp::Eq | CompareOp::EqNoCase => ordering == Ordering::Equal,
        CompareOp::Ne | CompareOp::NeNoCase => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
        CompareOp::Contains | CompareOp::StartsWith | CompareOp::EndsWith => {
            return Err(BurnError::condition(
                "substring operators only apply to strings",
            ));
        }
    })
}

fn strings(op: CompareOp, l: &str, r: &str) -> Result<bool> {
    Ok(match op {
        CompareOp::EqNoCase => l.eq_ignore_ascii_case(r),
        CompareOp::NeNoCase => !l.eq_ignore_ascii_case(r),
        CompareOp::Contains => l.contains(r),
        CompareOp::StartsWith => l.starts_with(r),
        CompareOp::EndsWith => l.ends_with(r),
        _ => return ordered(op, l.cmp(r)),
    })
}
