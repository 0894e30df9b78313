//! Label selectors
//!
//! Implements the set-based selector syntax accepted by the Kubernetes API:
//!
//! ```text
//! app=web, tier!=cache, env in (prod,staging), !canary, release
//! ```
//!
//! Requirements are comma separated and all of them must match.

use crate::SelectorError;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// How a single requirement compares against a label set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    Exists,
    DoesNotExist,
    Equals(String),
    NotEquals(String),
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
    GreaterThan(i64),
    LessThan(i64),
}

/// One comma-separated term of a label selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);

        match &self.operator {
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
            Operator::Equals(expected) => value == Some(expected),
            // Absent keys satisfy negative requirements
            Operator::NotEquals(expected) => value != Some(expected),
            Operator::In(set) => value.is_some_and(|v| set.contains(v)),
            Operator::NotIn(set) => !value.is_some_and(|v| set.contains(v)),
            Operator::GreaterThan(bound) => value
                .and_then(|v| v.parse::<i64>().ok())
                .is_some_and(|v| v > *bound),
            Operator::LessThan(bound) => value
                .and_then(|v| v.parse::<i64>().ok())
                .is_some_and(|v| v < *bound),
        }
    }
}

/// A parsed label selector
///
/// The empty selector matches every label set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelSelector {
    source: String,
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Parse a selector string such as `app=web,env in (prod)`
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let tokens = lex(input);
        let mut parser = Parser {
            input,
            tokens,
            cursor: 0,
        };

        let mut requirements = Vec::new();
        if !parser.at_end() {
            loop {
                requirements.push(parser.requirement()?);

                let token = parser.next();
                match token.kind {
                    TokenKind::Comma => continue,
                    TokenKind::End => break,
                    _ => return Err(parser.unexpected(&token, "',' or end of selector")),
                }
            }
        }

        Ok(Self {
            source: input.trim().to_string(),
            requirements,
        })
    }

    /// Selector that matches everything
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// The selector as it was written, suitable for server-side filtering
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Identifier(String),
    Equals,
    DoubleEquals,
    NotEquals,
    Bang,
    In,
    NotIn,
    GreaterThan,
    LessThan,
    OpenParen,
    CloseParen,
    Comma,
    End,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Identifier(s) => format!("identifier {:?}", s),
            TokenKind::Equals => "'='".to_string(),
            TokenKind::DoubleEquals => "'=='".to_string(),
            TokenKind::NotEquals => "'!='".to_string(),
            TokenKind::Bang => "'!'".to_string(),
            TokenKind::In => "'in'".to_string(),
            TokenKind::NotIn => "'notin'".to_string(),
            TokenKind::GreaterThan => "'>'".to_string(),
            TokenKind::LessThan => "'<'".to_string(),
            TokenKind::OpenParen => "'('".to_string(),
            TokenKind::CloseParen => "')'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::End => "end of selector".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn is_special(c: char) -> bool {
    c.is_whitespace() || matches!(c, ',' | '(' | ')' | '=' | '!' | '<' | '>')
}

fn lex(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(position, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let kind = match c {
            ',' => {
                chars.next();
                TokenKind::Comma
            }
            '(' => {
                chars.next();
                TokenKind::OpenParen
            }
            ')' => {
                chars.next();
                TokenKind::CloseParen
            }
            '>' => {
                chars.next();
                TokenKind::GreaterThan
            }
            '<' => {
                chars.next();
                TokenKind::LessThan
            }
            '=' => {
                chars.next();
                if chars.next_if(|&(_, c)| c == '=').is_some() {
                    TokenKind::DoubleEquals
                } else {
                    TokenKind::Equals
                }
            }
            '!' => {
                chars.next();
                if chars.next_if(|&(_, c)| c == '=').is_some() {
                    TokenKind::NotEquals
                } else {
                    TokenKind::Bang
                }
            }
            _ => {
                let mut word = String::new();
                while let Some((_, c)) = chars.next_if(|&(_, c)| !is_special(c)) {
                    word.push(c);
                }
                match word.as_str() {
                    "in" => TokenKind::In,
                    "notin" => TokenKind::NotIn,
                    _ => TokenKind::Identifier(word),
                }
            }
        };

        tokens.push(Token { kind, position });
    }

    tokens.push(Token {
        kind: TokenKind::End,
        position: input.len(),
    });

    tokens
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    cursor: usize,
}

impl Parser<'_> {
    fn peek(&self) -> &TokenKind {
        // lex always terminates the stream with End
        &self.tokens[self.cursor.min(self.tokens.len() - 1)].kind
    }

    fn next(&mut self) -> Token {
        let token = self.tokens[self.cursor.min(self.tokens.len() - 1)].clone();
        if self.cursor < self.tokens.len() - 1 {
            self.cursor += 1;
        }
        token
    }

    fn at_end(&self) -> bool {
        matches!(self.peek(), TokenKind::End)
    }

    fn unexpected(&self, token: &Token, expected: &'static str) -> SelectorError {
        SelectorError::Unexpected {
            input: self.input.to_string(),
            position: token.position,
            found: token.kind.describe(),
            expected,
        }
    }

    fn key(&mut self) -> Result<String, SelectorError> {
        let token = self.next();
        match token.kind {
            TokenKind::Identifier(key) => Ok(key),
            _ => Err(self.unexpected(&token, "label key")),
        }
    }

    /// A value may be empty, as in `tier=`
    fn value(&mut self) -> Result<String, SelectorError> {
        if let TokenKind::Identifier(value) = self.peek().clone() {
            self.next();
            return Ok(value);
        }

        match self.peek() {
            TokenKind::Comma | TokenKind::End | TokenKind::CloseParen => Ok(String::new()),
            _ => {
                let token = self.next();
                Err(self.unexpected(&token, "label value"))
            }
        }
    }

    fn value_set(
        &mut self,
        key: &str,
        operator: &'static str,
    ) -> Result<BTreeSet<String>, SelectorError> {
        let open = self.next();
        if open.kind != TokenKind::OpenParen {
            return Err(self.unexpected(&open, "'('"));
        }

        if matches!(self.peek(), TokenKind::CloseParen) {
            return Err(SelectorError::EmptyValueSet {
                key: key.to_string(),
                operator,
            });
        }

        let mut values = BTreeSet::new();
        loop {
            values.insert(self.value()?);

            let token = self.next();
            match token.kind {
                TokenKind::Comma => continue,
                TokenKind::CloseParen => break,
                _ => return Err(self.unexpected(&token, "',' or ')'")),
            }
        }

        Ok(values)
    }

    fn integer(&mut self, key: &str) -> Result<i64, SelectorError> {
        let token = self.next();
        match token.kind {
            TokenKind::Identifier(value) => {
                value
                    .parse::<i64>()
                    .map_err(|_| SelectorError::NotAnInteger {
                        key: key.to_string(),
                        value,
                    })
            }
            _ => Err(self.unexpected(&token, "integer")),
        }
    }

    fn requirement(&mut self) -> Result<Requirement, SelectorError> {
        if matches!(self.peek(), TokenKind::Bang) {
            self.next();
            let key = self.key()?;
            return Ok(Requirement {
                key,
                operator: Operator::DoesNotExist,
            });
        }

        let key = self.key()?;

        let operator = match self.peek() {
            TokenKind::Comma | TokenKind::End => Operator::Exists,
            TokenKind::Equals | TokenKind::DoubleEquals => {
                self.next();
                Operator::Equals(self.value()?)
            }
            TokenKind::NotEquals => {
                self.next();
                Operator::NotEquals(self.value()?)
            }
            TokenKind::In => {
                self.next();
                Operator::In(self.value_set(&key, "in")?)
            }
            TokenKind::NotIn => {
                self.next();
                Operator::NotIn(self.value_set(&key, "notin")?)
            }
            TokenKind::GreaterThan => {
                self.next();
                Operator::GreaterThan(self.integer(&key)?)
            }
            TokenKind::LessThan => {
                self.next();
                Operator::LessThan(self.integer(&key)?)
            }
            _ => {
                let token = self.next();
                return Err(self.unexpected(&token, "operator"));
            }
        };

        Ok(Requirement { key, operator })
    }
}
