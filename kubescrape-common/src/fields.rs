//! Field selectors
//!
//! Field selectors only support equality terms: `spec.nodeName=node1`,
//! `status.phase==Running`, `spec.restartPolicy!=Always`. Values may escape
//! `\`, `,` and `=` with a backslash.

use crate::SelectorError;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldTerm {
    Equals { field: String, value: String },
    NotEquals { field: String, value: String },
}

impl FieldTerm {
    /// A field missing from the set compares as the empty string
    pub fn matches(&self, fields: &BTreeMap<String, String>) -> bool {
        let lookup = |field: &str| fields.get(field).map(String::as_str).unwrap_or("");

        match self {
            FieldTerm::Equals { field, value } => lookup(field) == value,
            FieldTerm::NotEquals { field, value } => lookup(field) != value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldSelector {
    source: String,
    terms: Vec<FieldTerm>,
}

impl FieldSelector {
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }

        let terms = split_unescaped(trimmed, ',')
            .into_iter()
            .map(parse_term)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source: trimmed.to_string(),
            terms,
        })
    }

    pub fn everything() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn terms(&self) -> &[FieldTerm] {
        &self.terms
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, fields: &BTreeMap<String, String>) -> bool {
        self.terms.iter().all(|t| t.matches(fields))
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for FieldSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Split on `separator` occurrences that are not preceded by a backslash
fn split_unescaped(input: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;

    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == separator {
            parts.push(&input[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&input[start..]);

    parts
}

fn parse_term(term: &str) -> Result<FieldTerm, SelectorError> {
    const OPERATORS: [&str; 3] = ["!=", "==", "="];

    for (i, _) in term.char_indices() {
        for op in OPERATORS {
            if let Some(rest) = term[i..].strip_prefix(op) {
                let field = term[..i].trim();
                if field.is_empty() {
                    return Err(SelectorError::InvalidFieldTerm(term.to_string()));
                }
                let field = field.to_string();
                let value = unescape(rest.trim())
                    .ok_or_else(|| SelectorError::InvalidFieldTerm(term.to_string()))?;

                return Ok(match op {
                    "!=" => FieldTerm::NotEquals { field, value },
                    _ => FieldTerm::Equals { field, value },
                });
            }
        }
    }

    Err(SelectorError::InvalidFieldTerm(term.to_string()))
}

fn unescape(value: &str) -> Option<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(escaped @ ('\\' | ',' | '=')) => out.push(escaped),
            _ => return None,
        }
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = FieldSelector::parse("").unwrap();
        assert!(selector.is_empty());
        assert!(selector.matches(&fields(&[("spec.nodeName", "node1")])));
    }

    #[test]
    fn test_equality_terms() {
        let selector =
            FieldSelector::parse("spec.nodeName=node1,status.phase==Running").unwrap();
        assert_eq!(selector.terms().len(), 2);

        assert!(selector.matches(&fields(&[
            ("spec.nodeName", "node1"),
            ("status.phase", "Running")
        ])));
        assert!(!selector.matches(&fields(&[
            ("spec.nodeName", "node2"),
            ("status.phase", "Running")
        ])));
    }

    #[test]
    fn test_not_equals_and_missing_fields() {
        let selector = FieldSelector::parse("spec.restartPolicy!=Always").unwrap();

        assert!(selector.matches(&fields(&[("spec.restartPolicy", "Never")])));
        assert!(selector.matches(&fields(&[])));
        assert!(!selector.matches(&fields(&[("spec.restartPolicy", "Always")])));

        let empty = FieldSelector::parse("status.podIP=").unwrap();
        assert!(empty.matches(&fields(&[])));
        assert!(!empty.matches(&fields(&[("status.podIP", "10.0.0.1")])));
    }

    #[test]
    fn test_escaped_values() {
        let selector = FieldSelector::parse(r"metadata.name=a\,b\=c,spec.nodeName=n").unwrap();

        assert_eq!(
            selector.terms()[0],
            FieldTerm::Equals {
                field: "metadata.name".to_string(),
                value: "a,b=c".to_string(),
            }
        );
        assert_eq!(selector.terms().len(), 2);
    }

    #[test]
    fn test_invalid_terms() {
        assert!(FieldSelector::parse("spec.nodeName").is_err());
        assert!(FieldSelector::parse("=node1").is_err());
        assert!(FieldSelector::parse("a=b,,c=d").is_err());
        assert!(FieldSelector::parse(r"a=b\x").is_err());
    }
}
