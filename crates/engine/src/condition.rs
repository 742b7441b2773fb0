//! Condition parsing and evaluation.
//!
//! A condition expression is `<field> <op> <literal>` or `<field> exists` /
//! `<field> not_exists`, with `op` one of `>`, `<`, `>=`, `<=`, `=` (`==` is
//! accepted as an alias). Expressions are parsed once when a step is loaded
//! into a typed [`ConditionRule`]; evaluation is a pure function over a
//! [`SubjectRecord`] snapshot and never fails: anything it cannot make sense
//! of evaluates to `false`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use connectors::SubjectRecord;

const FLOAT_EPSILON: f64 = 1e-9;

/// Why an expression could not be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("expression is empty")]
    Empty,

    #[error("missing field name")]
    MissingField,

    #[error("unsupported operator '{0}'")]
    UnsupportedOperator(String),

    #[error("operator '{0}' requires a value")]
    MissingValue(String),

    #[error("expected '<field> <op> <value>', '<field> exists' or '<field> not_exists', got '{0}'")]
    Unrecognized(String),

    #[error("trigger is missing an event name")]
    MissingEvent,

    #[error("invalid event name '{0}'")]
    InvalidEventName(String),
}

// ---------------------------------------------------------------------------
// Building blocks shared with trigger filters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Exists,
    NotExists,
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Gte => ">=",
            Self::Lte => "<=",
            Self::Eq => "=",
            Self::Exists => "exists",
            Self::NotExists => "not_exists",
        };
        f.write_str(symbol)
    }
}

impl Comparison {
    fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Self::Gt => ordering == Greater,
            Self::Lt => ordering == Less,
            Self::Gte => ordering != Less,
            Self::Lte => ordering != Greater,
            Self::Eq => ordering == Equal,
            Self::Exists | Self::NotExists => false,
        }
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl Literal {
    fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        for quote in ['"', '\''] {
            if let Some(inner) = raw.strip_prefix(quote).and_then(|r| r.strip_suffix(quote)) {
                return Self::Text(inner.to_owned());
            }
        }
        match raw {
            "true" => Self::Bool(true),
            "false" => Self::Bool(false),
            _ => raw
                .parse::<f64>()
                .map(Self::Number)
                .unwrap_or_else(|_| Self::Text(raw.to_owned())),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(t) => t.parse().ok(),
            Self::Bool(_) => None,
        }
    }

    fn as_text(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Text(t) => t.clone(),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

/// A parsed `<field> <op> [literal]` triple with an untyped field name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldComparison {
    pub field: String,
    pub comparison: Comparison,
    pub value: Option<Literal>,
}

impl FieldComparison {
    pub fn parse(expression: &str) -> Result<Self, ExpressionError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(ExpressionError::Empty);
        }

        if let Some(position) = expression.find(['>', '<', '=', '!']) {
            let field = expression[..position].trim();
            let rest = &expression[position..];
            let (comparison, symbol_len) = match rest {
                r if r.starts_with(">=") => (Comparison::Gte, 2),
                r if r.starts_with("<=") => (Comparison::Lte, 2),
                r if r.starts_with("==") => (Comparison::Eq, 2),
                r if r.starts_with('>') => (Comparison::Gt, 1),
                r if r.starts_with('<') => (Comparison::Lt, 1),
                r if r.starts_with('=') => (Comparison::Eq, 1),
                r => {
                    let symbol: String = r.chars().take_while(|c| "<>=!".contains(*c)).collect();
                    return Err(ExpressionError::UnsupportedOperator(symbol));
                }
            };
            if field.is_empty() {
                return Err(ExpressionError::MissingField);
            }
            let value = rest[symbol_len..].trim();
            if value.is_empty() {
                return Err(ExpressionError::MissingValue(comparison.to_string()));
            }
            return Ok(Self {
                field: field.to_owned(),
                comparison,
                value: Some(Literal::parse(value)),
            });
        }

        let tokens: Vec<&str> = expression.split_whitespace().collect();
        let comparison = match tokens.as_slice() {
            [_, "exists"] => Comparison::Exists,
            [_, "not_exists"] | [_, "not", "exists"] => Comparison::NotExists,
            _ => return Err(ExpressionError::Unrecognized(expression.to_owned())),
        };
        Ok(Self {
            field: tokens[0].to_owned(),
            comparison,
            value: None,
        })
    }

    /// Evaluate against an arbitrary record field (trigger filters).
    pub fn matches(&self, record: &SubjectRecord) -> bool {
        compare_value(record.field(&self.field).as_ref(), self.comparison, self.value.as_ref())
    }
}

impl fmt::Display for FieldComparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{} {} {}", self.field, self.comparison, value),
            None => write!(f, "{} {}", self.field, self.comparison),
        }
    }
}

/// Compare a JSON field value against a literal.
fn compare_value(actual: Option<&Value>, comparison: Comparison, expected: Option<&Literal>) -> bool {
    match comparison {
        Comparison::Exists => return actual.is_some(),
        Comparison::NotExists => return actual.is_none(),
        _ => {}
    }
    let (Some(actual), Some(expected)) = (actual, expected) else {
        return false;
    };

    match actual {
        Value::Number(n) => match (n.as_f64(), expected.as_number()) {
            (Some(a), Some(b)) => compare_numbers(a, b, comparison),
            _ => false,
        },
        Value::String(s) => match (s.parse::<f64>().ok(), expected) {
            (Some(a), Literal::Number(b)) => compare_numbers(a, *b, comparison),
            _ => comparison == Comparison::Eq && s.eq_ignore_ascii_case(&expected.as_text()),
        },
        Value::Bool(b) => comparison == Comparison::Eq && matches!(expected, Literal::Bool(e) if e == b),
        Value::Array(items) => {
            comparison == Comparison::Eq
                && items.iter().any(|item| {
                    item.as_str()
                        .is_some_and(|s| s.eq_ignore_ascii_case(&expected.as_text()))
                })
        }
        Value::Null | Value::Object(_) => false,
    }
}

fn compare_numbers(actual: f64, expected: f64, comparison: Comparison) -> bool {
    if comparison == Comparison::Eq {
        return (actual - expected).abs() < FLOAT_EPSILON;
    }
    actual
        .partial_cmp(&expected)
        .is_some_and(|ordering| comparison.holds(ordering))
}

// ---------------------------------------------------------------------------
// ConditionRule
// ---------------------------------------------------------------------------

/// The fixed vocabulary of fields a condition step may test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    Score,
    Replied,
    Source,
    /// Tag presence: `tag = vip`, `tag exists`.
    Tag,
    /// Anything else. Always evaluates to `false`.
    Unknown(String),
}

impl ConditionField {
    fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "score" | "lead_score" => Self::Score,
            "replied" | "reply" | "has_replied" | "reply_flag" | "reply-flag" => Self::Replied,
            "source" => Self::Source,
            "tag" | "tags" | "has_tag" => Self::Tag,
            _ => Self::Unknown(name.to_owned()),
        }
    }
}

/// A typed predicate produced from a condition step's expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionRule {
    pub field: ConditionField,
    pub comparison: Comparison,
    pub value: Option<Literal>,
}

impl ConditionRule {
    pub fn parse(expression: &str) -> Result<Self, ExpressionError> {
        let parsed = FieldComparison::parse(expression)?;
        Ok(Self {
            field: ConditionField::from_name(&parsed.field),
            comparison: parsed.comparison,
            value: parsed.value,
        })
    }

    pub fn evaluate(&self, record: &SubjectRecord) -> bool {
        let value = self.value.as_ref();
        match &self.field {
            ConditionField::Unknown(_) => false,
            ConditionField::Score => compare_value(record.field("score").as_ref(), self.comparison, value),
            ConditionField::Source => compare_value(
                record.field("source").filter(|s| s.as_str() != Some("")).as_ref(),
                self.comparison,
                value,
            ),
            ConditionField::Replied => match self.comparison {
                Comparison::Exists => record.replied,
                Comparison::NotExists => !record.replied,
                Comparison::Eq => matches!(value, Some(Literal::Bool(b)) if *b == record.replied),
                _ => false,
            },
            ConditionField::Tag => match self.comparison {
                Comparison::Exists => !record.tags.is_empty(),
                Comparison::NotExists => record.tags.is_empty(),
                Comparison::Eq => value.is_some_and(|tag| record.has_tag(&tag.as_text())),
                _ => false,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled expressions
// ---------------------------------------------------------------------------

/// An expression after loading. Malformed expressions are kept so they can
/// be reported, and never pass or match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Compiled<R> {
    Rule { expression: String, rule: R },
    Malformed { expression: String, reason: String },
}

impl<R> Compiled<R> {
    pub fn parse_with(expression: &str, parse: impl FnOnce(&str) -> Result<R, ExpressionError>) -> Self {
        match parse(expression) {
            Ok(rule) => Self::Rule {
                expression: expression.to_owned(),
                rule,
            },
            Err(e) => Self::Malformed {
                expression: expression.to_owned(),
                reason: e.to_string(),
            },
        }
    }

    pub fn expression(&self) -> &str {
        match self {
            Self::Rule { expression, .. } | Self::Malformed { expression, .. } => expression,
        }
    }

    pub fn rule(&self) -> Option<&R> {
        match self {
            Self::Rule { rule, .. } => Some(rule),
            Self::Malformed { .. } => None,
        }
    }
}

/// A condition step's expression.
pub type Condition = Compiled<ConditionRule>;

impl Compiled<ConditionRule> {
    pub fn compile(expression: &str) -> Self {
        Self::parse_with(expression, ConditionRule::parse)
    }

    /// Evaluate against a subject snapshot; a missing subject is `false`.
    pub fn evaluate(&self, record: Option<&SubjectRecord>) -> bool {
        self.rule()
            .zip(record)
            .is_some_and(|(rule, record)| rule.evaluate(record))
    }
}
