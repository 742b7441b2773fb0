//! Trigger expressions and event matching.
//!
//! A trigger is `<event> [where <filter> [and <filter>]*]`, each filter a
//! [`FieldComparison`] evaluated against the subject record. An event named
//! `<base>:<source>` (e.g. `lead_created:zillow`) also satisfies triggers on
//! the bare `<base>` event.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use connectors::SubjectRecord;

use crate::condition::{Compiled, ExpressionError, FieldComparison};
use crate::models::{DefinitionStatus, WorkflowDefinition};

pub const LEAD_CREATED: &str = "lead_created";
pub const TOUR_COMPLETED: &str = "tour_completed";
pub const MOVE_IN_COMPLETED: &str = "move_in_completed";

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A runtime event raised by the surrounding application. Metadata is
/// carried into the `enrollment` history entry of every enrollment it causes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub subject_id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subject_id: subject_id.into(),
            metadata: Map::new(),
        }
    }

    /// `lead_created`, or `lead_created:<source>` when the source is known.
    pub fn lead_created(subject_id: impl Into<String>, source: Option<&str>) -> Self {
        let name = match source.map(str::trim).filter(|s| !s.is_empty()) {
            Some(source) => format!("{LEAD_CREATED}:{source}"),
            None => LEAD_CREATED.to_owned(),
        };
        Self::new(name, subject_id)
    }

    pub fn tour_completed(subject_id: impl Into<String>) -> Self {
        Self::new(TOUR_COMPLETED, subject_id)
    }

    pub fn move_in_completed(subject_id: impl Into<String>) -> Self {
        Self::new(MOVE_IN_COMPLETED, subject_id)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The event name without its `:<source>` suffix.
    pub fn base_name(&self) -> &str {
        self.name.split_once(':').map_or(self.name.as_str(), |(base, _)| base)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.metadata.is_empty() {
            write!(f, " {}", Value::Object(self.metadata.clone()))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRule {
    pub event: String,
    pub filters: Vec<FieldComparison>,
}

impl TriggerRule {
    pub fn parse(expression: &str) -> Result<Self, ExpressionError> {
        let expression = expression.trim();
        let lowered = expression.to_ascii_lowercase();
        let (event, filters) = match lowered.find(" where ") {
            Some(position) => (&expression[..position], Some(&expression[position + 7..])),
            None => (expression, None),
        };

        let event = event.trim();
        if event.is_empty() {
            return Err(ExpressionError::MissingEvent);
        }
        if event.contains(char::is_whitespace) {
            return Err(ExpressionError::InvalidEventName(event.to_owned()));
        }

        let filters = match filters {
            Some(raw) => split_conjunction(raw)
                .into_iter()
                .map(FieldComparison::parse)
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            event: event.to_owned(),
            filters,
        })
    }

    pub fn matches_event(&self, event: &Event) -> bool {
        self.event.eq_ignore_ascii_case(&event.name)
            || self.event.eq_ignore_ascii_case(event.base_name())
    }

    /// Every filter holds for the record. No filters always holds; filters
    /// against a missing record never do.
    pub fn matches_record(&self, record: Option<&SubjectRecord>) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        record.is_some_and(|record| self.filters.iter().all(|f| f.matches(record)))
    }
}

/// Split on the keyword `and` (case-insensitive) between filters.
fn split_conjunction(raw: &str) -> Vec<&str> {
    let lowered = raw.to_ascii_lowercase();
    let mut parts = Vec::new();
    let mut start = 0;
    while let Some(offset) = lowered[start..].find(" and ") {
        parts.push(&raw[start..start + offset]);
        start += offset + 5;
    }
    parts.push(&raw[start..]);
    parts
}

/// A definition's trigger after loading. Malformed triggers never match.
pub type Trigger = Compiled<TriggerRule>;

impl Compiled<TriggerRule> {
    pub fn compile(definition_id: &str, expression: &str) -> Self {
        let trigger = Self::parse_with(expression, TriggerRule::parse);
        if let Self::Malformed { reason, .. } = &trigger {
            warn!(definition_id, expression, "malformed trigger, definition will never match: {reason}");
        }
        trigger
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Active definitions whose trigger matches `event` and whose filters hold
/// for `record`. Pure query: an empty result is not an error.
pub fn match_definitions(
    definitions: &[WorkflowDefinition],
    event: &Event,
    record: Option<&SubjectRecord>,
) -> Vec<WorkflowDefinition> {
    let matched: Vec<WorkflowDefinition> = definitions
        .iter()
        .filter(|d| d.status == DefinitionStatus::Active)
        .filter(|d| {
            d.trigger
                .rule()
                .is_some_and(|rule| rule.matches_event(event) && rule.matches_record(record))
        })
        .cloned()
        .collect();

    debug!(event = %event.name, subject_id = %event.subject_id, matched = matched.len(), "trigger match");
    matched
}
