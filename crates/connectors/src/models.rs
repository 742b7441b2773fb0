//! Records exchanged between the engine and its collaborators.
//!
//! These are *boundary* types: the surrounding application owns the real
//! lead/template stores and only hands the engine these snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// SubjectRecord
// ---------------------------------------------------------------------------

/// Snapshot of the entity a workflow runs against (usually a lead).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubjectRecord {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Lead source identifier (`zillow`, `website`, `walk_in`, ...).
    pub source: Option<String>,
    pub status: Option<String>,
    pub score: Option<f64>,
    /// Whether the subject has replied to any outbound message.
    pub replied: bool,
    pub tags: Vec<String>,
    pub owner_id: Option<String>,
    /// Display name of the linked property, if any.
    pub property_name: Option<String>,
    /// Free-form fields the application attaches to the record.
    pub attributes: Map<String, Value>,
}

impl SubjectRecord {
    /// Convenience constructor for testing.
    pub fn new(id: impl Into<String>, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            ..Self::default()
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Look up a field by name as a JSON value.
    ///
    /// Named fields win over `attributes`; `None` means the field is unset.
    pub fn field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "id" => Value::String(self.id.clone()),
            "first_name" => Value::String(self.first_name.clone()),
            "last_name" => Value::String(self.last_name.clone()),
            "full_name" => Value::String(self.full_name()),
            "email" => Value::String(self.email.clone()?),
            "phone" => Value::String(self.phone.clone()?),
            "source" => Value::String(self.source.clone()?),
            "status" => Value::String(self.status.clone()?),
            "score" => serde_json::Number::from_f64(self.score?).map(Value::Number)?,
            "replied" => Value::Bool(self.replied),
            "tags" => Value::Array(self.tags.iter().cloned().map(Value::String).collect()),
            "owner_id" => Value::String(self.owner_id.clone()?),
            "property_name" => Value::String(self.property_name.clone()?),
            other => return self.attributes.get(other).filter(|v| !v.is_null()).cloned(),
        };
        Some(value)
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, patch: &RecordPatch) {
        if let Some(owner) = &patch.owner_id {
            self.owner_id = Some(owner.clone());
        }
        if let Some(status) = &patch.status {
            self.status = Some(status.clone());
        }
        for tag in &patch.add_tags {
            if !self.has_tag(tag) {
                self.tags.push(tag.clone());
            }
        }
        self.tags
            .retain(|t| !patch.remove_tags.iter().any(|r| r.eq_ignore_ascii_case(t)));
        for (key, value) in &patch.attributes {
            self.attributes.insert(key.clone(), value.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// RecordPatch
// ---------------------------------------------------------------------------

/// Partial update for [`SubjectRecord`]; unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordPatch {
    pub owner_id: Option<String>,
    pub status: Option<String>,
    pub add_tags: Vec<String>,
    pub remove_tags: Vec<String>,
    pub attributes: Map<String, Value>,
}

impl RecordPatch {
    pub fn owner(user_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(user_id.into()),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// MessageTemplate
// ---------------------------------------------------------------------------

/// A message template with `{{token}}` placeholders in subject and body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Subject line; ignored for SMS.
    #[serde(default)]
    pub subject: String,
    pub body: String,
}

// ---------------------------------------------------------------------------
// Interaction
// ---------------------------------------------------------------------------

/// Outbound channel a message was delivered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Sms => write!(f, "sms"),
        }
    }
}

/// An automated outbound message, appended to the subject's communication
/// history whether or not delivery succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub channel: Channel,
    /// Rendered subject line (email only).
    pub subject: Option<String>,
    pub body: String,
    pub delivered: bool,
    pub workflow_id: String,
    pub step_id: String,
    pub occurred_at: DateTime<Utc>,
}
