//! `{{token}}` substitution for message templates.

use std::collections::BTreeMap;

use connectors::{MessageTemplate, SubjectRecord};
use tracing::debug;

/// Named values substituted into a template for one subject.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenMap(BTreeMap<String, String>);

impl TokenMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: impl Into<String>, value: impl Into<String>) {
        self.0.insert(token.into(), value.into());
    }

    pub fn get(&self, token: &str) -> Option<&str> {
        self.0.get(token).map(String::as_str)
    }

    /// Tokens derived from a subject record. `portal_base_url` roots the
    /// derived links.
    pub fn for_subject(record: &SubjectRecord, portal_base_url: &str) -> Self {
        let base = portal_base_url.trim_end_matches('/');
        let mut tokens = Self::new();
        tokens.insert("first_name", record.first_name.as_str());
        tokens.insert("last_name", record.last_name.as_str());
        tokens.insert("full_name", record.full_name());
        tokens.insert("email", record.email.clone().unwrap_or_default());
        tokens.insert("phone", record.phone.clone().unwrap_or_default());
        tokens.insert("property_name", record.property_name.clone().unwrap_or_default());
        tokens.insert("source", record.source.clone().unwrap_or_default());
        tokens.insert(
            "score",
            record.score.map(|s| s.round().to_string()).unwrap_or_default(),
        );
        tokens.insert("application_link", format!("{base}/apply?lead={}", record.id));
        tokens.insert("schedule_tour_link", format!("{base}/tours/new?lead={}", record.id));
        tokens
    }
}

/// A template rendered for one subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

pub fn render_template(template: &MessageTemplate, tokens: &TokenMap) -> RenderedMessage {
    RenderedMessage {
        subject: render(&template.subject, tokens),
        body: render(&template.body, tokens),
    }
}

/// Replace every `{{ token }}` in `text`. Unknown tokens render as empty
/// text; an unterminated `{{` is copied through verbatim.
pub fn render(text: &str, tokens: &TokenMap) -> String {
    let mut out = String::with_capacity(text.len());
    let mut remainder = text;

    while let Some(start) = remainder.find("{{") {
        out.push_str(&remainder[..start]);
        let after_start = &remainder[start + 2..];
        let Some(end) = after_start.find("}}") else {
            out.push_str(&remainder[start..]);
            return out;
        };
        let token = after_start[..end].trim();
        match tokens.get(token) {
            Some(value) => out.push_str(value),
            None => debug!(token, "unknown template token"),
        }
        remainder = &after_start[end + 2..];
    }

    out.push_str(remainder);
    out
}
