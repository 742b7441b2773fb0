//! In-memory collaborators.
//!
//! Useful in unit and integration tests, and for the CLI's `simulate`
//! command, where a real CRM or messaging provider is unavailable.
//! Every implementation records the calls it receives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::{
    traits::Collaborators, Channel, ChannelSender, ConnectorError, Interaction, InteractionLog,
    MessageTemplate, RecordPatch, RecordStore, SubjectRecord, TemplateStore,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<String, SubjectRecord>>,
    updates: Mutex<Vec<(String, RecordPatch)>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: SubjectRecord) {
        lock(&self.records).insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<SubjectRecord> {
        lock(&self.records).get(id).cloned()
    }

    /// Every patch applied so far, in call order.
    pub fn updates(&self) -> Vec<(String, RecordPatch)> {
        lock(&self.updates).clone()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get_subject(&self, id: &str) -> Option<SubjectRecord> {
        self.get(id)
    }

    async fn update_subject(&self, id: &str, patch: RecordPatch) -> Result<(), ConnectorError> {
        let mut records = lock(&self.records);
        let record = records
            .get_mut(id)
            .ok_or_else(|| ConnectorError::Fatal(format!("subject '{id}' not found")))?;
        record.apply(&patch);
        lock(&self.updates).push((id.to_owned(), patch));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryTemplateStore {
    templates: Mutex<HashMap<String, MessageTemplate>>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, template: MessageTemplate) {
        lock(&self.templates).insert(template.id.clone(), template);
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn get_template(&self, id: &str) -> Option<MessageTemplate> {
        lock(&self.templates).get(id).cloned()
    }
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Behaviour injected into [`RecordingSender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendBehaviour {
    /// Accept every message.
    Deliver,
    /// Reject with a `Retryable` error.
    FailRetryable(String),
    /// Reject with a `Fatal` error.
    FailFatal(String),
}

/// One message handed to [`RecordingSender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub channel: Channel,
    pub to: String,
    pub subject: Option<String>,
    pub body: String,
}

/// A sender that records every call and answers per its current behaviour.
#[derive(Debug)]
pub struct RecordingSender {
    behaviour: Mutex<SendBehaviour>,
    sent: Mutex<Vec<SentMessage>>,
}

impl Default for RecordingSender {
    fn default() -> Self {
        Self::new(SendBehaviour::Deliver)
    }
}

impl RecordingSender {
    pub fn new(behaviour: SendBehaviour) -> Self {
        Self {
            behaviour: Mutex::new(behaviour),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behaviour(&self, behaviour: SendBehaviour) {
        *lock(&self.behaviour) = behaviour;
    }

    /// All send attempts seen so far, including rejected ones.
    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.sent).clone()
    }

    /// Number of send attempts.
    pub fn call_count(&self) -> usize {
        lock(&self.sent).len()
    }

    fn attempt(&self, message: SentMessage) -> Result<(), ConnectorError> {
        debug!(channel = %message.channel, to = %message.to, "recording outbound message");
        lock(&self.sent).push(message);
        match &*lock(&self.behaviour) {
            SendBehaviour::Deliver => Ok(()),
            SendBehaviour::FailRetryable(msg) => Err(ConnectorError::Retryable(msg.clone())),
            SendBehaviour::FailFatal(msg) => Err(ConnectorError::Fatal(msg.clone())),
        }
    }
}

#[async_trait]
impl ChannelSender for RecordingSender {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), ConnectorError> {
        self.attempt(SentMessage {
            channel: Channel::Email,
            to: to.to_owned(),
            subject: Some(subject.to_owned()),
            body: body.to_owned(),
        })
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<(), ConnectorError> {
        self.attempt(SentMessage {
            channel: Channel::Sms,
            to: to.to_owned(),
            subject: None,
            body: body.to_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// Interactions
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryInteractionLog {
    entries: Mutex<Vec<(String, Interaction)>>,
}

impl InMemoryInteractionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interactions recorded for one subject, oldest first.
    pub fn for_subject(&self, subject_id: &str) -> Vec<Interaction> {
        lock(&self.entries)
            .iter()
            .filter(|(id, _)| id == subject_id)
            .map(|(_, interaction)| interaction.clone())
            .collect()
    }
}

#[async_trait]
impl InteractionLog for InMemoryInteractionLog {
    async fn record_interaction(&self, subject_id: &str, interaction: Interaction) {
        lock(&self.entries).push((subject_id.to_owned(), interaction));
    }
}

// ---------------------------------------------------------------------------
// Backend bundle
// ---------------------------------------------------------------------------

/// All four in-memory collaborators, kept as concrete handles so callers can
/// seed data and inspect calls after handing [`Collaborators`] to the engine.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    pub records: Arc<InMemoryRecordStore>,
    pub templates: Arc<InMemoryTemplateStore>,
    pub sender: Arc<RecordingSender>,
    pub interactions: Arc<InMemoryInteractionLog>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            records: self.records.clone(),
            templates: self.templates.clone(),
            sender: self.sender.clone(),
            interactions: self.interactions.clone(),
        }
    }
}
