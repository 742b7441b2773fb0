//! The collaborator traits, the only coupling the engine has to the
//! surrounding application.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{ConnectorError, Interaction, MessageTemplate, RecordPatch, SubjectRecord};

/// Read/write access to subject records (leads, residents, ...).
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch the current state of a subject; `None` when it does not exist.
    async fn get_subject(&self, id: &str) -> Option<SubjectRecord>;

    /// Apply a partial update to a subject.
    async fn update_subject(&self, id: &str, patch: RecordPatch) -> Result<(), ConnectorError>;
}

/// Lookup of message templates by id.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get_template(&self, id: &str) -> Option<MessageTemplate>;
}

/// Outbound delivery. Fire-and-forget from the engine's point of view: the
/// result only says whether the provider accepted the message.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), ConnectorError>;

    async fn send_sms(&self, to: &str, body: &str) -> Result<(), ConnectorError>;
}

/// Write-only communication history of a subject.
#[async_trait]
pub trait InteractionLog: Send + Sync {
    async fn record_interaction(&self, subject_id: &str, interaction: Interaction);
}

/// Bundle of collaborator handles injected into the engine.
#[derive(Clone)]
pub struct Collaborators {
    pub records: Arc<dyn RecordStore>,
    pub templates: Arc<dyn TemplateStore>,
    pub sender: Arc<dyn ChannelSender>,
    pub interactions: Arc<dyn InteractionLog>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
