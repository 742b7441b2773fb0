//! `connectors` crate: the collaborator contracts the automation engine
//! consumes, plus in-memory implementations.
//!
//! The engine never touches lead, template or messaging internals directly.
//! Every read, write and send goes through one of the traits in [`traits`].

pub mod error;
pub mod memory;
pub mod models;
pub mod traits;

pub use error::ConnectorError;
pub use models::{Channel, Interaction, MessageTemplate, RecordPatch, SubjectRecord};
pub use traits::{ChannelSender, Collaborators, InteractionLog, RecordStore, TemplateStore};
