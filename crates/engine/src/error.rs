//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use connectors::{Channel, ConnectorError};

use crate::models::{DefinitionStatus, EnrollmentStatus};

/// A caller request the engine refused. Always returned synchronously and
/// never recorded as an execution failure.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    // ------ Lookup errors ------

    #[error("unknown workflow definition '{0}'")]
    UnknownDefinition(String),

    #[error("unknown enrollment {0}")]
    UnknownEnrollment(Uuid),

    // ------ Definition errors ------

    /// A definition with this id is already registered.
    #[error("workflow definition '{0}' already exists")]
    DuplicateDefinition(String),

    #[error("workflow definition '{0}' has no steps")]
    NoSteps(String),

    /// A step could not be loaded.
    #[error("invalid step '{step_id}' in '{definition_id}': {reason}")]
    InvalidStep {
        definition_id: String,
        step_id: String,
        reason: String,
    },

    /// Definition status does not allow the requested operation.
    #[error("workflow definition '{id}' is {actual}, expected {expected}")]
    DefinitionStatus {
        id: String,
        actual: DefinitionStatus,
        expected: DefinitionStatus,
    },

    // ------ Enrollment errors ------

    /// The subject already has a live (active or paused) enrollment.
    #[error("subject '{subject_id}' is already enrolled in '{definition_id}' ({enrollment_id})")]
    AlreadyEnrolled {
        definition_id: String,
        subject_id: String,
        enrollment_id: Uuid,
    },

    /// The enrollment is already completed, terminated or failed.
    #[error("enrollment {id} is {status}")]
    EnrollmentClosed { id: Uuid, status: EnrollmentStatus },

    /// `retry_step` found no failed or back-off step to re-run.
    #[error("enrollment {0} has nothing to retry")]
    NothingToRetry(Uuid),
}

/// Why a single step execution failed.
///
/// Recorded as a `failure` history entry; the retry policy decides what
/// happens to the enrollment.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StepFailure {
    #[error("subject '{0}' not found")]
    SubjectNotFound(String),

    #[error("template '{0}' not found")]
    TemplateNotFound(String),

    #[error("subject '{subject_id}' has no {channel} address")]
    MissingContact { subject_id: String, channel: Channel },

    #[error("{channel} delivery failed: {source}")]
    Delivery {
        channel: Channel,
        #[source]
        source: ConnectorError,
    },

    #[error("record update failed: {0}")]
    RecordUpdate(#[source] ConnectorError),

    #[error("no owner available for assignment")]
    NoOwnerAvailable,

    #[error("step '{0}' no longer exists in its definition")]
    StepMissing(String),
}

impl StepFailure {
    /// Whether another attempt could succeed without outside intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TemplateNotFound(_) => true,
            Self::Delivery { source, .. } | Self::RecordUpdate(source) => source.is_retryable(),
            Self::SubjectNotFound(_)
            | Self::MissingContact { .. }
            | Self::NoOwnerAvailable
            | Self::StepMissing(_) => false,
        }
    }
}
