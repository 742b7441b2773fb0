//! Step execution.
//!
//! `StepExecutor` performs the side effects of exactly one workflow step for
//! one enrollment and reports a [`StepOutcome`]. It never writes to the
//! enrollment store: committing the outcome (history, progression, retry
//! policy) is the engine's job, so a step that was interrupted while in
//! flight can be recorded without being applied.

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use connectors::{Channel, Collaborators, Interaction, RecordPatch};

use crate::condition::Condition;
use crate::config::{after, EngineConfig};
use crate::models::{
    DefinitionStatus, Enrollment, EnrollmentStatus, OwnerAssignment, StepAction, StepKind,
    WorkflowDefinition, WorkflowStep,
};
use crate::template::{render_template, TokenMap};
use crate::StepFailure;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What a single step did, before it is committed.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step's work is done; move on.
    Done { detail: String },
    /// A delay step started waiting.
    DelayStarted { until: DateTime<Utc> },
    /// A condition step was evaluated.
    ConditionEvaluated { passed: bool, detail: String },
    Failed(StepFailure),
}

/// Why `execute_step` did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another execution of this enrollment is running.
    InFlight,
    NotActive(EnrollmentStatus),
    DefinitionNotActive(DefinitionStatus),
    /// `next_step_due_at` is still in the future.
    NotDue(DateTime<Utc>),
    /// The enrollment was closed while the step was running; the attempt is
    /// in the history but was not applied.
    Interrupted(EnrollmentStatus),
}

/// The committed result of one `execute_step` call.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Skipped(SkipReason),
    Advanced { next_step_id: String },
    /// A delay is pending.
    Waiting { until: DateTime<Utc> },
    ConditionUnmet { recheck_at: DateTime<Utc> },
    Completed,
    Terminated,
    /// `retry_at` is `None` when the enrollment was moved to `failed`.
    Failed {
        error: StepFailure,
        retry_at: Option<DateTime<Utc>>,
    },
}

impl ExecutionResult {
    /// Whether the enrollment moved forward and may be executed again now.
    pub fn is_advanced(&self) -> bool {
        matches!(self, Self::Advanced { .. })
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

pub struct StepExecutor {
    collaborators: Collaborators,
    config: EngineConfig,
}

impl StepExecutor {
    pub fn new(collaborators: Collaborators, config: EngineConfig) -> Self {
        Self { collaborators, config }
    }

    /// Run `step` for `enrollment`.
    #[instrument(
        skip_all,
        fields(
            enrollment_id = %enrollment.id,
            workflow_id = %definition.id,
            step_id = %step.id,
        )
    )]
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> StepOutcome {
        match &step.kind {
            StepKind::Delay { hours } => {
                let until = after(now, std::time::Duration::from_secs(u64::from(*hours) * 3600));
                debug!("delay of {hours}h until {until}");
                StepOutcome::DelayStarted { until }
            }

            StepKind::Condition(condition) => self.evaluate(condition, &enrollment.subject_id).await,

            StepKind::Action(action) => {
                match self.run_action(definition, step, action, &enrollment.subject_id, now).await {
                    Ok(detail) => {
                        info!("{} succeeded: {detail}", action.name());
                        StepOutcome::Done { detail }
                    }
                    Err(failure) => {
                        warn!("{} failed: {failure}", action.name());
                        StepOutcome::Failed(failure)
                    }
                }
            }
        }
    }

    async fn evaluate(&self, condition: &Condition, subject_id: &str) -> StepOutcome {
        let record = self.collaborators.records.get_subject(subject_id).await;
        let passed = condition.evaluate(record.as_ref());
        let detail = match (condition, &record) {
            (Condition::Malformed { reason, .. }, _) => {
                format!("'{}' is malformed ({reason})", condition.expression())
            }
            (_, None) => format!("'{}' evaluated without subject record", condition.expression()),
            _ => format!("'{}' evaluated to {passed}", condition.expression()),
        };
        debug!(passed, "{detail}");
        StepOutcome::ConditionEvaluated { passed, detail }
    }

    async fn run_action(
        &self,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        action: &StepAction,
        subject_id: &str,
        now: DateTime<Utc>,
    ) -> Result<String, StepFailure> {
        match action {
            StepAction::SendEmail { template_id } => {
                self.send(Channel::Email, template_id, definition, step, subject_id, now)
                    .await
            }
            StepAction::SendSms { template_id } => {
                self.send(Channel::Sms, template_id, definition, step, subject_id, now)
                    .await
            }
            StepAction::AssignOwner { assignment } => {
                let owner = match assignment {
                    OwnerAssignment::User(user_id) => user_id.clone(),
                    OwnerAssignment::TeamDefault => self
                        .config
                        .default_owner_id
                        .clone()
                        .ok_or(StepFailure::NoOwnerAvailable)?,
                };
                self.collaborators
                    .records
                    .update_subject(subject_id, RecordPatch::owner(owner.clone()))
                    .await
                    .map_err(StepFailure::RecordUpdate)?;
                Ok(format!("owner set to '{owner}'"))
            }
            // Task creation belongs to the task service; only the intent is recorded.
            StepAction::CreateTask { title } => Ok(format!(
                "task requested: {}",
                title.as_deref().unwrap_or("follow up")
            )),
            StepAction::AddTag { tag } | StepAction::RemoveTag { tag } => Ok(format!(
                "{} '{}' acknowledged",
                action.name(),
                tag.as_deref().unwrap_or_default()
            )),
        }
    }

    /// Render a template for the subject, deliver it and record the
    /// interaction. Nothing is sent if any lookup fails.
    async fn send(
        &self,
        channel: Channel,
        template_id: &str,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        subject_id: &str,
        now: DateTime<Utc>,
    ) -> Result<String, StepFailure> {
        let subject = self
            .collaborators
            .records
            .get_subject(subject_id)
            .await
            .ok_or_else(|| StepFailure::SubjectNotFound(subject_id.to_owned()))?;
        let template = self
            .collaborators
            .templates
            .get_template(template_id)
            .await
            .ok_or_else(|| StepFailure::TemplateNotFound(template_id.to_owned()))?;

        let address = match channel {
            Channel::Email => subject.email.as_deref(),
            Channel::Sms => subject.phone.as_deref(),
        }
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| StepFailure::MissingContact {
            subject_id: subject_id.to_owned(),
            channel,
        })?
        .to_owned();

        let tokens = TokenMap::for_subject(&subject, &self.config.portal_base_url);
        let message = render_template(&template, &tokens);

        let sender = &self.collaborators.sender;
        let delivery = match channel {
            Channel::Email => sender.send_email(&address, &message.subject, &message.body).await,
            Channel::Sms => sender.send_sms(&address, &message.body).await,
        };

        self.collaborators
            .interactions
            .record_interaction(
                subject_id,
                Interaction {
                    channel,
                    subject: (channel == Channel::Email).then(|| message.subject.clone()),
                    body: message.body.clone(),
                    delivered: delivery.is_ok(),
                    workflow_id: definition.id.clone(),
                    step_id: step.id.clone(),
                    occurred_at: now,
                },
            )
            .await;

        delivery.map_err(|source| StepFailure::Delivery { channel, source })?;
        Ok(format!("{channel} sent to {address} using template '{template_id}'"))
    }
}
