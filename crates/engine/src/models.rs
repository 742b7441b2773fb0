//! Core domain models for the automation engine.
//!
//! Definitions arrive as serde-friendly `*Spec` structs (the JSON shape an
//! administrator edits) and are loaded once into typed models: actions are
//! resolved to [`StepAction`], conditions parsed into [`Condition`], the
//! trigger parsed into [`Trigger`].

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::condition::Condition;
use crate::trigger::Trigger;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    #[default]
    Draft,
    Active,
    Paused,
}

impl fmt::Display for DefinitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    Terminated,
    Failed,
}

impl EnrollmentStatus {
    /// Active or paused: counts against the one-live-enrollment-per-subject rule.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Terminated => write!(f, "terminated"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Step actions
// ---------------------------------------------------------------------------

/// Who an `assign-owner` step hands the subject to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerAssignment {
    User(String),
    /// The team default from `EngineConfig::default_owner_id`.
    TeamDefault,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    SendEmail { template_id: String },
    SendSms { template_id: String },
    AssignOwner { assignment: OwnerAssignment },
    CreateTask { title: Option<String> },
    AddTag { tag: Option<String> },
    RemoveTag { tag: Option<String> },
}

impl StepAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendEmail { .. } => "send-email",
            Self::SendSms { .. } => "send-sms",
            Self::AssignOwner { .. } => "assign-owner",
            Self::CreateTask { .. } => "create-task",
            Self::AddTag { .. } => "add-tag",
            Self::RemoveTag { .. } => "remove-tag",
        }
    }

    fn resolve(spec: &StepSpec) -> Result<Self, String> {
        let name = spec
            .action
            .as_deref()
            .ok_or("action step is missing 'action'")?
            .trim()
            .to_ascii_lowercase()
            .replace('_', "-");
        let config_str = |key: &str| spec.config.get(key).and_then(Value::as_str).map(str::to_owned);
        let template = || {
            spec.template_id
                .clone()
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| format!("'{name}' requires a template_id"))
        };

        let action = match name.as_str() {
            "send-email" => Self::SendEmail { template_id: template()? },
            "send-sms" => Self::SendSms { template_id: template()? },
            "assign-owner" => Self::AssignOwner {
                assignment: config_str("user_id")
                    .map(OwnerAssignment::User)
                    .unwrap_or(OwnerAssignment::TeamDefault),
            },
            "create-task" => Self::CreateTask { title: config_str("title") },
            "add-tag" => Self::AddTag { tag: config_str("tag") },
            "remove-tag" => Self::RemoveTag { tag: config_str("tag") },
            other => return Err(format!("unknown action '{other}'")),
        };
        Ok(action)
    }
}

// ---------------------------------------------------------------------------
// Specs (as authored)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKindSpec {
    Action,
    Delay,
    Condition,
}

/// A step as written in a definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    /// 1-based position within the definition.
    pub order: u32,
    pub kind: StepKindSpec,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub delay_hours: Option<u32>,
    #[serde(default)]
    pub condition: Option<String>,
    /// Action payload (`user_id`, `title`, `tag`, ...).
    #[serde(default)]
    pub config: Value,
}

/// A workflow definition as written in a definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub trigger: String,
    #[serde(default)]
    pub status: DefinitionStatus,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

// ---------------------------------------------------------------------------
// WorkflowStep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Action(StepAction),
    Delay { hours: u32 },
    Condition(Condition),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub order: u32,
    pub kind: StepKind,
}

impl WorkflowStep {
    /// Load one authored step.
    ///
    /// # Errors
    /// [`EngineError::InvalidStep`] when the step cannot be executed as
    /// written. A malformed condition expression is *not* an error: it is
    /// kept and fails closed at evaluation time.
    pub fn load(definition_id: &str, spec: &StepSpec) -> Result<Self, EngineError> {
        let invalid = |reason: String| EngineError::InvalidStep {
            definition_id: definition_id.to_owned(),
            step_id: spec.id.clone(),
            reason,
        };

        if spec.order == 0 {
            return Err(invalid("order index is 1-based".into()));
        }

        let kind = match spec.kind {
            StepKindSpec::Action => StepKind::Action(StepAction::resolve(spec).map_err(invalid)?),
            StepKindSpec::Delay => StepKind::Delay {
                hours: spec
                    .delay_hours
                    .ok_or_else(|| invalid("delay step is missing 'delay_hours'".into()))?,
            },
            StepKindSpec::Condition => {
                let expression = spec.condition.as_deref().unwrap_or_default();
                let condition = Condition::compile(expression);
                if let Condition::Malformed { reason, .. } = &condition {
                    warn!(
                        definition_id,
                        step_id = %spec.id,
                        expression,
                        "malformed condition, step will never pass: {reason}"
                    );
                }
                StepKind::Condition(condition)
            }
        };

        Ok(Self {
            id: spec.id.clone(),
            order: spec.order,
            kind,
        })
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            StepKind::Action(action) => action.name().to_owned(),
            StepKind::Delay { hours } => format!("delay {hours}h"),
            StepKind::Condition(condition) => format!("condition '{}'", condition.expression()),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub trigger: Trigger,
    pub status: DefinitionStatus,
    /// Sorted by `order`, strictly increasing.
    pub steps: Vec<WorkflowStep>,
    pub enrolled_count: u64,
    pub completed_count: u64,
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Load an authored definition into its typed form.
    ///
    /// # Errors
    /// - [`EngineError::InvalidStep`] for unloadable steps, duplicate step
    ///   ids or duplicate order indices.
    pub fn from_spec(spec: DefinitionSpec, created_at: DateTime<Utc>) -> Result<Self, EngineError> {
        let mut seen_ids = HashSet::new();
        let mut seen_orders = HashSet::new();
        let mut steps = Vec::with_capacity(spec.steps.len());

        for step_spec in &spec.steps {
            let step = WorkflowStep::load(&spec.id, step_spec)?;
            if !seen_ids.insert(step.id.clone()) {
                return Err(EngineError::InvalidStep {
                    definition_id: spec.id.clone(),
                    step_id: step.id,
                    reason: "duplicate step id".into(),
                });
            }
            if !seen_orders.insert(step.order) {
                return Err(EngineError::InvalidStep {
                    definition_id: spec.id.clone(),
                    step_id: step.id,
                    reason: format!("duplicate order index {}", step_spec.order),
                });
            }
            steps.push(step);
        }
        steps.sort_by_key(|s| s.order);

        Ok(Self {
            trigger: Trigger::compile(&spec.id, &spec.trigger),
            name: if spec.name.is_empty() { spec.id.clone() } else { spec.name },
            id: spec.id,
            status: spec.status,
            steps,
            enrolled_count: 0,
            completed_count: 0,
            created_at,
        })
    }

    pub fn first_step(&self) -> Option<&WorkflowStep> {
        self.steps.first()
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// The step following `step_id` by order index.
    pub fn next_step(&self, step_id: &str) -> Option<&WorkflowStep> {
        let current = self.step(step_id)?;
        self.steps.iter().find(|s| s.order > current.order)
    }
}

// ---------------------------------------------------------------------------
// Execution history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    Enrollment,
    StepExecution,
    DelayStart,
    ConditionEval,
    Completion,
    Failure,
    Retry,
    Termination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Failed,
    Pending,
    Skipped,
}

/// One immutable history record of an enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: Uuid,
    pub step_id: String,
    pub event: LogEvent,
    pub timestamp: DateTime<Utc>,
    pub status: LogStatus,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_result: Option<bool>,
}

impl ExecutionLogEntry {
    pub fn new(
        step_id: impl Into<String>,
        event: LogEvent,
        status: LogStatus,
        detail: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_id: step_id.into(),
            event,
            timestamp,
            status,
            detail: detail.into(),
            condition_result: None,
        }
    }

    pub fn with_condition_result(mut self, result: bool) -> Self {
        self.condition_result = Some(result);
        self
    }
}

// ---------------------------------------------------------------------------
// Enrollment
// ---------------------------------------------------------------------------

/// What a pending `next_step_due_at` is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    Delay,
    RetryBackoff,
    ConditionRecheck,
}

/// The live execution state of one subject in one definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub definition_id: String,
    pub subject_id: String,
    pub current_step_id: String,
    pub status: EnrollmentStatus,
    pub enrolled_at: DateTime<Utc>,
    pub last_step_completed_at: Option<DateTime<Utc>>,
    pub next_step_due_at: Option<DateTime<Utc>>,
    pub wait: Option<WaitReason>,
    /// Failed attempts at the current step.
    pub attempts: u32,
    /// False evaluations of the current condition step.
    pub condition_checks: u32,
    pub history: Vec<ExecutionLogEntry>,
}

impl Enrollment {
    pub fn new(
        definition_id: impl Into<String>,
        subject_id: impl Into<String>,
        first_step_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            definition_id: definition_id.into(),
            subject_id: subject_id.into(),
            current_step_id: first_step_id.into(),
            status: EnrollmentStatus::Active,
            enrolled_at: now,
            last_step_completed_at: None,
            next_step_due_at: None,
            wait: None,
            attempts: 0,
            condition_checks: 0,
            history: Vec::new(),
        }
    }

    /// Unset or passed due time.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_step_due_at.map_or(true, |due| due <= now)
    }

    pub fn log(&mut self, entry: ExecutionLogEntry) {
        self.history.push(entry);
    }

    /// Park the enrollment until `until`.
    pub fn wait_until(&mut self, until: DateTime<Utc>, reason: WaitReason) {
        self.next_step_due_at = Some(until);
        self.wait = Some(reason);
    }

    pub fn clear_wait(&mut self) {
        self.next_step_due_at = None;
        self.wait = None;
    }

    /// Move to `next_step_id`, resetting per-step counters.
    pub fn advance_to(&mut self, next_step_id: &str, now: DateTime<Utc>) {
        self.current_step_id = next_step_id.to_owned();
        self.last_step_completed_at = Some(now);
        self.attempts = 0;
        self.condition_checks = 0;
        self.clear_wait();
    }
}
