//! The automation engine façade.
//!
//! `AutomationEngine` owns the definition registry and enrollment store and
//! exposes every operation the surrounding application calls: event hooks,
//! admin controls, and the step execution the scheduler drives. It is cheap
//! to clone; clones share the same state.
//!
//! Step passes that are not the direct subject of a call (an enrollment's
//! first pass, resumed enrollments, scheduler scans) run as their own tokio
//! tasks, so a channel call that never returns holds up only its enrollment.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use connectors::Collaborators;

use crate::clock::{Clock, SystemClock};
use crate::config::{after, EngineConfig};
use crate::executor::{ExecutionResult, SkipReason, StepExecutor, StepOutcome};
use crate::models::{
    DefinitionSpec, DefinitionStatus, Enrollment, EnrollmentStatus, ExecutionLogEntry, LogEvent,
    LogStatus, StepKind, StepSpec, WaitReason, WorkflowDefinition, WorkflowStep,
};
use crate::registry::DefinitionRegistry;
use crate::store::EnrollmentStore;
use crate::trigger::{match_definitions, Event};
use crate::{EngineError, StepFailure};

/// Result of one pass over an enrollment, as returned by a pass task.
pub type PassResult = Result<ExecutionResult, EngineError>;

/// A new enrollment and the task running its first pass. Dropping
/// `first_pass` detaches the task; it keeps running.
#[derive(Debug)]
pub struct Enrolled {
    pub id: Uuid,
    pub first_pass: JoinHandle<PassResult>,
}

/// Outcome of enrolling a subject into one definition matched by an event.
#[derive(Debug)]
pub struct EventEnrollment {
    pub definition_id: String,
    pub outcome: Result<Enrolled, EngineError>,
}

/// Tally of one scheduler scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Due enrollments found at the start of the scan.
    pub examined: usize,
    pub completed: usize,
    /// Now waiting on a delay, a retry back-off or a condition re-check.
    pub waiting: usize,
    /// Ended the pass on a failed step (retry scheduled or enrollment failed).
    pub failed: usize,
    /// Terminated, skipped or interrupted.
    pub other: usize,
    /// Enrollments whose execution returned an error.
    pub errors: usize,
}

struct EngineInner {
    config: EngineConfig,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    definitions: Arc<DefinitionRegistry>,
    enrollments: Arc<EnrollmentStore>,
    executor: StepExecutor,
}

#[derive(Clone)]
pub struct AutomationEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for AutomationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomationEngine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl AutomationEngine {
    /// An engine on the wall clock with empty stores.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        Self::from_parts(
            config,
            collaborators,
            Arc::new(SystemClock),
            Arc::new(DefinitionRegistry::new()),
            Arc::new(EnrollmentStore::new()),
        )
    }

    /// An engine over explicitly provided clock and stores.
    pub fn from_parts(
        config: EngineConfig,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        definitions: Arc<DefinitionRegistry>,
        enrollments: Arc<EnrollmentStore>,
    ) -> Self {
        let executor = StepExecutor::new(collaborators.clone(), config.clone());
        Self {
            inner: Arc::new(EngineInner {
                config,
                collaborators,
                clock,
                definitions,
                enrollments,
                executor,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.inner.collaborators
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Load and register a definition in the status it was authored with.
    pub fn register_definition(&self, spec: DefinitionSpec) -> Result<(), EngineError> {
        let definition = WorkflowDefinition::from_spec(spec, self.now())?;
        info!(
            workflow_id = %definition.id,
            status = %definition.status,
            steps = definition.steps.len(),
            "registered workflow definition"
        );
        self.inner.definitions.register(definition)
    }

    pub fn append_step(&self, definition_id: &str, spec: &StepSpec) -> Result<WorkflowStep, EngineError> {
        self.inner.definitions.append_step(definition_id, spec)
    }

    pub fn definition(&self, definition_id: &str) -> Option<WorkflowDefinition> {
        self.inner.definitions.get(definition_id)
    }

    pub fn definitions(&self) -> Vec<WorkflowDefinition> {
        self.inner.definitions.list()
    }

    /// `draft` → `active`.
    pub fn activate(&self, definition_id: &str) -> Result<(), EngineError> {
        self.inner
            .definitions
            .transition(definition_id, DefinitionStatus::Draft, DefinitionStatus::Active)?;
        info!(workflow_id = definition_id, "workflow activated");
        Ok(())
    }

    /// Pause a definition and all of its active enrollments. Returns the
    /// number of enrollments paused.
    #[instrument(skip(self))]
    pub fn pause(&self, definition_id: &str) -> Result<usize, EngineError> {
        self.inner
            .definitions
            .transition(definition_id, DefinitionStatus::Active, DefinitionStatus::Paused)?;

        let store = &self.inner.enrollments;
        let mut paused = 0;
        for id in store.ids_with_status(definition_id, EnrollmentStatus::Active) {
            let changed = store.update(id, |e| {
                let active = e.status == EnrollmentStatus::Active;
                if active {
                    e.status = EnrollmentStatus::Paused;
                }
                active
            })?;
            paused += usize::from(changed);
        }

        info!(paused, "workflow paused");
        Ok(paused)
    }

    /// Resume a paused definition, re-activate its paused enrollments and
    /// immediately dispatch a pass for each. Returns the pass tasks, one per
    /// resumed enrollment. Must be called from within a tokio runtime.
    #[instrument(skip(self))]
    pub fn resume(&self, definition_id: &str) -> Result<Vec<JoinHandle<PassResult>>, EngineError> {
        self.inner
            .definitions
            .transition(definition_id, DefinitionStatus::Paused, DefinitionStatus::Active)?;

        let store = &self.inner.enrollments;
        let mut resumed = Vec::new();
        for id in store.ids_with_status(definition_id, EnrollmentStatus::Paused) {
            let changed = store.update(id, |e| {
                let paused = e.status == EnrollmentStatus::Paused;
                if paused {
                    e.status = EnrollmentStatus::Active;
                }
                paused
            })?;
            if changed {
                resumed.push(id);
            }
        }

        info!(resumed = resumed.len(), "workflow resumed");
        Ok(resumed.into_iter().map(|id| self.spawn_pass(id)).collect())
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Enroll the event's subject into every active definition whose trigger
    /// matches. Rejections (e.g. already enrolled) are reported per
    /// definition, not as an error. First passes are dispatched, not awaited.
    #[instrument(skip(self, event), fields(event = %event.name, subject_id = %event.subject_id))]
    pub async fn handle_event(&self, event: &Event) -> Vec<EventEnrollment> {
        let record = self
            .inner
            .collaborators
            .records
            .get_subject(&event.subject_id)
            .await;
        let matched = match_definitions(&self.inner.definitions.list(), event, record.as_ref());

        let mut results = Vec::with_capacity(matched.len());
        for definition in matched {
            let outcome = self.start_enrollment(&definition.id, &event.subject_id, Some(event));
            if let Err(e) = &outcome {
                debug!(workflow_id = %definition.id, "event did not enroll subject: {e}");
            }
            results.push(EventEnrollment {
                definition_id: definition.id,
                outcome,
            });
        }
        results
    }

    pub async fn on_lead_created(&self, subject_id: &str, source: Option<&str>) -> Vec<EventEnrollment> {
        self.handle_event(&Event::lead_created(subject_id, source)).await
    }

    pub async fn on_tour_completed(&self, subject_id: &str) -> Vec<EventEnrollment> {
        self.handle_event(&Event::tour_completed(subject_id)).await
    }

    pub async fn on_move_in_completed(&self, subject_id: &str) -> Vec<EventEnrollment> {
        self.handle_event(&Event::move_in_completed(subject_id)).await
    }

    // -----------------------------------------------------------------------
    // Enrollments
    // -----------------------------------------------------------------------

    /// Enroll `subject_id` into `definition_id` and dispatch the first pass.
    ///
    /// Returns once the enrollment is stored; the first pass runs on its own
    /// task. Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// - [`EngineError::UnknownDefinition`]
    /// - [`EngineError::DefinitionStatus`] unless the definition is active.
    /// - [`EngineError::NoSteps`]
    /// - [`EngineError::AlreadyEnrolled`] if a live enrollment exists.
    pub fn enroll(&self, definition_id: &str, subject_id: &str) -> Result<Enrolled, EngineError> {
        self.start_enrollment(definition_id, subject_id, None)
    }

    #[instrument(skip(self, cause))]
    fn start_enrollment(
        &self,
        definition_id: &str,
        subject_id: &str,
        cause: Option<&Event>,
    ) -> Result<Enrolled, EngineError> {
        let definition = self
            .inner
            .definitions
            .get(definition_id)
            .ok_or_else(|| EngineError::UnknownDefinition(definition_id.to_owned()))?;
        if definition.status != DefinitionStatus::Active {
            return Err(EngineError::DefinitionStatus {
                id: definition.id,
                actual: definition.status,
                expected: DefinitionStatus::Active,
            });
        }
        let first = definition
            .first_step()
            .ok_or_else(|| EngineError::NoSteps(definition.id.clone()))?;

        let now = self.now();
        let detail = match cause {
            Some(event) => format!("enrolled in '{}' by {event}", definition.name),
            None => format!("enrolled in '{}'", definition.name),
        };
        let mut enrollment = Enrollment::new(&definition.id, subject_id, &first.id, now);
        enrollment.log(ExecutionLogEntry::new(&first.id, LogEvent::Enrollment, LogStatus::Success, detail, now));
        let id = enrollment.id;
        self.inner.enrollments.insert(enrollment)?;
        self.inner.definitions.record_enrollment(&definition.id);
        info!(enrollment_id = %id, "subject enrolled");

        Ok(Enrolled {
            id,
            first_pass: self.spawn_pass(id),
        })
    }

    /// Execute at most one step of an enrollment.
    ///
    /// A no-op ([`ExecutionResult::Skipped`]) unless the enrollment and its
    /// definition are active, the step is due and no other execution of the
    /// same enrollment is in flight. Repeated calls therefore perform the
    /// work of a due step only once.
    #[instrument(skip(self))]
    pub async fn execute_step(&self, enrollment_id: Uuid) -> Result<ExecutionResult, EngineError> {
        let store = &self.inner.enrollments;
        let Some(_claim) = store.claim(enrollment_id)? else {
            return Ok(ExecutionResult::Skipped(SkipReason::InFlight));
        };
        let enrollment = store
            .get(enrollment_id)
            .ok_or(EngineError::UnknownEnrollment(enrollment_id))?;
        if enrollment.status != EnrollmentStatus::Active {
            return Ok(ExecutionResult::Skipped(SkipReason::NotActive(enrollment.status)));
        }
        let definition = self
            .inner
            .definitions
            .get(&enrollment.definition_id)
            .ok_or_else(|| EngineError::UnknownDefinition(enrollment.definition_id.clone()))?;
        if definition.status != DefinitionStatus::Active {
            return Ok(ExecutionResult::Skipped(SkipReason::DefinitionNotActive(definition.status)));
        }
        let now = self.now();
        if let Some(due) = enrollment.next_step_due_at.filter(|due| *due > now) {
            return Ok(ExecutionResult::Skipped(SkipReason::NotDue(due)));
        }

        let Some(step) = definition.step(&enrollment.current_step_id) else {
            return self.fail_missing_step(&enrollment);
        };

        let outcome = match (&step.kind, enrollment.wait) {
            (StepKind::Delay { hours }, Some(WaitReason::Delay)) => StepOutcome::Done {
                detail: format!("delay of {hours}h elapsed"),
            },
            _ => {
                self.inner
                    .executor
                    .execute(&definition, step, &enrollment, now)
                    .await
            }
        };

        self.commit(&definition, step, enrollment_id, outcome)
    }

    /// Execute steps until the enrollment waits, fails, finishes or is
    /// skipped. Returns the last result.
    pub async fn advance(&self, enrollment_id: Uuid) -> Result<ExecutionResult, EngineError> {
        loop {
            let result = self.execute_step(enrollment_id).await?;
            if !result.is_advanced() {
                return Ok(result);
            }
        }
    }

    /// Run [`advance`](Self::advance) on its own task.
    fn spawn_pass(&self, enrollment_id: Uuid) -> JoinHandle<PassResult> {
        tokio::spawn(self.clone().logged_pass(enrollment_id))
    }

    async fn logged_pass(self, enrollment_id: Uuid) -> PassResult {
        let result = self.advance(enrollment_id).await;
        if let Err(e) = &result {
            warn!(enrollment_id = %enrollment_id, "could not execute enrollment: {e}");
        }
        result
    }

    /// Force an enrollment to `terminated`.
    ///
    /// # Errors
    /// - [`EngineError::UnknownEnrollment`]
    /// - [`EngineError::EnrollmentClosed`] if it already reached a terminal status.
    #[instrument(skip(self))]
    pub fn terminate(&self, enrollment_id: Uuid, reason: &str) -> Result<(), EngineError> {
        let now = self.now();
        self.inner.enrollments.update(enrollment_id, |e| {
            if !e.status.is_live() {
                return Err(EngineError::EnrollmentClosed {
                    id: e.id,
                    status: e.status,
                });
            }
            e.status = EnrollmentStatus::Terminated;
            e.clear_wait();
            let step_id = e.current_step_id.clone();
            e.log(ExecutionLogEntry::new(
                step_id,
                LogEvent::Termination,
                LogStatus::Success,
                reason,
                now,
            ));
            Ok(())
        })??;
        info!("enrollment terminated: {reason}");
        Ok(())
    }

    /// Re-run the current step now: revives a `failed` enrollment, or cuts
    /// short a retry back-off or condition re-check wait.
    ///
    /// # Errors
    /// - [`EngineError::UnknownEnrollment`]
    /// - [`EngineError::DefinitionStatus`] unless the definition is active.
    /// - [`EngineError::NothingToRetry`]
    /// - [`EngineError::AlreadyEnrolled`] if reviving would duplicate a live enrollment.
    #[instrument(skip(self))]
    pub async fn retry_step(&self, enrollment_id: Uuid) -> Result<ExecutionResult, EngineError> {
        let store = &self.inner.enrollments;
        let enrollment = store
            .get(enrollment_id)
            .ok_or(EngineError::UnknownEnrollment(enrollment_id))?;
        let status = self
            .inner
            .definitions
            .status(&enrollment.definition_id)
            .ok_or_else(|| EngineError::UnknownDefinition(enrollment.definition_id.clone()))?;
        if status != DefinitionStatus::Active {
            return Err(EngineError::DefinitionStatus {
                id: enrollment.definition_id,
                actual: status,
                expected: DefinitionStatus::Active,
            });
        }

        let now = self.now();
        store.update(enrollment_id, |e| {
            let detail = match (e.status, e.wait) {
                (EnrollmentStatus::Failed, _) => "manual retry of failed step",
                (EnrollmentStatus::Active, Some(WaitReason::RetryBackoff)) => "retry back-off skipped",
                (EnrollmentStatus::Active, Some(WaitReason::ConditionRecheck)) => "condition re-check forced",
                _ => return Err(EngineError::NothingToRetry(e.id)),
            };
            if e.status == EnrollmentStatus::Failed {
                e.attempts = 0;
                e.condition_checks = 0;
            }
            e.status = EnrollmentStatus::Active;
            e.clear_wait();
            let step_id = e.current_step_id.clone();
            e.log(ExecutionLogEntry::new(step_id, LogEvent::Retry, LogStatus::Pending, detail, now));
            Ok(())
        })??;

        self.advance(enrollment_id).await
    }

    pub fn enrollment(&self, enrollment_id: Uuid) -> Option<Enrollment> {
        self.inner.enrollments.get(enrollment_id)
    }

    pub fn enrollments(&self) -> Vec<Enrollment> {
        self.inner.enrollments.list()
    }

    pub fn enrollments_for(&self, definition_id: &str) -> Vec<Enrollment> {
        self.inner
            .enrollments
            .list()
            .into_iter()
            .filter(|e| e.definition_id == definition_id)
            .collect()
    }

    pub fn history(&self, enrollment_id: Uuid) -> Option<Vec<ExecutionLogEntry>> {
        self.inner.enrollments.history(enrollment_id)
    }

    // -----------------------------------------------------------------------
    // Scanning
    // -----------------------------------------------------------------------

    /// Spawn a pass onto `tasks` for every active enrollment that is due and
    /// not already executing. Returns the number dispatched.
    pub fn dispatch_due(&self, tasks: &mut JoinSet<PassResult>) -> usize {
        let due = self.inner.enrollments.due(self.now());
        for id in &due {
            tasks.spawn(self.clone().logged_pass(*id));
        }
        due.len()
    }

    /// One scan: dispatch every due enrollment concurrently and wait for all
    /// of the passes. Errors from one enrollment never abort the scan.
    pub async fn run_due(&self) -> ScanReport {
        let mut tasks = JoinSet::new();
        let mut report = ScanReport {
            examined: self.dispatch_due(&mut tasks),
            ..ScanReport::default()
        };

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(ExecutionResult::Completed)) => report.completed += 1,
                Ok(Ok(ExecutionResult::Waiting { .. } | ExecutionResult::ConditionUnmet { .. })) => {
                    report.waiting += 1
                }
                Ok(Ok(ExecutionResult::Failed { .. })) => report.failed += 1,
                Ok(Ok(_)) => report.other += 1,
                Ok(Err(_)) => report.errors += 1,
                Err(e) => {
                    report.errors += 1;
                    error!("enrollment pass ended abnormally: {e}");
                }
            }
        }

        if report.examined > 0 {
            debug!(?report, "scan finished");
        }
        report
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    /// Record `outcome` in the enrollment's history and apply it, including
    /// the retry and condition re-check policies.
    fn commit(
        &self,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        enrollment_id: Uuid,
        outcome: StepOutcome,
    ) -> Result<ExecutionResult, EngineError> {
        let config = &self.inner.config;
        let now = self.now();
        let next_step_id = definition.next_step(&step.id).map(|s| s.id.clone());

        let result = self.inner.enrollments.update(enrollment_id, |e| {
            // A terminate may have landed while the step was in flight.
            let current = e.status.is_live() && e.current_step_id == step.id;
            let entry = |event, status, detail: String| ExecutionLogEntry::new(&step.id, event, status, detail, now);

            match outcome {
                StepOutcome::Done { detail } => {
                    e.log(entry(LogEvent::StepExecution, LogStatus::Success, detail));
                    if !current {
                        return ExecutionResult::Skipped(SkipReason::Interrupted(e.status));
                    }
                    finish_step(e, &step.id, next_step_id, now)
                }

                StepOutcome::DelayStarted { until } => {
                    e.log(entry(LogEvent::DelayStart, LogStatus::Pending, format!("waiting until {until}")));
                    if !current {
                        return ExecutionResult::Skipped(SkipReason::Interrupted(e.status));
                    }
                    e.wait_until(until, WaitReason::Delay);
                    ExecutionResult::Waiting { until }
                }

                StepOutcome::ConditionEvaluated { passed, detail } => {
                    let status = if passed { LogStatus::Success } else { LogStatus::Pending };
                    e.log(entry(LogEvent::ConditionEval, status, detail).with_condition_result(passed));
                    if !current {
                        return ExecutionResult::Skipped(SkipReason::Interrupted(e.status));
                    }
                    if passed {
                        return finish_step(e, &step.id, next_step_id, now);
                    }

                    e.condition_checks += 1;
                    if config.max_condition_checks.is_some_and(|max| e.condition_checks >= max) {
                        e.status = EnrollmentStatus::Terminated;
                        e.clear_wait();
                        e.log(entry(
                            LogEvent::Termination,
                            LogStatus::Success,
                            format!("condition never satisfied after {} checks", e.condition_checks),
                        ));
                        return ExecutionResult::Terminated;
                    }
                    let recheck_at = after(now, config.condition_recheck_interval);
                    e.wait_until(recheck_at, WaitReason::ConditionRecheck);
                    ExecutionResult::ConditionUnmet { recheck_at }
                }

                StepOutcome::Failed(error) => {
                    if !current {
                        e.log(entry(LogEvent::Failure, LogStatus::Failed, error.to_string()));
                        return ExecutionResult::Skipped(SkipReason::Interrupted(e.status));
                    }

                    e.attempts += 1;
                    let retry_at = (error.is_retryable() && e.attempts <= config.max_retries)
                        .then(|| after(now, config.retry_delay(e.attempts)));
                    let detail = match retry_at {
                        Some(at) => format!(
                            "{error}; attempt {}/{}, retrying at {at}",
                            e.attempts,
                            config.max_retries + 1
                        ),
                        None => {
                            e.status = EnrollmentStatus::Failed;
                            e.clear_wait();
                            format!("{error}; attempt {}, giving up", e.attempts)
                        }
                    };
                    if let Some(at) = retry_at {
                        e.wait_until(at, WaitReason::RetryBackoff);
                    }
                    e.log(entry(LogEvent::Failure, LogStatus::Failed, detail));
                    ExecutionResult::Failed { error, retry_at }
                }
            }
        })?;

        match &result {
            ExecutionResult::Completed => {
                self.inner.definitions.record_completion(&definition.id);
                info!(enrollment_id = %enrollment_id, workflow_id = %definition.id, "enrollment completed");
            }
            ExecutionResult::Failed { retry_at: None, error } => {
                warn!(enrollment_id = %enrollment_id, workflow_id = %definition.id, "enrollment failed: {error}");
            }
            _ => {}
        }
        Ok(result)
    }

    /// The enrollment points at a step its definition no longer has.
    fn fail_missing_step(&self, enrollment: &Enrollment) -> Result<ExecutionResult, EngineError> {
        let error = StepFailure::StepMissing(enrollment.current_step_id.clone());
        let now = self.now();
        self.inner.enrollments.update(enrollment.id, |e| {
            e.status = EnrollmentStatus::Failed;
            e.clear_wait();
            let step_id = e.current_step_id.clone();
            e.log(ExecutionLogEntry::new(step_id, LogEvent::Failure, LogStatus::Failed, error.to_string(), now));
        })?;
        Ok(ExecutionResult::Failed { error, retry_at: None })
    }
}

/// Move past `step_id`: on to the next step, or to `completed`.
fn finish_step(
    enrollment: &mut Enrollment,
    step_id: &str,
    next_step_id: Option<String>,
    now: DateTime<Utc>,
) -> ExecutionResult {
    match next_step_id {
        Some(next_step_id) => {
            enrollment.advance_to(&next_step_id, now);
            ExecutionResult::Advanced { next_step_id }
        }
        None => {
            enrollment.status = EnrollmentStatus::Completed;
            enrollment.last_step_completed_at = Some(now);
            enrollment.clear_wait();
            enrollment.log(ExecutionLogEntry::new(
                step_id,
                LogEvent::Completion,
                LogStatus::Success,
                "workflow completed",
                now,
            ));
            ExecutionResult::Completed
        }
    }
}
