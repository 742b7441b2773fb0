//! Integration tests for the automation engine.
//!
//! These tests run the engine against the in-memory collaborators from the
//! `connectors` crate and a `ManualClock`, so delays and back-off can be
//! crossed without waiting.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::Notify;
use uuid::Uuid;

use connectors::memory::{MemoryBackend, SendBehaviour};
use connectors::{ChannelSender, Collaborators, ConnectorError, MessageTemplate, SubjectRecord};

use crate::models::{StepKindSpec, WaitReason};
use crate::registry::DefinitionRegistry;
use crate::store::EnrollmentStore;
use crate::scheduler::MIN_INTERVAL;
use crate::{
    AutomationEngine, Clock, DefinitionSpec, DefinitionStatus, EngineConfig, EngineError, Enrolled,
    EnrollmentStatus, Event, EventEnrollment, ExecutionLogEntry, ExecutionResult, LogEvent,
    LogStatus, ManualClock, Scheduler, SkipReason, StepFailure, StepSpec,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

struct Harness {
    engine: AutomationEngine,
    backend: MemoryBackend,
    clock: Arc<ManualClock>,
}

fn seed(backend: &MemoryBackend) {
    let mut ada = SubjectRecord::new("S1", "Ada", "Lovelace");
    ada.email = Some("ada@example.com".into());
    ada.phone = Some("+15550100".into());
    ada.source = Some("zillow".into());
    ada.score = Some(40.0);
    ada.property_name = Some("Maple Court".into());
    backend.records.insert(ada);

    let mut bo = SubjectRecord::new("S2", "Bo", "Li");
    bo.email = Some("bo@example.com".into());
    backend.records.insert(bo);

    backend.templates.insert(MessageTemplate {
        id: "T1".into(),
        name: "welcome".into(),
        subject: "Welcome to {{property_name}}".into(),
        body: "Hi {{first_name}}, book a tour: {{schedule_tour_link}}".into(),
    });
    backend.templates.insert(MessageTemplate {
        id: "T2".into(),
        name: "nudge".into(),
        subject: String::new(),
        body: "{{first_name}}, still looking?".into(),
    });
}

fn harness_with(config: EngineConfig, backend: MemoryBackend, collaborators: Collaborators) -> Harness {
    seed(&backend);
    let clock = Arc::new(ManualClock::new(t0()));
    let engine = AutomationEngine::from_parts(
        config,
        collaborators,
        clock.clone(),
        Arc::new(DefinitionRegistry::new()),
        Arc::new(EnrollmentStore::new()),
    );
    Harness { engine, backend, clock }
}

fn harness(config: EngineConfig) -> Harness {
    let backend = MemoryBackend::new();
    let collaborators = backend.collaborators();
    harness_with(config, backend, collaborators)
}

fn step(id: &str, order: u32, kind: StepKindSpec) -> StepSpec {
    StepSpec {
        id: id.into(),
        order,
        kind,
        action: None,
        template_id: None,
        delay_hours: None,
        condition: None,
        config: Value::Null,
    }
}

fn action(id: &str, order: u32, name: &str, template: Option<&str>, config: Value) -> StepSpec {
    StepSpec {
        action: Some(name.into()),
        template_id: template.map(Into::into),
        config,
        ..step(id, order, StepKindSpec::Action)
    }
}

fn delay(id: &str, order: u32, hours: u32) -> StepSpec {
    StepSpec {
        delay_hours: Some(hours),
        ..step(id, order, StepKindSpec::Delay)
    }
}

fn condition(id: &str, order: u32, expression: &str) -> StepSpec {
    StepSpec {
        condition: Some(expression.into()),
        ..step(id, order, StepKindSpec::Condition)
    }
}

fn definition(id: &str, trigger: &str, steps: Vec<StepSpec>) -> DefinitionSpec {
    DefinitionSpec {
        id: id.into(),
        name: format!("{id} workflow"),
        trigger: trigger.into(),
        status: DefinitionStatus::Active,
        steps,
    }
}

/// [send-email(T1), delay(24h), send-sms(T2)]
fn auto_1() -> DefinitionSpec {
    definition(
        "AUTO_1",
        "lead_created",
        vec![
            action("s1", 1, "send-email", Some("T1"), Value::Null),
            delay("s2", 2, 24),
            action("s3", 3, "send-sms", Some("T2"), Value::Null),
        ],
    )
}

/// Enroll and wait for the first pass to finish.
async fn enroll(h: &Harness, definition_id: &str, subject_id: &str) -> Result<Uuid, EngineError> {
    let Enrolled { id, first_pass } = h.engine.enroll(definition_id, subject_id)?;
    let _ = first_pass.await.expect("first pass task");
    Ok(id)
}

/// Wait for the first pass of every enrollment an event created.
async fn settle(results: Vec<EventEnrollment>) -> Vec<Uuid> {
    let mut ids = Vec::new();
    for result in results {
        if let Ok(Enrolled { id, first_pass }) = result.outcome {
            first_pass.await.expect("first pass task").unwrap();
            ids.push(id);
        }
    }
    ids
}

fn events(history: &[ExecutionLogEntry]) -> Vec<LogEvent> {
    history.iter().map(|e| e.event).collect()
}

fn count(history: &[ExecutionLogEntry], event: LogEvent) -> usize {
    history.iter().filter(|e| e.event == event).count()
}

// ============================================================
// Enrollment
// ============================================================

#[tokio::test]
async fn enrolling_twice_while_live_is_rejected() {
    let h = harness(EngineConfig::default());
    h.engine.register_definition(auto_1()).unwrap();

    let first = enroll(&h, "AUTO_1", "S1").await.unwrap();
    let second = enroll(&h, "AUTO_1", "S1").await.unwrap_err();

    assert_eq!(
        second,
        EngineError::AlreadyEnrolled {
            definition_id: "AUTO_1".into(),
            subject_id: "S1".into(),
            enrollment_id: first,
        }
    );
    assert_eq!(h.engine.enrollments().len(), 1);
    let definition = h.engine.definition("AUTO_1").unwrap();
    assert_eq!(definition.enrolled_count, 1);
    assert_eq!(definition.created_at, t0(), "creation time comes from the engine clock");
}

#[tokio::test]
async fn enroll_rejects_unknown_inactive_and_empty_definitions() {
    let h = harness(EngineConfig::default());
    let mut draft = auto_1();
    draft.id = "DRAFT".into();
    draft.status = DefinitionStatus::Draft;
    h.engine.register_definition(draft).unwrap();
    h.engine
        .register_definition(definition("EMPTY", "lead_created", Vec::new()))
        .unwrap();

    assert_eq!(
        enroll(&h, "NOPE", "S1").await,
        Err(EngineError::UnknownDefinition("NOPE".into()))
    );
    assert!(matches!(
        enroll(&h, "DRAFT", "S1").await,
        Err(EngineError::DefinitionStatus { actual: DefinitionStatus::Draft, .. })
    ));
    assert_eq!(
        enroll(&h, "EMPTY", "S1").await,
        Err(EngineError::NoSteps("EMPTY".into()))
    );

    h.engine.activate("DRAFT").unwrap();
    assert!(enroll(&h, "DRAFT", "S1").await.is_ok());
    assert!(h.engine.activate("DRAFT").is_err());
}

// ============================================================
// Progression
// ============================================================

#[tokio::test]
async fn drip_sequence_runs_email_delay_sms_to_completion() {
    let h = harness(EngineConfig::default());
    h.engine.register_definition(auto_1()).unwrap();

    let id = enroll(&h, "AUTO_1", "S1").await.unwrap();

    // Step 1 ran immediately, then the delay started.
    let enrollment = h.engine.enrollment(id).unwrap();
    assert_eq!(
        events(&enrollment.history),
        vec![LogEvent::Enrollment, LogEvent::StepExecution, LogEvent::DelayStart]
    );
    assert_eq!(enrollment.history[1].status, LogStatus::Success);
    assert_eq!(enrollment.current_step_id, "s2");
    assert_eq!(enrollment.next_step_due_at, Some(t0() + Duration::hours(24)));
    assert_eq!(enrollment.wait, Some(WaitReason::Delay));

    let sent = h.backend.sender.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "ada@example.com");
    assert_eq!(sent[0].subject.as_deref(), Some("Welcome to Maple Court"));
    assert_eq!(
        sent[0].body,
        "Hi Ada, book a tour: https://portal.example.com/tours/new?lead=S1"
    );

    // Before the delay is due a scan does nothing.
    h.clock.advance(Duration::hours(23));
    let report = h.engine.run_due().await;
    assert_eq!(report.examined, 0);
    assert_eq!(h.engine.history(id).unwrap().len(), 3);

    // After it, the scan finishes the delay, sends the SMS and completes.
    h.clock.advance(Duration::hours(2));
    let report = h.engine.run_due().await;
    assert_eq!(report.examined, 1);
    assert_eq!(report.completed, 1);

    let enrollment = h.engine.enrollment(id).unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    assert_eq!(
        events(&enrollment.history[3..]),
        vec![LogEvent::StepExecution, LogEvent::StepExecution, LogEvent::Completion]
    );
    assert_eq!(h.backend.sender.sent()[1].body, "Ada, still looking?");

    let interactions = h.backend.interactions.for_subject("S1");
    assert_eq!(interactions.len(), 2);
    assert!(interactions.iter().all(|i| i.delivered && i.workflow_id == "AUTO_1"));
}

#[tokio::test]
async fn execute_step_is_a_no_op_until_due() {
    let h = harness(EngineConfig::default());
    h.engine.register_definition(auto_1()).unwrap();
    let id = enroll(&h, "AUTO_1", "S1").await.unwrap();
    let before = h.engine.enrollment(id).unwrap();

    for _ in 0..3 {
        let result = h.engine.execute_step(id).await.unwrap();
        assert_eq!(
            result,
            ExecutionResult::Skipped(SkipReason::NotDue(t0() + Duration::hours(24)))
        );
    }

    assert_eq!(h.engine.enrollment(id).unwrap(), before);
    assert_eq!(h.backend.sender.call_count(), 1);
}

#[tokio::test]
async fn completion_is_counted_exactly_once() {
    let h = harness(EngineConfig::default());
    h.engine.register_definition(auto_1()).unwrap();
    let id = enroll(&h, "AUTO_1", "S1").await.unwrap();

    h.clock.advance(Duration::hours(30));
    h.engine.run_due().await;
    h.engine.run_due().await;
    assert_eq!(
        h.engine.execute_step(id).await.unwrap(),
        ExecutionResult::Skipped(SkipReason::NotActive(EnrollmentStatus::Completed))
    );

    let definition = h.engine.definition("AUTO_1").unwrap();
    assert_eq!(definition.completed_count, 1);
    assert_eq!(count(&h.engine.history(id).unwrap(), LogEvent::Completion), 1);

    // The pair is free again once the first enrollment completed.
    assert!(enroll(&h, "AUTO_1", "S1").await.is_ok());
}

// ============================================================
// Conditions
// ============================================================

#[tokio::test]
async fn false_condition_holds_the_enrollment_at_its_step() {
    let h = harness(EngineConfig::default());
    h.engine
        .register_definition(definition(
            "HOT",
            "lead_created",
            vec![
                condition("gate", 1, "score >= 50"),
                action("mail", 2, "send-email", Some("T1"), Value::Null),
            ],
        ))
        .unwrap();

    let id = enroll(&h, "HOT", "S1").await.unwrap();
    let enrollment = h.engine.enrollment(id).unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Active);
    assert_eq!(enrollment.current_step_id, "gate");
    let evals: Vec<&ExecutionLogEntry> = enrollment
        .history
        .iter()
        .filter(|e| e.event == LogEvent::ConditionEval)
        .collect();
    assert_eq!(evals.len(), 1);
    assert_eq!(evals[0].condition_result, Some(false));

    // Re-entry before the re-check is due changes nothing.
    assert!(matches!(
        h.engine.execute_step(id).await.unwrap(),
        ExecutionResult::Skipped(SkipReason::NotDue(_))
    ));
    assert_eq!(count(&h.engine.history(id).unwrap(), LogEvent::ConditionEval), 1);

    // One more evaluation per re-check.
    h.clock.advance(Duration::hours(1));
    h.engine.run_due().await;
    assert_eq!(count(&h.engine.history(id).unwrap(), LogEvent::ConditionEval), 2);

    // Once the score qualifies the chain continues.
    let mut ada = h.backend.records.get("S1").unwrap();
    ada.score = Some(65.0);
    h.backend.records.insert(ada);
    h.clock.advance(Duration::hours(1));
    h.engine.run_due().await;

    let enrollment = h.engine.enrollment(id).unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    let last_eval = enrollment
        .history
        .iter()
        .rev()
        .find(|e| e.event == LogEvent::ConditionEval)
        .unwrap();
    assert_eq!(last_eval.condition_result, Some(true));
    assert_eq!(h.backend.sender.call_count(), 1);
}

#[tokio::test]
async fn condition_that_never_passes_is_terminated_after_the_cap() {
    let config = EngineConfig {
        max_condition_checks: Some(2),
        ..EngineConfig::default()
    };
    let h = harness(config);
    h.engine
        .register_definition(definition(
            "REPLY",
            "lead_created",
            vec![
                condition("gate", 1, "replied = true"),
                action("task", 2, "create-task", None, Value::Null),
            ],
        ))
        .unwrap();

    let id = enroll(&h, "REPLY", "S1").await.unwrap();
    h.clock.advance(Duration::hours(1));
    h.engine.run_due().await;

    let enrollment = h.engine.enrollment(id).unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Terminated);
    assert_eq!(count(&enrollment.history, LogEvent::ConditionEval), 2);
    assert_eq!(enrollment.history.last().unwrap().event, LogEvent::Termination);
}

#[tokio::test]
async fn malformed_condition_fails_closed() {
    let h = harness(EngineConfig::default());
    h.engine
        .register_definition(definition(
            "BROKEN",
            "lead_created",
            vec![
                condition("gate", 1, "score !~ 5"),
                action("task", 2, "create-task", None, Value::Null),
            ],
        ))
        .unwrap();

    let id = enroll(&h, "BROKEN", "S1").await.unwrap();
    let enrollment = h.engine.enrollment(id).unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Active);
    assert_eq!(enrollment.current_step_id, "gate");
    assert_eq!(enrollment.history.last().unwrap().condition_result, Some(false));
}

// ============================================================
// Failures and retries
// ============================================================

#[tokio::test]
async fn failed_send_backs_off_then_fails_and_can_be_retried() {
    let h = harness(EngineConfig::default());
    h.backend
        .sender
        .set_behaviour(SendBehaviour::FailRetryable("provider timeout".into()));
    h.engine.register_definition(auto_1()).unwrap();

    let id = enroll(&h, "AUTO_1", "S1").await.unwrap();
    let enrollment = h.engine.enrollment(id).unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Active);
    assert_eq!(enrollment.attempts, 1);
    assert_eq!(enrollment.next_step_due_at, Some(t0() + Duration::minutes(5)));
    assert_eq!(enrollment.history.last().unwrap().event, LogEvent::Failure);

    // No retry on every tick: nothing happens until the back-off passes.
    assert_eq!(h.engine.run_due().await.examined, 0);

    for backoff in [5, 10, 20] {
        h.clock.advance(Duration::minutes(backoff));
        let report = h.engine.run_due().await;
        assert_eq!(report.failed, 1);
    }

    let enrollment = h.engine.enrollment(id).unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Failed);
    assert_eq!(enrollment.next_step_due_at, None);
    assert_eq!(count(&enrollment.history, LogEvent::Failure), 4);
    assert_eq!(h.backend.sender.call_count(), 4);
    assert!(h.backend.interactions.for_subject("S1").iter().all(|i| !i.delivered));

    // A manual retry revives it.
    h.backend.sender.set_behaviour(SendBehaviour::Deliver);
    let result = h.engine.retry_step(id).await.unwrap();
    assert!(matches!(result, ExecutionResult::Waiting { .. }));

    let enrollment = h.engine.enrollment(id).unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Active);
    assert_eq!(enrollment.current_step_id, "s2");
    assert_eq!(count(&enrollment.history, LogEvent::Retry), 1);

    // Nothing left to retry while a plain delay is pending.
    assert_eq!(h.engine.retry_step(id).await, Err(EngineError::NothingToRetry(id)));
}

#[tokio::test]
async fn missing_template_sends_nothing() {
    let h = harness(EngineConfig::default());
    h.engine
        .register_definition(definition(
            "GHOST",
            "lead_created",
            vec![action("mail", 1, "send-email", Some("T404"), Value::Null)],
        ))
        .unwrap();

    let id = enroll(&h, "GHOST", "S1").await.unwrap();
    let history = h.engine.history(id).unwrap();
    let failure = history.last().unwrap();
    assert_eq!(failure.event, LogEvent::Failure);
    assert_eq!(failure.status, LogStatus::Failed);
    assert!(failure.detail.contains("T404"));

    assert_eq!(h.backend.sender.call_count(), 0);
    assert!(h.backend.interactions.for_subject("S1").is_empty());
    assert_eq!(h.engine.enrollment(id).unwrap().status, EnrollmentStatus::Active);
}

#[tokio::test]
async fn missing_contact_address_fails_without_retry() {
    let h = harness(EngineConfig::default());
    h.engine
        .register_definition(definition(
            "TEXT",
            "lead_created",
            vec![action("sms", 1, "send-sms", Some("T2"), Value::Null)],
        ))
        .unwrap();

    let id = enroll(&h, "TEXT", "S2").await.unwrap();
    let enrollment = h.engine.enrollment(id).unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Failed);
    assert_eq!(enrollment.attempts, 1);
    assert_eq!(h.backend.sender.call_count(), 0);
}

#[tokio::test]
async fn assign_owner_uses_explicit_user_then_team_default() {
    let config = EngineConfig {
        default_owner_id: Some("team-lead".into()),
        ..EngineConfig::default()
    };
    let h = harness(config);
    h.engine
        .register_definition(definition(
            "ROUTE",
            "lead_created",
            vec![
                action("direct", 1, "assign-owner", None, json!({ "user_id": "u7" })),
                action("tag", 2, "add-tag", None, json!({ "tag": "routed" })),
                action("team", 3, "assign-owner", None, Value::Null),
            ],
        ))
        .unwrap();

    let id = enroll(&h, "ROUTE", "S1").await.unwrap();
    assert_eq!(h.engine.enrollment(id).unwrap().status, EnrollmentStatus::Completed);

    let owners: Vec<Option<String>> = h
        .backend
        .records
        .updates()
        .into_iter()
        .map(|(_, patch)| patch.owner_id)
        .collect();
    assert_eq!(owners, vec![Some("u7".to_string()), Some("team-lead".to_string())]);
    assert_eq!(
        h.backend.records.get("S1").unwrap().owner_id.as_deref(),
        Some("team-lead")
    );
}

#[tokio::test]
async fn team_default_without_configured_owner_fails() {
    let h = harness(EngineConfig::default());
    h.engine
        .register_definition(definition(
            "ROUTE",
            "lead_created",
            vec![action("team", 1, "assign-owner", None, Value::Null)],
        ))
        .unwrap();

    let id = enroll(&h, "ROUTE", "S1").await.unwrap();
    let result = h.engine.retry_step(id).await;
    assert!(result.is_ok(), "failed enrollments can be retried: {result:?}");
    assert_eq!(
        result.unwrap(),
        ExecutionResult::Failed { error: StepFailure::NoOwnerAvailable, retry_at: None }
    );
}

// ============================================================
// Manual controls
// ============================================================

#[tokio::test]
async fn pause_freezes_and_resume_continues_immediately() {
    let h = harness(EngineConfig::default());
    h.engine.register_definition(auto_1()).unwrap();
    let id = enroll(&h, "AUTO_1", "S1").await.unwrap();
    let logged = h.engine.history(id).unwrap().len();

    assert_eq!(h.engine.pause("AUTO_1").unwrap(), 1);
    assert_eq!(h.engine.enrollment(id).unwrap().status, EnrollmentStatus::Paused);
    assert!(matches!(
        enroll(&h, "AUTO_1", "S2").await,
        Err(EngineError::DefinitionStatus { actual: DefinitionStatus::Paused, .. })
    ));

    h.clock.advance(Duration::hours(25));
    assert_eq!(h.engine.run_due().await.examined, 0);
    assert_eq!(
        h.engine.execute_step(id).await.unwrap(),
        ExecutionResult::Skipped(SkipReason::NotActive(EnrollmentStatus::Paused))
    );
    assert_eq!(h.engine.history(id).unwrap().len(), logged);

    let passes = h.engine.resume("AUTO_1").unwrap();
    assert_eq!(passes.len(), 1);
    for pass in passes {
        pass.await.unwrap().unwrap();
    }
    let enrollment = h.engine.enrollment(id).unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    assert!(enrollment.history.len() > logged);

    assert!(h.engine.resume("AUTO_1").is_err());
}

#[tokio::test]
async fn terminate_closes_the_enrollment_for_good() {
    let h = harness(EngineConfig::default());
    h.engine.register_definition(auto_1()).unwrap();
    let id = enroll(&h, "AUTO_1", "S1").await.unwrap();

    h.engine.terminate(id, "manual").unwrap();

    let enrollment = h.engine.enrollment(id).unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Terminated);
    assert_eq!(enrollment.next_step_due_at, None);
    let terminations: Vec<&ExecutionLogEntry> = enrollment
        .history
        .iter()
        .filter(|e| e.event == LogEvent::Termination)
        .collect();
    assert_eq!(terminations.len(), 1);
    assert_eq!(terminations[0].detail, "manual");

    h.clock.advance(Duration::hours(48));
    assert_eq!(
        h.engine.execute_step(id).await.unwrap(),
        ExecutionResult::Skipped(SkipReason::NotActive(EnrollmentStatus::Terminated))
    );
    assert_eq!(h.engine.history(id).unwrap().len(), enrollment.history.len());

    assert_eq!(
        h.engine.terminate(id, "again"),
        Err(EngineError::EnrollmentClosed { id, status: EnrollmentStatus::Terminated })
    );
    assert!(enroll(&h, "AUTO_1", "S1").await.is_ok());
}

/// Holds every send until released, so a step can be observed in flight.
struct GatedSender {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl ChannelSender for GatedSender {
    async fn send_email(&self, _to: &str, _subject: &str, _body: &str) -> Result<(), ConnectorError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }

    async fn send_sms(&self, _to: &str, _body: &str) -> Result<(), ConnectorError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

#[tokio::test]
async fn terminate_wins_over_a_step_in_flight() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let backend = MemoryBackend::new();
    let collaborators = Collaborators {
        sender: Arc::new(GatedSender {
            entered: entered.clone(),
            release: release.clone(),
        }),
        ..backend.collaborators()
    };
    let h = harness_with(EngineConfig::default(), backend, collaborators);
    h.engine.register_definition(auto_1()).unwrap();

    let enrolled = h.engine.enroll("AUTO_1", "S1").unwrap();
    let id = enrolled.id;
    entered.notified().await;

    assert_eq!(
        h.engine.execute_step(id).await.unwrap(),
        ExecutionResult::Skipped(SkipReason::InFlight)
    );
    h.engine.terminate(id, "unsubscribed").unwrap();
    release.notify_one();
    assert_eq!(
        enrolled.first_pass.await.unwrap(),
        Ok(ExecutionResult::Skipped(SkipReason::Interrupted(EnrollmentStatus::Terminated)))
    );

    let enrollment = h.engine.enrollment(id).unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Terminated);
    assert_eq!(enrollment.current_step_id, "s1");
    assert_eq!(
        events(&enrollment.history),
        vec![LogEvent::Enrollment, LogEvent::Termination, LogEvent::StepExecution]
    );
    assert_eq!(h.engine.definition("AUTO_1").unwrap().completed_count, 0);
}

// ============================================================
// Events
// ============================================================

#[tokio::test]
async fn events_enroll_matching_definitions_once() {
    let h = harness(EngineConfig::default());
    h.engine
        .register_definition(definition(
            "NURTURE",
            "lead_created",
            vec![delay("wait", 1, 2), action("task", 2, "create-task", None, json!({ "title": "Call" }))],
        ))
        .unwrap();
    h.engine
        .register_definition(definition(
            "WEB",
            "lead_created where source = website",
            vec![action("task", 1, "create-task", None, Value::Null)],
        ))
        .unwrap();
    h.engine
        .register_definition(definition(
            "ZILLOW",
            "lead_created where source = zillow and score >= 30",
            vec![action("task", 1, "create-task", None, Value::Null)],
        ))
        .unwrap();
    h.engine
        .register_definition(definition(
            "MOVE_IN",
            "move_in_completed",
            vec![action("mail", 1, "send-email", Some("T1"), Value::Null)],
        ))
        .unwrap();

    let event = Event::lead_created("S1", Some("zillow")).with_metadata("campaign", json!("spring"));
    let first = h.engine.handle_event(&event).await;
    let matched: Vec<&str> = first.iter().map(|r| r.definition_id.as_str()).collect();
    assert_eq!(matched, vec!["NURTURE", "ZILLOW"]);
    assert!(first.iter().all(|r| r.outcome.is_ok()));

    let ids = settle(first).await;
    assert_eq!(
        h.engine.history(ids[0]).unwrap()[0].detail,
        r#"enrolled in 'NURTURE workflow' by lead_created:zillow {"campaign":"spring"}"#
    );

    let again = h.engine.on_lead_created("S1", Some("zillow")).await;
    assert!(matches!(again[0].outcome, Err(EngineError::AlreadyEnrolled { .. })));
    assert!(again[1].outcome.is_ok(), "completed enrollments free the pair");
    settle(again).await;

    assert!(h.engine.on_tour_completed("S1").await.is_empty());
    let moved_in = h.engine.on_move_in_completed("S1").await;
    assert_eq!(moved_in.len(), 1);
    settle(moved_in).await;
    assert_eq!(h.engine.enrollments_for("MOVE_IN")[0].status, EnrollmentStatus::Completed);
}

// ============================================================
// Scheduler
// ============================================================

#[tokio::test(start_paused = true)]
async fn scheduler_drives_due_enrollments_and_stops_cleanly() {
    let h = harness(EngineConfig::default());
    h.engine.register_definition(auto_1()).unwrap();
    let id = enroll(&h, "AUTO_1", "S1").await.unwrap();
    h.clock.advance(Duration::hours(24));
    assert_eq!(h.clock.now(), t0() + Duration::hours(24));

    let scheduler = Scheduler::with_interval(h.engine.clone(), StdDuration::from_millis(10));
    assert!(scheduler.start());
    assert!(!scheduler.start());
    assert!(scheduler.is_running());

    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert_eq!(h.engine.enrollment(id).unwrap().status, EnrollmentStatus::Completed);

    assert!(scheduler.stop().await);
    assert!(!scheduler.stop().await);
    assert!(!scheduler.is_running());
}

/// Never finishes a send to `stuck_on`; everything else is delivered.
struct StuckSender {
    stuck_on: &'static str,
    inner: Arc<dyn ChannelSender>,
}

#[async_trait]
impl ChannelSender for StuckSender {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), ConnectorError> {
        if to == self.stuck_on {
            std::future::pending::<()>().await;
        }
        self.inner.send_email(to, subject, body).await
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<(), ConnectorError> {
        self.inner.send_sms(to, body).await
    }
}

#[tokio::test(start_paused = true)]
async fn a_stuck_send_holds_up_only_its_own_enrollment() {
    let backend = MemoryBackend::new();
    let recording = backend.collaborators();
    let collaborators = Collaborators {
        sender: Arc::new(StuckSender {
            stuck_on: "ada@example.com",
            inner: recording.sender.clone(),
        }),
        ..recording
    };
    let h = harness_with(EngineConfig::default(), backend, collaborators);
    h.engine
        .register_definition(definition(
            "LATER",
            "lead_created",
            vec![delay("wait", 1, 1), action("mail", 2, "send-email", Some("T1"), Value::Null)],
        ))
        .unwrap();
    let ada = enroll(&h, "LATER", "S1").await.unwrap();
    let bo = enroll(&h, "LATER", "S2").await.unwrap();
    h.clock.advance(Duration::hours(2));

    let scheduler = Scheduler::with_interval(h.engine.clone(), StdDuration::from_millis(10));
    assert!(scheduler.start());
    tokio::time::sleep(StdDuration::from_millis(200)).await;

    assert_eq!(h.engine.enrollment(bo).unwrap().status, EnrollmentStatus::Completed);
    let sent = h.backend.sender.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "bo@example.com");

    let stuck = h.engine.enrollment(ada).unwrap();
    assert_eq!(stuck.status, EnrollmentStatus::Active);
    assert_eq!(stuck.current_step_id, "mail");
    assert_eq!(count(&stuck.history, LogEvent::StepExecution), 1);

    let stopped = tokio::time::timeout(StdDuration::from_secs(5), scheduler.stop()).await;
    assert!(matches!(stopped, Ok(true)), "stop must not wait on the stuck send");
    assert!(!scheduler.is_running());
}

#[tokio::test(start_paused = true)]
async fn zero_tick_interval_is_raised_to_the_minimum() {
    let config = EngineConfig {
        tick_interval: StdDuration::ZERO,
        ..EngineConfig::default()
    };
    let h = harness(config);
    h.engine.register_definition(auto_1()).unwrap();
    let id = enroll(&h, "AUTO_1", "S1").await.unwrap();
    h.clock.advance(Duration::hours(25));

    let scheduler = Scheduler::new(h.engine.clone());
    assert_eq!(scheduler.interval(), MIN_INTERVAL);
    assert!(scheduler.start());
    tokio::time::sleep(StdDuration::from_millis(20)).await;

    assert_eq!(h.engine.enrollment(id).unwrap().status, EnrollmentStatus::Completed);
    assert!(scheduler.stop().await);
}
