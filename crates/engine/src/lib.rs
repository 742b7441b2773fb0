//! `engine` crate: the drip-automation core: definitions, trigger matching,
//! enrollment state, step execution and the scheduler loop.

pub mod clock;
pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod models;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod template;
pub mod trigger;

pub use clock::{Clock, ManualClock, SystemClock};
pub use condition::{Compiled, Condition, ConditionRule};
pub use config::EngineConfig;
pub use engine::{AutomationEngine, Enrolled, EventEnrollment, PassResult, ScanReport};
pub use error::{EngineError, StepFailure};
pub use executor::{ExecutionResult, SkipReason};
pub use models::{
    DefinitionSpec, DefinitionStatus, Enrollment, EnrollmentStatus, ExecutionLogEntry, LogEvent,
    LogStatus, StepSpec, WorkflowDefinition, WorkflowStep,
};
pub use scheduler::Scheduler;
pub use trigger::{Event, Trigger};

#[cfg(test)]
mod executor_tests;
