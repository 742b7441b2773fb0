//! `drip` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: load workflow definitions and print their step plans.
//! - `simulate`: run definitions against an in-memory fixture on a simulated clock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use connectors::memory::MemoryBackend;
use connectors::{MessageTemplate, SubjectRecord};
use engine::models::StepKind;
use engine::registry::DefinitionRegistry;
use engine::store::EnrollmentStore;
use engine::{
    AutomationEngine, Condition, DefinitionSpec, EngineConfig, Event, ManualClock, Trigger,
    WorkflowDefinition,
};

#[derive(Parser)]
#[command(name = "drip", about = "Marketing drip-automation engine", version)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Command,
}

/// Engine settings. Unset flags keep the engine defaults.
#[derive(Args)]
struct ConfigArgs {
    /// Failed attempts at one step before the enrollment is failed.
    #[arg(long, global = true, env = "DRIP_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Base retry back-off, in seconds.
    #[arg(long, global = true, env = "DRIP_RETRY_BASE_SECS")]
    retry_base_secs: Option<u64>,

    /// Cap on a single retry back-off, in seconds.
    #[arg(long, global = true, env = "DRIP_RETRY_MAX_SECS")]
    retry_max_secs: Option<u64>,

    /// Hours between re-checks of a false condition.
    #[arg(long, global = true, env = "DRIP_RECHECK_HOURS")]
    recheck_hours: Option<u64>,

    /// False condition checks before termination; 0 re-checks forever.
    #[arg(long, global = true, env = "DRIP_MAX_CONDITION_CHECKS")]
    max_condition_checks: Option<u32>,

    /// Owner used by `assign-owner` steps without an explicit user.
    #[arg(long, global = true, env = "DRIP_DEFAULT_OWNER")]
    default_owner: Option<String>,

    /// Base URL for generated portal links.
    #[arg(long, global = true, env = "DRIP_PORTAL_URL")]
    portal_url: Option<String>,
}

impl ConfigArgs {
    fn into_config(self) -> EngineConfig {
        let mut config = EngineConfig::default();
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        if let Some(secs) = self.retry_base_secs {
            config.retry_base_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = self.retry_max_secs {
            config.retry_max_delay = Duration::from_secs(secs);
        }
        if let Some(hours) = self.recheck_hours {
            config.condition_recheck_interval = Duration::from_secs(hours.saturating_mul(3600));
        }
        if let Some(n) = self.max_condition_checks {
            config.max_condition_checks = (n > 0).then_some(n);
        }
        if self.default_owner.is_some() {
            config.default_owner_id = self.default_owner;
        }
        if let Some(url) = self.portal_url {
            config.portal_base_url = url.trim_end_matches('/').to_owned();
        }
        config
    }
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition file (one definition or an array).
    Validate {
        /// Path to the definition JSON file.
        path: PathBuf,
    },
    /// Fire an event against a fixture and step a simulated clock forward.
    Simulate {
        /// Fixture JSON with `definitions`, `subjects` and `templates`.
        fixture: PathBuf,

        /// Event name, e.g. `lead_created` or `lead_created:zillow`.
        #[arg(long)]
        event: String,

        /// Subject the event is about.
        #[arg(long)]
        subject: String,

        /// Scheduler scans to run after the event.
        #[arg(long, default_value_t = 48)]
        ticks: u32,

        /// Simulated hours between scans.
        #[arg(long, default_value_t = 1)]
        tick_hours: u32,
    },
}

/// Seed data for `simulate`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Fixture {
    definitions: Vec<DefinitionSpec>,
    subjects: Vec<SubjectRecord>,
    templates: Vec<MessageTemplate>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.config.into_config();

    match cli.command {
        Command::Validate { path } => validate(&path),
        Command::Simulate {
            fixture,
            event,
            subject,
            ticks,
            tick_hours,
        } => simulate(config, &fixture, &event, &subject, ticks, tick_hours).await,
    }
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn read_specs(path: &Path) -> Result<Vec<DefinitionSpec>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))?;
    let specs = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(specs)
}

fn validate(path: &Path) -> Result<()> {
    let mut rejected = 0;
    for spec in read_specs(path)? {
        let id = spec.id.clone();
        match WorkflowDefinition::from_spec(spec, Utc::now()) {
            Ok(definition) => print_plan(&definition),
            Err(e) => {
                rejected += 1;
                println!("{id}: rejected: {e}");
            }
        }
    }
    if rejected > 0 {
        bail!("{rejected} definition(s) rejected");
    }
    Ok(())
}

fn print_plan(definition: &WorkflowDefinition) {
    println!(
        "{} ({}) [{}] trigger '{}'",
        definition.id,
        definition.name,
        definition.status,
        definition.trigger.expression()
    );
    if let Trigger::Malformed { reason, .. } = &definition.trigger {
        println!("  warning: trigger never matches: {reason}");
    }
    for step in &definition.steps {
        println!("  {}. {} {}", step.order, step.id, step.describe());
        if let StepKind::Condition(Condition::Malformed { reason, .. }) = &step.kind {
            println!("     warning: condition never passes: {reason}");
        }
    }
}

// ---------------------------------------------------------------------------
// simulate
// ---------------------------------------------------------------------------

async fn simulate(
    config: EngineConfig,
    fixture_path: &Path,
    event: &str,
    subject: &str,
    ticks: u32,
    tick_hours: u32,
) -> Result<()> {
    let content = std::fs::read_to_string(fixture_path)
        .with_context(|| format!("cannot read file {}", fixture_path.display()))?;
    let fixture: Fixture = serde_json::from_str(&content)
        .with_context(|| format!("invalid fixture {}", fixture_path.display()))?;

    let backend = MemoryBackend::new();
    for record in fixture.subjects {
        backend.records.insert(record);
    }
    for template in fixture.templates {
        backend.templates.insert(template);
    }

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = AutomationEngine::from_parts(
        config,
        backend.collaborators(),
        clock.clone(),
        Arc::new(DefinitionRegistry::new()),
        Arc::new(EnrollmentStore::new()),
    );
    for spec in fixture.definitions {
        let id = spec.id.clone();
        engine
            .register_definition(spec)
            .with_context(|| format!("definition '{id}' rejected"))?;
    }

    for result in engine.handle_event(&Event::new(event, subject)).await {
        match result.outcome {
            Ok(enrolled) => {
                info!(workflow_id = %result.definition_id, enrollment_id = %enrolled.id, "enrolled");
                if let Err(e) = enrolled.first_pass.await? {
                    warn!(workflow_id = %result.definition_id, "first pass failed: {e}");
                }
            }
            Err(e) => warn!(workflow_id = %result.definition_id, "not enrolled: {e}"),
        }
    }

    let step = chrono::Duration::hours(i64::from(tick_hours));
    for tick in 1..=ticks {
        clock.advance(step);
        let report = engine.run_due().await;
        if report.examined > 0 {
            info!(tick, now = %engine.now(), ?report, "scan");
        }
    }

    for message in backend.sender.sent() {
        println!("sent {} to {}: {}", message.channel, message.to, message.body);
    }
    println!("{}", serde_json::to_string_pretty(&engine.enrollments())?);
    Ok(())
}
