//! Engine tuning knobs.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Tuning knobs for the engine and its scheduler.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the scheduler scans for due enrollments.
    pub tick_interval: Duration,
    /// Failed attempts at one action step before the enrollment is failed.
    pub max_retries: u32,
    /// Base delay for exponential back-off between attempts.
    pub retry_base_delay: Duration,
    /// Upper bound for a single back-off delay.
    pub retry_max_delay: Duration,
    /// Wait before re-evaluating a condition that was false.
    pub condition_recheck_interval: Duration,
    /// False evaluations after which the enrollment is terminated.
    /// `None` re-checks forever.
    pub max_condition_checks: Option<u32>,
    /// Owner for `assign-owner` steps configured with the team default.
    pub default_owner_id: Option<String>,
    /// Root of the links derived into template tokens.
    pub portal_base_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(5 * 60),
            retry_max_delay: Duration::from_secs(6 * 60 * 60),
            condition_recheck_interval: Duration::from_secs(60 * 60),
            max_condition_checks: Some(72),
            default_owner_id: None,
            portal_base_url: "https://portal.example.com".to_string(),
        }
    }
}

impl EngineConfig {
    /// Back-off before retry number `attempt` (1-based), capped at
    /// `retry_max_delay`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

/// `now + duration`, saturating at the latest representable timestamp.
pub(crate) fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
