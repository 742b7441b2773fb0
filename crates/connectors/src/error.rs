//! Connector-level error type.

use thiserror::Error;

/// Errors returned by a collaborator call.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Retryable`: the step is retried after a back-off delay.
/// - `Fatal`: the enrollment is failed without further attempts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// Transient failure (provider timeout, rate limit, ...).
    #[error("retryable connector error: {0}")]
    Retryable(String),

    /// Permanent failure; retrying will not help.
    #[error("fatal connector error: {0}")]
    Fatal(String),
}

impl ConnectorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
