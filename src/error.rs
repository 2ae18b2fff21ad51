//! Errors that end a single step on a single host.
//!
//! Loading suites and configuration files uses [anyhow] instead; those errors stop the program
//! before any host is contacted.

use crate::run_suite::result::Outcome;
use std::time::Duration;
use thiserror::Error;

/// Why a step did not pass on a host.
///
/// None of these abort the suite. They decide the step's [Outcome], and a [StepError::Connection]
/// additionally keeps the rest of the scenario away from the host.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum StepError {
    /// The host could not be reached, or the connection broke while a command was running.
    #[error("failed to reach {host}: {message}")]
    Connection { host: String, message: String },

    /// A command ran longer than the configured ceiling.
    #[error("command on {host} timed out after {after:?}")]
    Timeout { host: String, after: Duration },

    /// The command ran, but its exit code, changes, or output were not what the step expected.
    #[error("{0}")]
    Assertion(String),

    /// A retried check never passed. Holds the error from the final attempt.
    #[error("gave up after {attempts} attempts over {waited:?}: {last}")]
    RetryExhausted {
        attempts: u32,
        waited: Duration,
        last: Box<StepError>,
    },

    /// The run was cancelled before or while the step ran.
    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    /// The outcome a step receives when it ends with this error.
    ///
    /// Assertions are test failures. Everything else is an infrastructure fault. Exhausted retries
    /// take the outcome of their last attempt.
    pub fn outcome(&self) -> Outcome {
        match self {
            StepError::Assertion(_) => Outcome::Failed,
            StepError::RetryExhausted { last, .. } => last.outcome(),
            StepError::Connection { .. } | StepError::Timeout { .. } | StepError::Cancelled => {
                Outcome::Errored
            }
        }
    }

    /// Whether the host should be considered unreachable for the rest of the scenario.
    pub fn lost_connection(&self) -> bool {
        match self {
            StepError::Connection { .. } => true,
            StepError::RetryExhausted { last, .. } => last.lost_connection(),
            _ => false,
        }
    }
}
