//! Error taxonomy.
//!
//! Only [`RunError`] is meant to reach an operator. Request failures and
//! invariant redirects are recorded as data on [`crate::RequestOutcome`], and
//! session errors end a single virtual user without affecting the run.

use std::time::Duration;

use thiserror::Error;

use crate::metric::{ResourceType, TaskKind};

/// Failure talking to the target API.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Connection refused, DNS failure, timeout and similar.
    #[error("transport error: {0}")]
    Transport(String),

    /// The target answered with a status the caller cannot proceed with.
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// The target answered but the body could not be decoded.
    #[error("malformed response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The initial credential exchange failed; the virtual user never starts.
    #[error("session startup failed: {0}")]
    Startup(#[source] ApiError),

    /// A token refresh failed; the session is terminated.
    #[error("session expired: {0}")]
    Expired(#[source] ApiError),

    #[error("session terminated")]
    Terminated,
}

/// A scenario could not be started at all.
#[derive(Debug, Clone, Error)]
pub enum RunError {
    #[error("target unreachable after {attempts} attempt(s): {source}")]
    Unreachable {
        attempts: u32,
        #[source]
        source: ApiError,
    },

    #[error("run setup failed: {0}")]
    Setup(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CatalogError {
    #[error("task '{task}' has invalid weight {weight}")]
    InvalidWeight { task: &'static str, weight: f64 },

    #[error("kind group weight for {0} is invalid")]
    InvalidKindWeight(TaskKind),

    #[error("kind group {0} has a positive weight but no tasks")]
    EmptyKindGroup(TaskKind),

    #[error("no read task for {0}, required as fallback")]
    MissingReadFallback(ResourceType),

    #[error("no task can be selected")]
    NothingSelectable,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProfileError {
    #[error("unknown scenario '{0}', expected one of light, medium, heavy, stress")]
    UnknownScenario(String),

    #[error("virtual user count must be positive")]
    NoUsers,

    #[error("spawn rate must be positive and finite, got {0}")]
    InvalidSpawnRate(f64),

    #[error("duration must be positive, got {0:?}")]
    InvalidDuration(Duration),

    #[error("invalid duration '{0}', expected e.g. 300, 45s, 5m, 1h30m")]
    UnparsableDuration(String),

    #[error("custom scenario needs --users, --spawn-rate and --duration")]
    IncompleteCustom,
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to write csv artifact: {0}")]
    Csv(#[from] csv::Error),

    #[error("artifact writer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("think time range {min:?}..={max:?} is empty")]
    InvalidThinkTime { min: Duration, max: Duration },

    #[error("outcome channel capacity must be positive")]
    ZeroChannelCapacity,
}
