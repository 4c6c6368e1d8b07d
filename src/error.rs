use thiserror::Error;

/// Result alias for operations that surface a caller-facing error.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Presentation class of an error, independent of its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The request itself cannot be honoured as issued.
    BadRequest,
    /// The request was valid but the system failed to carry it out.
    Internal,
}

impl Severity {
    pub fn http_status(self) -> u16 {
        match self {
            Severity::BadRequest => 400,
            Severity::Internal => 500,
        }
    }
}

/// Errors returned by the lifecycle manager and its collaborators.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{target} is not eligible: {reason}")]
    IneligibleTarget { target: String, reason: String },

    #[error("compliance scanning is not enabled for {0}")]
    ScanNotEnabled(String),

    #[error("no runner available: {0}")]
    NoRunnerAvailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("runner '{runner}' unreachable: {reason}")]
    RunnerUnreachable { runner: String, reason: String },

    #[error("runner '{0}' is not registered")]
    RunnerNotRegistered(String),

    #[error("malformed {artifact} artifact: {reason}")]
    MalformedArtifact {
        artifact: &'static str,
        reason: String,
    },

    #[error("timed out waiting for parse task {0}")]
    ParseTimeout(String),

    #[error("parse task {task} ended with status {status}")]
    ParseFailed { task: String, status: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("task {task} cannot move from {from} to {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn ineligible(target: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::IneligibleTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Stable identifier for presentation layers.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::IneligibleTarget { .. } => "ineligible_target",
            CoreError::ScanNotEnabled(_) => "scan_not_enabled",
            CoreError::NoRunnerAvailable(_) => "no_runner_available",
            CoreError::Conflict(_) => "conflict",
            CoreError::RunnerUnreachable { .. } => "runner_unreachable",
            CoreError::RunnerNotRegistered(_) => "runner_not_registered",
            CoreError::MalformedArtifact { .. } => "malformed_artifact",
            CoreError::ParseTimeout(_) => "parse_timeout",
            CoreError::ParseFailed { .. } => "parse_failed",
            CoreError::NotFound { .. } => "not_found",
            CoreError::InvalidTransition { .. } => "invalid_transition",
            CoreError::InvalidRequest(_) => "invalid_request",
            CoreError::Storage(_) => "storage_error",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            CoreError::IneligibleTarget { .. }
            | CoreError::ScanNotEnabled(_)
            | CoreError::Conflict(_)
            | CoreError::NotFound { .. }
            | CoreError::InvalidTransition { .. }
            | CoreError::InvalidRequest(_) => Severity::BadRequest,
            CoreError::NoRunnerAvailable(_)
            | CoreError::RunnerUnreachable { .. }
            | CoreError::RunnerNotRegistered(_)
            | CoreError::MalformedArtifact { .. }
            | CoreError::ParseTimeout(_)
            | CoreError::ParseFailed { .. }
            | CoreError::Storage(_) => Severity::Internal,
        }
    }

    pub fn http_status(&self) -> u16 {
        self.severity().http_status()
    }
}
