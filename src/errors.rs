use thiserror::Error;

use crate::domain::{ActionType, ProposalState};

/// Error taxonomy returned by every workflow operation.
///
/// Validation failures carry enough structure (`field`, `missing`) for a UI to
/// render a field-level message. Only [`WorkflowError::ConcurrentModification`]
/// and [`WorkflowError::Timeout`] are worth retrying; everything else is final
/// for the request that produced it.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("Invalid transition: {action} is not permitted from {from}")]
    InvalidStateTransition {
        action: ActionType,
        from: ProposalState,
    },

    #[error("Precondition failed: {reason}")]
    PreconditionFailed {
        reason: String,
        field: Option<String>,
    },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Concurrent modification of proposal '{proposal_id}': expected version {expected}, found {actual}")]
    ConcurrentModification {
        proposal_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Evaluation form incomplete: missing {}", .missing.join(", "))]
    IncompleteForm { missing: Vec<String> },

    #[error("Council '{council_id}' is still referenced by {}", .proposals.join(", "))]
    InUse {
        council_id: String,
        proposals: Vec<String>,
    },

    #[error("'{evaluator_id}' is not eligible to evaluate proposal '{proposal_id}': {reason}")]
    NotEligible {
        proposal_id: String,
        evaluator_id: String,
        reason: String,
    },

    #[error("Storage operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl WorkflowError {
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        WorkflowError::Unauthorized {
            reason: reason.into(),
        }
    }

    pub fn precondition(reason: impl Into<String>) -> Self {
        WorkflowError::PreconditionFailed {
            reason: reason.into(),
            field: None,
        }
    }

    /// Precondition failure attributed to a single input field.
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        WorkflowError::PreconditionFailed {
            reason: reason.into(),
            field: Some(field.into()),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        WorkflowError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::ConcurrentModification { .. } | WorkflowError::Timeout { .. }
        )
    }

    /// Stable machine-readable code used by the API envelope.
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::Unauthorized { .. } => "UNAUTHORIZED",
            WorkflowError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            WorkflowError::PreconditionFailed { .. } => "PRECONDITION_FAILED",
            WorkflowError::NotFound { .. } => "NOT_FOUND",
            WorkflowError::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            WorkflowError::IncompleteForm { .. } => "INCOMPLETE_FORM",
            WorkflowError::InUse { .. } => "IN_USE",
            WorkflowError::NotEligible { .. } => "NOT_ELIGIBLE",
            WorkflowError::Timeout { .. } => "TIMEOUT",
            WorkflowError::Storage(_) => "STORAGE",
        }
    }

    /// Field the error should be rendered against, when there is one.
    pub fn field(&self) -> Option<&str> {
        match self {
            WorkflowError::PreconditionFailed { field, .. } => field.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowError::Storage(format!("serialization failed: {err}"))
    }
}

impl From<std::io::Error> for WorkflowError {
    fn from(err: std::io::Error) -> Self {
        WorkflowError::Storage(format!("I/O failed: {err}"))
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for WorkflowError {
    fn from(err: sqlx::Error) -> Self {
        WorkflowError::Storage(format!("database query failed: {err}"))
    }
}
