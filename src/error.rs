//! Error types for profile-unify.
//!
//! All errors are strongly typed using thiserror. Storage failures are
//! wrapped with the operation and profile id that observed them, so the
//! logged message always carries enough context to trace the call.

use thiserror::Error;

use crate::schema::ValueKind;
use crate::storage::StorageError;

/// Message surfaced to callers for every failure that is not client-facing.
pub const GENERIC_FAILURE_MESSAGE: &str = "Internal server error";

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Profile id cannot be empty")]
    EmptyProfileId,

    #[error("Property '{property}' is not declared by any enrichment rule")]
    UndeclaredProperty {
        property: String,
    },

    #[error("Property '{property}' must be a valid 'traits.<name>' or 'identity_attributes.<name>' path")]
    InvalidPropertyPath {
        property: String,
    },

    #[error("Property '{property}' expects a value of type {expected}, got {actual}")]
    TypeMismatch {
        property: String,
        expected: ValueKind,
        actual: String,
    },

    #[error("Profile update contains no fields")]
    EmptyUpdate,

    #[error("Invalid hierarchy operation: {reason}")]
    InvalidHierarchy {
        reason: String,
    },

    #[error("Invalid pattern: {reason}")]
    InvalidPattern {
        reason: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

fn last_error_suffix(last_error: &Option<StorageError>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(", last error: {e}"))
        .unwrap_or_default()
}

/// Execution errors that occur while running an operation against the
/// collaborators.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Could not acquire lock for profile {profile_id} after {attempts} attempts")]
    LockAcquisition {
        profile_id: String,
        attempts: u32,
    },

    #[error("Profile {profile_id} not visible after {attempts} attempts{}", last_error_suffix(.last_error))]
    VisibilityTimeout {
        profile_id: String,
        attempts: u32,
        last_error: Option<StorageError>,
    },

    #[error("Profile not found: {profile_id}")]
    ProfileNotFound {
        profile_id: String,
    },

    #[error("Storage failure during {operation} for profile {profile_id}: {source}")]
    Storage {
        operation: &'static str,
        profile_id: String,
        #[source]
        source: StorageError,
    },

    #[error("{operation} for profile {profile_id} was interrupted: {reason}")]
    Interrupted {
        operation: &'static str,
        profile_id: String,
        reason: String,
    },
}

impl ExecutionError {
    /// Wraps a storage error with the operation and profile it belongs to.
    pub fn storage(
        operation: &'static str,
        profile_id: impl Into<String>,
        source: StorageError,
    ) -> Self {
        Self::Storage {
            operation,
            profile_id: profile_id.into(),
            source,
        }
    }

    /// Creates a not-found error for `profile_id`.
    pub fn not_found(profile_id: impl Into<String>) -> Self {
        Self::ProfileNotFound {
            profile_id: profile_id.into(),
        }
    }
}

/// Top-level error type for profile-unify.
#[derive(Debug, Error)]
pub enum UnifyError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl UnifyError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if the requested profile does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::ProfileNotFound { .. }))
    }

    /// Returns true if the failure was caused by the caller's input and may
    /// be described to them verbatim.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        self.is_validation() || self.is_not_found()
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::LockAcquisition { .. } | ExecutionError::VisibilityTimeout { .. }
            ),
        }
    }

    /// Stable code identifying the error class.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "CDS-10001",
            Self::Execution(e) => match e {
                ExecutionError::ProfileNotFound { .. } => "CDS-10404",
                ExecutionError::LockAcquisition { .. } => "CDS-15001",
                ExecutionError::VisibilityTimeout { .. } => "CDS-15002",
                ExecutionError::Storage { .. } => "CDS-15003",
                ExecutionError::Interrupted { .. } => "CDS-15004",
            },
            Self::Internal { .. } => "CDS-15000",
        }
    }

    /// Message that is safe to hand to the caller.
    ///
    /// Client errors are described in full; server failures collapse into
    /// [`GENERIC_FAILURE_MESSAGE`] and must be logged by the caller.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(e) => e.to_string(),
            Self::Execution(e @ ExecutionError::ProfileNotFound { .. }) => e.to_string(),
            _ => GENERIC_FAILURE_MESSAGE.to_string(),
        }
    }
}

/// Result type alias for profile-unify operations.
pub type UnifyResult<T> = Result<T, UnifyError>;
