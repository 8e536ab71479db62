// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for pgfleet-core.
//!
//! Provides a unified error type that maps to RPC error responses.

#![allow(dead_code)] // Variants and methods used in tests and for future expansion

use pgfleet_protocol::fleet_proto::RpcError;
use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while coordinating the fleet.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Database was not found on the given instance.
    DatabaseNotFound {
        /// The instance that was searched.
        instance: String,
        /// The database name that was not found.
        name: String,
    },

    /// Instance is not known to the registry.
    InstanceNotFound {
        /// The instance name.
        instance: String,
    },

    /// Instance is known but has no live agent connection.
    InstanceOffline {
        /// The instance name.
        instance: String,
    },

    /// The single-slot resend buffer for the instance is already occupied.
    DeliveryBusy {
        /// The instance name.
        instance: String,
    },

    /// Task was not found in the store.
    TaskNotFound {
        /// The task id.
        task_id: String,
    },

    /// The database name is reserved and cannot be managed.
    ReservedName {
        /// The rejected name.
        name: String,
    },

    /// A database with this name already exists under a different owner.
    OwnerMismatch {
        /// The database name.
        name: String,
        /// Owner recorded for the existing database.
        expected: String,
        /// Owner requested by the caller.
        actual: String,
    },

    /// The database is in a state where the requested action is not legal.
    IllegalTransition {
        /// The database name.
        name: String,
        /// The action that was attempted.
        action: String,
        /// Current lifecycle stage.
        stage: String,
        /// Current processing status.
        status: String,
    },

    /// The presented token could not be authenticated.
    Unauthenticated {
        /// Human-readable reason.
        reason: String,
    },

    /// The authenticated identity is not allowed to act on the resource.
    PermissionDenied {
        /// The authenticated subject.
        subject: String,
        /// The resource that was refused.
        resource: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// An action handler failed while executing against an instance.
    ExecutionFailed {
        /// The action that failed.
        action: String,
        /// Error details.
        details: String,
    },

    /// Waiting for a pushed task to complete timed out.
    DeliveryTimeout {
        /// The instance the task was pushed to.
        instance: String,
        /// The task id.
        task_id: String,
    },

    /// Store operation failed.
    StoreError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Wrapper marking an error that has already been logged at its origin.
    ///
    /// Callers up the stack propagate it without logging again.
    AlreadyLogged(Box<CoreError>),
}

impl CoreError {
    /// Convert this error to an RpcError for protocol responses.
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.error_code().to_string(),
            message: self.to_string(),
        }
    }

    /// Mark this error as already logged. Idempotent.
    pub fn logged(self) -> Self {
        match self {
            Self::AlreadyLogged(_) => self,
            other => Self::AlreadyLogged(Box::new(other)),
        }
    }

    /// Whether the error was already logged at its origin.
    pub fn is_logged(&self) -> bool {
        matches!(self, Self::AlreadyLogged(_))
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DatabaseNotFound { .. } => "DATABASE_NOT_FOUND",
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::InstanceOffline { .. } => "INSTANCE_OFFLINE",
            Self::DeliveryBusy { .. } => "DELIVERY_BUSY",
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::ReservedName { .. } => "RESERVED_NAME",
            Self::OwnerMismatch { .. } => "OWNER_MISMATCH",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::Unauthenticated { .. } => "UNAUTHENTICATED",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::ExecutionFailed { .. } => "EXECUTION_FAILED",
            Self::DeliveryTimeout { .. } => "DELIVERY_TIMEOUT",
            Self::StoreError { .. } => "STORE_ERROR",
            Self::AlreadyLogged(inner) => inner.error_code(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DatabaseNotFound { instance, name } => {
                write!(f, "Database '{}' not found on instance '{}'", name, instance)
            }
            Self::InstanceNotFound { instance } => {
                write!(f, "Instance '{}' is not registered", instance)
            }
            Self::InstanceOffline { instance } => {
                write!(f, "Instance '{}' has no connected agent", instance)
            }
            Self::DeliveryBusy { instance } => {
                write!(
                    f,
                    "Instance '{}' already has an undelivered task buffered",
                    instance
                )
            }
            Self::TaskNotFound { task_id } => {
                write!(f, "Task '{}' not found", task_id)
            }
            Self::ReservedName { name } => {
                write!(f, "Database name '{}' is reserved", name)
            }
            Self::OwnerMismatch {
                name,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Database '{}' is owned by '{}', not '{}'",
                    name, expected, actual
                )
            }
            Self::IllegalTransition {
                name,
                action,
                stage,
                status,
            } => {
                write!(
                    f,
                    "Action '{}' is not legal for database '{}' in stage '{}' with status '{}'",
                    action, name, stage, status
                )
            }
            Self::Unauthenticated { reason } => {
                write!(f, "Authentication failed: {}", reason)
            }
            Self::PermissionDenied { subject, resource } => {
                write!(f, "'{}' is not allowed to act on '{}'", subject, resource)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::ExecutionFailed { action, details } => {
                write!(f, "Action '{}' failed: {}", action, details)
            }
            Self::DeliveryTimeout { instance, task_id } => {
                write!(
                    f,
                    "Timed out waiting for task '{}' pushed to instance '{}'",
                    task_id, instance
                )
            }
            Self::StoreError { operation, details } => {
                write!(f, "Store error during '{}': {}", operation, details)
            }
            Self::AlreadyLogged(inner) => inner.fmt(f),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::StoreError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::StoreError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
