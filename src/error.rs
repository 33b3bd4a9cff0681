//! Error types for the volume broker
//!
//! Provides structured error types for the catalog, the driver registry,
//! the lifecycle controller, the state store and the cluster gateway.

use thiserror::Error;

/// Unified error type for the broker
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Catalog Errors
    // =========================================================================
    #[error("At least one service must be provided in the services config")]
    EmptyCatalog,

    #[error("Invalid service in services config at index {index}")]
    InvalidOffering { index: usize },

    #[error("Invalid services config: {0}")]
    CatalogParse(String),

    #[error("Service with ID {service_id} not found")]
    ServiceNotFound { service_id: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("instance does not exist: {instance_id}")]
    InstanceDoesNotExist { instance_id: String },

    #[error("binding does not exist: {binding_id}")]
    BindingDoesNotExist { binding_id: String },

    #[error("instance already exists: {instance_id}")]
    InstanceAlreadyExists { instance_id: String },

    #[error("binding already exists: {binding_id}")]
    BindingAlreadyExists { binding_id: String },

    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },

    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("The format of the parameters is not valid JSON: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Validation(String),

    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("Fingerprint decode error: {0}")]
    FingerprintDecode(String),

    // =========================================================================
    // Kubernetes / Backend Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Backend operation failed: {operation}: {reason}")]
    BackendOperationFailed { operation: String, reason: String },

    #[error("Driver connection to {address} failed: {reason}")]
    Transport { address: String, reason: String },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    #[error("Store error: {0}")]
    Persistence(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by the HTTP layer and by logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or empty catalog, bad flags; fatal at startup
    Configuration,
    /// Service, instance or binding absent
    NotFound,
    /// Identifier reused with different content
    Conflict,
    /// Malformed request parameters
    Validation,
    /// Cluster gateway or driver failure
    Backend,
    /// Store read/write/flush failure
    Persistence,
    /// Operation the broker does not implement
    Unsupported,
    Internal,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_)
            | Error::EmptyCatalog
            | Error::InvalidOffering { .. }
            | Error::CatalogParse(_) => ErrorKind::Configuration,

            Error::ServiceNotFound { .. }
            | Error::InstanceDoesNotExist { .. }
            | Error::BindingDoesNotExist { .. } => ErrorKind::NotFound,

            Error::InstanceAlreadyExists { .. } | Error::BindingAlreadyExists { .. } => {
                ErrorKind::Conflict
            }

            Error::InvalidRequest(_) | Error::Validation(_) | Error::CapacityParse(_) => {
                ErrorKind::Validation
            }

            Error::Kube(_) | Error::BackendOperationFailed { .. } | Error::Transport { .. } => {
                ErrorKind::Backend
            }

            Error::Persistence(_)
            | Error::FingerprintDecode(_)
            | Error::JsonParse(_)
            | Error::Io(_) => ErrorKind::Persistence,

            Error::Unsupported { .. } => ErrorKind::Unsupported,

            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if the caller could reasonably retry this request unchanged
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Backend | ErrorKind::Persistence)
    }
}

/// Result type alias for the broker
pub type Result<T> = std::result::Result<T, Error>;
