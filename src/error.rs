//! Error types for the udev device plugin
//!
//! Provides structured error types for every agent subsystem: device bus
//! discovery, kubelet registration, device plugin protocol serving,
//! configuration and the status surface.

use std::fmt;
use thiserror::Error;

/// Unified error type for the agent
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Device Bus Errors
    // =========================================================================
    #[error("Device event source unavailable: {reason}")]
    SourceUnavailable { reason: String },

    #[error("Device event source closed")]
    SourceClosed,

    #[error("Malformed uevent: {0}")]
    MalformedEvent(String),

    // =========================================================================
    // Registry / Allocation Errors
    // =========================================================================
    #[error("Insufficient devices in pool {pool}: requested {requested}, available {available}")]
    InsufficientDevices {
        pool: String,
        requested: usize,
        available: usize,
    },

    #[error("Devices not available in pool {pool}: {}", ids.join(", "))]
    DevicesUnavailable { pool: String, ids: Vec<String> },

    #[error("Unknown pool: {pool}")]
    UnknownPool { pool: String },

    #[error("Allocation not found: {id}")]
    AllocationNotFound { id: String },

    #[error("Timed out waiting for the registry lock on pool {pool}")]
    ReserveTimeout { pool: String },

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    #[error("Device plugin for pool {pool} is not ready (state: {state})")]
    NotReady { pool: String, state: String },

    #[error("Registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Device plugin endpoint for pool {pool} failed: {reason}")]
    Endpoint { pool: String, reason: String },

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Pod resources query failed: {0}")]
    PodResources(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Invalid glob pattern {pattern}: {reason}")]
    Pattern { pattern: String, reason: String },

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while announcing a plugin endpoint to the kubelet
#[derive(Error, Debug)]
pub enum RegistrationError {
    /// The kubelet could not be reached or did not answer in time
    #[error("kubelet registration unavailable: {0}")]
    Unavailable(String),

    /// The kubelet answered and refused the registration
    #[error("kubelet rejected registration of {resource}: {message}")]
    Rejected { resource: String, message: String },
}

impl RegistrationError {
    /// Only explicit rejections are permanent
    pub fn is_permanent(&self) -> bool {
        matches!(self, RegistrationError::Rejected { .. })
    }
}

// =============================================================================
// Triage
// =============================================================================

/// Agent subsystem an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    DeviceBus,
    Registration,
    Protocol,
    Configuration,
    Status,
    Internal,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subsystem::DeviceBus => write!(f, "device-bus"),
            Subsystem::Registration => write!(f, "registration"),
            Subsystem::Protocol => write!(f, "protocol"),
            Subsystem::Configuration => write!(f, "configuration"),
            Subsystem::Status => write!(f, "status"),
            Subsystem::Internal => write!(f, "internal"),
        }
    }
}

/// Action to take when an error reaches a supervising task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry the operation with exponential backoff
    RetryWithBackoff,
    /// Hand the error back to the caller, nothing to retry locally
    ReturnToCaller,
    /// The agent cannot continue
    Exit,
}

impl Error {
    /// Subsystem responsible for this error
    pub fn subsystem(&self) -> Subsystem {
        match self {
            Error::SourceUnavailable { .. } | Error::SourceClosed | Error::MalformedEvent(_) => {
                Subsystem::DeviceBus
            }
            Error::Registration(_) => Subsystem::Registration,
            Error::InsufficientDevices { .. }
            | Error::DevicesUnavailable { .. }
            | Error::UnknownPool { .. }
            | Error::ReserveTimeout { .. }
            | Error::NotReady { .. }
            | Error::Endpoint { .. }
            | Error::Transport(_)
            | Error::PodResources(_) => Subsystem::Protocol,
            Error::Configuration(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_)
            | Error::Pattern { .. } => Subsystem::Configuration,
            Error::AllocationNotFound { .. } | Error::Metrics(_) => Subsystem::Status,
            Error::Internal(_) | Error::Io(_) => Subsystem::Internal,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Endpoint { .. }
            | Error::Transport(_)
            | Error::PodResources(_)
            | Error::Io(_) => ErrorAction::RetryWithBackoff,
            Error::Registration(e) if !e.is_permanent() => ErrorAction::RetryWithBackoff,

            // Expected protocol outcomes - surfaced to the kubelet as-is
            Error::InsufficientDevices { .. }
            | Error::DevicesUnavailable { .. }
            | Error::UnknownPool { .. }
            | Error::ReserveTimeout { .. }
            | Error::NotReady { .. }
            | Error::AllocationNotFound { .. }
            | Error::MalformedEvent(_) => ErrorAction::ReturnToCaller,

            // Fatal: no discovery, refused protocol version, bad config
            Error::SourceUnavailable { .. }
            | Error::SourceClosed
            | Error::Registration(_)
            | Error::Configuration(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_)
            | Error::Pattern { .. }
            | Error::Metrics(_)
            | Error::Internal(_) => ErrorAction::Exit,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.action(), ErrorAction::RetryWithBackoff)
    }

    /// Check if the agent must stop
    pub fn is_fatal(&self) -> bool {
        matches!(self.action(), ErrorAction::Exit)
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::InsufficientDevices { .. } | Error::DevicesUnavailable { .. } => {
                tonic::Status::resource_exhausted(message)
            }
            Error::NotReady { .. } | Error::ReserveTimeout { .. } => {
                tonic::Status::unavailable(message)
            }
            Error::UnknownPool { .. } | Error::AllocationNotFound { .. } => {
                tonic::Status::not_found(message)
            }
            _ => tonic::Status::internal(message),
        }
    }
}

/// Result type alias for the agent
pub type Result<T> = std::result::Result<T, Error>;
