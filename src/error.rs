//! Error kinds for the router manager and their HTTP mapping

use hyper::StatusCode;
use serde::Serialize;
use std::io;
use thiserror::Error;

/// Every failure the manager can report to a caller.
#[derive(Error, Debug)]
pub enum ManagerError {
    /// Endpoint fields violate their constraints
    #[error("Invalid endpoint: {0}")]
    Validation(String),

    /// Endpoint kind is not accepted by the active backend
    #[error("Endpoint kind not supported: {0}")]
    KindNotSupported(String),

    /// An endpoint with the same (kind, place, argument) already exists
    #[error("Duplicate endpoint: {0}")]
    DuplicateIdentity(String),

    /// An endpoint with the same name already exists
    #[error("Duplicate endpoint name: {0}")]
    DuplicateName(String),

    /// No such endpoint
    #[error("Endpoint not found: {0}")]
    NotFound(String),

    /// Endpoint is protected against user removal or disabling
    #[error("Endpoint is protected: {0}")]
    Protected(String),

    /// Master kind is not accepted by the active backend
    #[error("Master endpoint kind not supported: {0}")]
    BadMasterKind(String),

    /// No master endpoint configured
    #[error("No master endpoint: {0}")]
    NoMaster(String),

    /// No usable router backend was found
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The router exited while settling
    #[error("Router failed to start (exit code {code:?}): {stderr}")]
    StartFailure {
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// Operation not allowed while the router is desired to run
    #[error("Busy: {0}")]
    Busy(String),

    /// Settings file was written by a newer version
    #[error("Settings version {found} is newer than supported version {supported}")]
    SettingsVersionFuture {
        /// Version found in the file
        found: u32,
        /// Highest version this build understands
        supported: u32,
    },

    /// A migration step could not transform the document
    #[error("Settings migration from version {from} failed: {reason}")]
    SettingsMigrationFailed {
        /// Version the failing step started from
        from: u32,
        /// Reason for failure
        reason: String,
    },

    /// Settings file cannot be parsed
    #[error("Malformed settings: {0}")]
    SettingsMalformed(String),

    /// File system errors (settings file, log directory)
    #[error("I/O error at '{path}': {source}")]
    Io {
        /// Path involved in the failure
        path: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Other unexpected errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Type alias for Results that use ManagerError
pub type Result<T> = std::result::Result<T, ManagerError>;

impl ManagerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Machine-readable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            ManagerError::Validation(_) => ErrorCode::Validation,
            ManagerError::KindNotSupported(_) => ErrorCode::KindNotSupported,
            ManagerError::DuplicateIdentity(_) => ErrorCode::DuplicateIdentity,
            ManagerError::DuplicateName(_) => ErrorCode::DuplicateName,
            ManagerError::NotFound(_) => ErrorCode::NotFound,
            ManagerError::Protected(_) => ErrorCode::Protected,
            ManagerError::BadMasterKind(_) => ErrorCode::BadMasterKind,
            ManagerError::NoMaster(_) => ErrorCode::NoMaster,
            ManagerError::BackendUnavailable(_) => ErrorCode::BackendUnavailable,
            ManagerError::StartFailure { .. } => ErrorCode::StartFailure,
            ManagerError::Busy(_) => ErrorCode::Busy,
            ManagerError::SettingsVersionFuture { .. } => ErrorCode::SettingsVersionFuture,
            ManagerError::SettingsMigrationFailed { .. } => ErrorCode::SettingsMigrationFailed,
            ManagerError::SettingsMalformed(_) => ErrorCode::SettingsMalformed,
            ManagerError::Io { .. } | ManagerError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

/// Error codes exposed to API clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    KindNotSupported,
    DuplicateIdentity,
    DuplicateName,
    NotFound,
    Protected,
    BadMasterKind,
    NoMaster,
    BackendUnavailable,
    StartFailure,
    Busy,
    SettingsVersionFuture,
    SettingsMigrationFailed,
    SettingsMalformed,
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::Validation
            | ErrorCode::KindNotSupported
            | ErrorCode::BadMasterKind
            | ErrorCode::NoMaster => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::DuplicateIdentity | ErrorCode::DuplicateName | ErrorCode::Busy => {
                StatusCode::CONFLICT
            }
            ErrorCode::Protected => StatusCode::FORBIDDEN,
            ErrorCode::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::StartFailure
            | ErrorCode::SettingsVersionFuture
            | ErrorCode::SettingsMigrationFailed
            | ErrorCode::SettingsMalformed
            | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"message":"{}","status":{}}}"#,
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

impl From<&ManagerError> for ErrorResponse {
    fn from(err: &ManagerError) -> Self {
        ErrorResponse::new(err.code(), err.to_string())
    }
}
