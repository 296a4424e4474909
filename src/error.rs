//! Error types for the multishare reconciler
//!
//! Every failure is classified as transient (skip the object, retry next
//! pass), a data anomaly (skip the object, never auto-fix) or fatal (abort the
//! pass or process startup).

use thiserror::Error;

// =============================================================================
// Status Codes
// =============================================================================

/// Canonical status codes carried by backend errors.
///
/// Mirrors the gRPC canonical codes so provisioning workflows upstream of the
/// reconciler can decide whether to retry without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    Unimplemented,
    Internal,
    Unavailable,
    Unauthenticated,
}

impl StatusCode {
    /// Map an HTTP status to the closest canonical code
    pub fn from_http(status: u16) -> Self {
        match status {
            400 => StatusCode::InvalidArgument,
            401 => StatusCode::Unauthenticated,
            403 => StatusCode::PermissionDenied,
            404 => StatusCode::NotFound,
            409 => StatusCode::Aborted,
            412 => StatusCode::FailedPrecondition,
            429 => StatusCode::ResourceExhausted,
            499 => StatusCode::Cancelled,
            501 => StatusCode::Unimplemented,
            502 | 503 => StatusCode::Unavailable,
            504 => StatusCode::DeadlineExceeded,
            500..=599 => StatusCode::Internal,
            _ => StatusCode::Unknown,
        }
    }

    /// Whether an operation failing with this code is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StatusCode::Unavailable
                | StatusCode::ResourceExhausted
                | StatusCode::DeadlineExceeded
                | StatusCode::Aborted
                | StatusCode::Internal
        )
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Error
// =============================================================================

/// Unified error type for the reconciler
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
    // Desired-State Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Version conflict writing {kind}/{name}")]
    Conflict { kind: String, name: String },

    #[error("Watch cache did not complete its initial sync")]
    CacheSyncFailed,

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Temporary backend error ({code}): {message}")]
    Temporary { code: StatusCode, message: String },

    #[error("Backend error ({code}): {message}")]
    Backend { code: StatusCode, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Identity and Naming Errors
    // =========================================================================
    #[error("Invalid {kind} name {name:?}: {reason}")]
    InvalidName {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("Cannot resolve region from location {location:?}")]
    RegionResolution { location: String },

    // =========================================================================
    // Data Anomalies
    // =========================================================================
    #[error("Anomaly on {kind}/{name}: {reason}")]
    Anomaly {
        kind: String,
        name: String,
        reason: String,
    },

    // =========================================================================
    // Placement Errors
    // =========================================================================
    #[error("Share {share} has no instance pool tag")]
    PoolTagMissing { share: String },

    #[error("Share {share} has no region")]
    RegionMissing { share: String },

    #[error("No storage class carries pool tag {pool_tag:?}")]
    NoStorageClass { pool_tag: String },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the reconciler treats an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Skip the object for this pass, it is re-derived next pass
    Transient,
    /// Skip the object and surface the error, never repair automatically
    Anomaly,
    /// Abort the pass or process startup
    Fatal,
}

impl Error {
    /// Wrap a backend failure as temporary
    pub fn temporary(code: StatusCode, message: impl Into<String>) -> Self {
        Error::Temporary {
            code,
            message: message.into(),
        }
    }

    /// Build a backend error, wrapping it as temporary when the code is retryable
    pub fn from_backend(code: StatusCode, message: impl Into<String>) -> Self {
        if code.is_retryable() {
            Error::temporary(code, message)
        } else {
            Error::Backend {
                code,
                message: message.into(),
            }
        }
    }

    /// Build a data anomaly error
    pub fn anomaly(kind: &str, name: &str, reason: impl Into<String>) -> Self {
        Error::Anomaly {
            kind: kind.to_string(),
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::CacheSyncFailed
            | Error::RegionResolution { .. }
            | Error::Configuration(_) => ErrorClass::Fatal,

            Error::Anomaly { .. }
            | Error::InvalidName { .. }
            | Error::PoolTagMissing { .. }
            | Error::RegionMissing { .. } => ErrorClass::Anomaly,

            _ => ErrorClass::Transient,
        }
    }

    /// Canonical status code for callers upstream of the reconciler
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Temporary { code, .. } | Error::Backend { code, .. } => *code,
            Error::Conflict { .. } => StatusCode::Aborted,
            Error::ResourceNotFound { .. } => StatusCode::NotFound,
            Error::ResourceExists { .. } => StatusCode::AlreadyExists,
            Error::Kube(kube::Error::Api(resp)) => StatusCode::from_http(resp.code),
            Error::Kube(_) | Error::Http(_) => StatusCode::Unavailable,
            Error::CacheSyncFailed => StatusCode::DeadlineExceeded,
            Error::PoolTagMissing { .. }
            | Error::RegionMissing { .. }
            | Error::InvalidName { .. }
            | Error::Configuration(_) => StatusCode::InvalidArgument,
            Error::Anomaly { .. } | Error::NoStorageClass { .. } => {
                StatusCode::FailedPrecondition
            }
            _ => StatusCode::Internal,
        }
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Temporary { .. }
            | Error::Conflict { .. }
            | Error::Kube(_)
            | Error::Http(_) => true,
            Error::Backend { .. } => false,
            _ => self.class() == ErrorClass::Transient && self.status_code().is_retryable(),
        }
    }

    /// Check if this error is retryable by a caller
    pub fn is_retryable(&self) -> bool {
        self.class() != ErrorClass::Anomaly && self.class() != ErrorClass::Fatal
    }
}

/// Result type alias for the reconciler
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(Error::CacheSyncFailed.class(), ErrorClass::Fatal);
        assert_eq!(
            Error::RegionResolution {
                location: "nowhere".into()
            }
            .class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            Error::anomaly("InstanceInfo", "a", "two finalizers").class(),
            ErrorClass::Anomaly
        );
        assert_eq!(
            Error::Conflict {
                kind: "ShareInfo".into(),
                name: "pvc-1".into()
            }
            .class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_temporary_wrapper() {
        let err = Error::from_backend(StatusCode::Unavailable, "backend down");
        assert!(matches!(err, Error::Temporary { .. }));
        assert!(err.is_transient());
        assert_eq!(err.status_code(), StatusCode::Unavailable);

        let err = Error::from_backend(StatusCode::PermissionDenied, "no access");
        assert!(matches!(err, Error::Backend { .. }));
        assert!(!err.is_transient());
        assert_eq!(err.status_code(), StatusCode::PermissionDenied);
    }

    #[test]
    fn test_status_code_from_http() {
        assert_eq!(StatusCode::from_http(429), StatusCode::ResourceExhausted);
        assert_eq!(StatusCode::from_http(503), StatusCode::Unavailable);
        assert_eq!(StatusCode::from_http(500), StatusCode::Internal);
        assert_eq!(StatusCode::from_http(404), StatusCode::NotFound);
        assert_eq!(StatusCode::from_http(418), StatusCode::Unknown);
        assert_eq!(format!("{}", StatusCode::ResourceExhausted), "RESOURCE_EXHAUSTED");
    }

    #[test]
    fn test_error_retryable() {
        let conflict = Error::Conflict {
            kind: "InstanceInfo".into(),
            name: "p.us-central1.fs-1".into(),
        };
        assert!(conflict.is_retryable());
        assert!(conflict.is_transient());

        let anomaly = Error::anomaly("InstanceInfo", "x", "nil status");
        assert!(!anomaly.is_retryable());
        assert!(!anomaly.is_transient());
    }
}
