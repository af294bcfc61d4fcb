use thiserror::Error;

/// Kina shim error types.
///
/// Backend failures are classified into this taxonomy at the lifecycle
/// manager boundary; the protocol layer translates each variant to exactly
/// one gRPC status code, so callers always see CRI-conformant semantics.
#[derive(Error, Debug)]
pub enum ShimError {
    /// Malformed or incomplete request
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown sandbox/container/image identifier
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Duplicate create for an identifier that already exists
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    /// Request requires a capability the VM-per-pod model cannot provide
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Backend service unreachable; retryable by the caller
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend rejected the unit configuration
    #[error("Invalid backend spec: {0}")]
    InvalidSpec(String),

    /// Record is not in the lifecycle state the operation requires
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Bounded backend operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Unexpected backend response shape or internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ShimError {
    fn from(err: serde_json::Error) -> Self {
        ShimError::Serialization(err.to_string())
    }
}

impl ShimError {
    /// Shorthand for a NotFound over a sandbox ID.
    pub fn sandbox_not_found(id: impl Into<String>) -> Self {
        ShimError::NotFound {
            kind: "sandbox",
            id: id.into(),
        }
    }

    /// Shorthand for a NotFound over a container ID.
    pub fn container_not_found(id: impl Into<String>) -> Self {
        ShimError::NotFound {
            kind: "container",
            id: id.into(),
        }
    }

    /// Shorthand for a NotFound over an image reference.
    pub fn image_not_found(reference: impl Into<String>) -> Self {
        ShimError::NotFound {
            kind: "image",
            id: reference.into(),
        }
    }
}

/// Result type alias for kina shim operations.
pub type Result<T> = std::result::Result<T, ShimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_display() {
        let error = ShimError::InvalidArgument("sandbox config required".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid argument: sandbox config required"
        );
    }

    #[test]
    fn test_not_found_display() {
        let error = ShimError::sandbox_not_found("sb-1");
        assert_eq!(error.to_string(), "sandbox not found: sb-1");
    }

    #[test]
    fn test_already_exists_display() {
        let error = ShimError::AlreadyExists {
            kind: "sandbox",
            id: "default/web".to_string(),
        };
        assert_eq!(error.to_string(), "sandbox already exists: default/web");
    }

    #[test]
    fn test_unsupported_display() {
        let error = ShimError::Unsupported("multi-container pods".to_string());
        assert_eq!(error.to_string(), "Unsupported: multi-container pods");
    }

    #[test]
    fn test_backend_unavailable_display() {
        let error = ShimError::BackendUnavailable("connection refused".to_string());
        assert_eq!(error.to_string(), "Backend unavailable: connection refused");
    }

    #[test]
    fn test_timeout_display() {
        let error = ShimError::Timeout("inspect exceeded 10s".to_string());
        assert_eq!(error.to_string(), "Timeout: inspect exceeded 10s");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "socket missing");
        let error: ShimError = io_error.into();
        assert!(matches!(error, ShimError::Io(_)));
        assert!(error.to_string().contains("socket missing"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> =
            serde_json::from_str("{ not json }");
        let error: ShimError = result.unwrap_err().into();
        assert!(matches!(error, ShimError::Serialization(_)));
    }

    #[test]
    fn test_container_not_found_helper() {
        let error = ShimError::container_not_found("c-1");
        assert!(matches!(
            error,
            ShimError::NotFound {
                kind: "container",
                ..
            }
        ));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_err() -> Result<()> {
            Err(ShimError::Internal("boom".to_string()))
        }
        assert!(returns_err().is_err());
    }
}
