//! CRI-specific error conversions.

use kina_core::error::ShimError;
use tonic::Status;

/// Convert a ShimError to a gRPC Status.
pub fn shim_error_to_status(err: ShimError) -> Status {
    match err {
        ShimError::InvalidArgument(msg) => Status::invalid_argument(msg),
        ShimError::NotFound { .. } => Status::not_found(err.to_string()),
        ShimError::AlreadyExists { .. } => Status::already_exists(err.to_string()),
        ShimError::Unsupported(msg) => Status::unimplemented(msg),
        ShimError::BackendUnavailable(msg) => Status::unavailable(msg),
        ShimError::InvalidSpec(msg) => Status::invalid_argument(msg),
        ShimError::FailedPrecondition(msg) => Status::failed_precondition(msg),
        ShimError::Timeout(msg) => Status::deadline_exceeded(msg),
        other => Status::internal(other.to_string()),
    }
}
