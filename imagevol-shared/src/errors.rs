//! Error types used across imagevol.

use thiserror::Error;

/// Result type for imagevol operations.
pub type ImagevolResult<T> = Result<T, ImagevolError>;

/// Every failure imagevol can report.
///
/// Payloads are plain strings carrying the volume ID and operation name, so
/// the enum stays `Clone` and one outcome can be handed to several waiters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImagevolError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("runtime connection error: {0}")]
    Connection(String),

    #[error("image pull error: {0}")]
    ImagePull(String),

    #[error("sandbox create error: {0}")]
    SandboxCreate(String),

    #[error("extraction error: {0}")]
    Extraction(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("mount error: {0}")]
    Mount(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("gRPC/tonic error: {0}")]
    Rpc(String),

    #[error("gRPC transport error: {0}")]
    RpcTransport(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ImagevolError {
    /// Whether the caller may retry the same request unchanged.
    ///
    /// Only malformed requests and configuration errors need the caller to
    /// change something first.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ImagevolError::InvalidArgument(_) | ImagevolError::Config(_)
        )
    }

    /// Short stable name of the error kind, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            ImagevolError::InvalidArgument(_) => "invalid_argument",
            ImagevolError::Config(_) => "config",
            ImagevolError::Connection(_) => "connection",
            ImagevolError::ImagePull(_) => "image_pull",
            ImagevolError::SandboxCreate(_) => "sandbox_create",
            ImagevolError::Extraction(_) => "extraction",
            ImagevolError::Timeout(_) => "timeout",
            ImagevolError::Mount(_) => "mount",
            ImagevolError::Conflict(_) => "conflict",
            ImagevolError::Rpc(_) => "rpc",
            ImagevolError::RpcTransport(_) => "rpc_transport",
            ImagevolError::Internal(_) => "internal",
        }
    }
}

// Implement From for common error types to enable `?` operator
impl From<std::io::Error> for ImagevolError {
    fn from(err: std::io::Error) -> Self {
        ImagevolError::Internal(format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for ImagevolError {
    fn from(err: serde_json::Error) -> Self {
        ImagevolError::Config(format!("JSON error: {}", err))
    }
}

impl From<String> for ImagevolError {
    fn from(err: String) -> Self {
        ImagevolError::Internal(err)
    }
}

impl From<&str> for ImagevolError {
    fn from(err: &str) -> Self {
        ImagevolError::Internal(err.to_string())
    }
}

impl From<tonic::Status> for ImagevolError {
    fn from(err: tonic::Status) -> Self {
        ImagevolError::Rpc(err.to_string())
    }
}

impl From<tonic::transport::Error> for ImagevolError {
    fn from(err: tonic::transport::Error) -> Self {
        ImagevolError::RpcTransport(err.to_string())
    }
}

/// CSI status mapping. The code alone tells the caller whether to retry.
impl From<ImagevolError> for tonic::Status {
    fn from(err: ImagevolError) -> Self {
        let message = err.to_string();
        match err {
            ImagevolError::InvalidArgument(_) => tonic::Status::invalid_argument(message),
            ImagevolError::Conflict(_) => tonic::Status::aborted(message),
            ImagevolError::Timeout(_) => tonic::Status::deadline_exceeded(message),
            ImagevolError::Connection(_) | ImagevolError::RpcTransport(_) => {
                tonic::Status::unavailable(message)
            }
            ImagevolError::Config(_)
            | ImagevolError::ImagePull(_)
            | ImagevolError::SandboxCreate(_)
            | ImagevolError::Extraction(_)
            | ImagevolError::Mount(_)
            | ImagevolError::Rpc(_)
            | ImagevolError::Internal(_) => tonic::Status::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_status_codes() {
        let cases = [
            (ImagevolError::InvalidArgument("x".into()), Code::InvalidArgument),
            (ImagevolError::Conflict("x".into()), Code::Aborted),
            (ImagevolError::Timeout("x".into()), Code::DeadlineExceeded),
            (ImagevolError::Connection("x".into()), Code::Unavailable),
            (ImagevolError::ImagePull("x".into()), Code::Internal),
            (ImagevolError::Extraction("x".into()), Code::Internal),
            (ImagevolError::Mount("x".into()), Code::Internal),
        ];

        for (err, code) in cases {
            let status: tonic::Status = err.into();
            assert_eq!(status.code(), code);
        }
    }

    #[test]
    fn test_status_keeps_message() {
        let status: tonic::Status =
            ImagevolError::Extraction("volume v1: container exited with code 2".into()).into();
        assert!(status.message().contains("volume v1"));
        assert!(status.message().contains("code 2"));
    }

    #[test]
    fn test_retryable() {
        assert!(!ImagevolError::InvalidArgument("x".into()).is_retryable());
        assert!(!ImagevolError::Config("x".into()).is_retryable());
        assert!(ImagevolError::Timeout("x".into()).is_retryable());
        assert!(ImagevolError::Conflict("x".into()).is_retryable());
        assert!(ImagevolError::Mount("x".into()).is_retryable());
    }

    #[test]
    fn test_io_error_is_internal() {
        let err: ImagevolError = std::io::Error::other("disk gone").into();
        assert_eq!(err.kind(), "internal");
        assert!(err.to_string().contains("disk gone"));
    }
}
