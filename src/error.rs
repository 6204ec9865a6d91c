use axum::http::StatusCode;
use thiserror::Error;

/// Service-wide error taxonomy. Every failure that crosses a component
/// boundary is one of these; handlers translate them into HTTP responses
/// and the upload JSON envelope.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("{0}")]
    NotFound(NotFoundKind),
    #[error("{0}")]
    Validation(ValidationKind),
    #[error("{0}")]
    Transform(TransformKind),
    #[error("{0}")]
    Storage(StorageKind),
    #[error("{0}")]
    Config(ConfigKind),
}

#[derive(Debug, Error)]
pub enum NotFoundKind {
    #[error("image not found")]
    PatternMismatch,
    #[error("not found")]
    PathTraversal,
    #[error("size not found")]
    SizeNotAllowed,
    #[error("original file not found")]
    OriginalMissing,
}

#[derive(Debug, Error)]
pub enum ValidationKind {
    #[error("unsupported image format, allowed: {0}")]
    BadExtension(String),
    #[error("uploaded image is too large")]
    TooLarge,
    #[error("uploaded image file is missing")]
    TransportFault,
    #[error("bad parameter: {0}")]
    BadParameterSyntax(String),
    #[error("illegal upload directory")]
    IllegalDirectory,
}

#[derive(Debug, Error)]
pub enum TransformKind {
    #[error("format does not support this transform: {0}")]
    UnsupportedFormat(String),
    #[error("image engine failure: {0}")]
    EngineFault(String),
}

#[derive(Debug, Error)]
pub enum StorageKind {
    #[error("could not allocate a free upload path")]
    AllocationExhausted,
    #[error("could not move uploaded image into place: {0}")]
    MoveFailed(String),
    #[error("remote storage API failure: {0}")]
    RemoteApiFault(String),
}

#[derive(Debug, Error)]
pub enum ConfigKind {
    #[error("unknown storage backend: {0}")]
    UnknownBackend(String),
    #[error("invalid crop mode: {0}")]
    InvalidCropMode(u32),
    #[error("storage root directory is missing: {0}")]
    MissingRoot(String),
    #[error("missing credentials for backend: {0}")]
    MissingCredentials(String),
}

impl ImageError {
    /// Application status code carried in the upload response envelope.
    /// Codes follow the historical numbering of the service this replaces.
    pub fn status(&self) -> u16 {
        match self {
            ImageError::NotFound(_) => 404,
            ImageError::Validation(kind) => match kind {
                ValidationKind::TooLarge => 412,
                ValidationKind::TransportFault => 411,
                _ => 400,
            },
            ImageError::Transform(kind) => match kind {
                TransformKind::UnsupportedFormat(_) => 400,
                TransformKind::EngineFault(_) => 511,
            },
            ImageError::Storage(kind) => match kind {
                StorageKind::AllocationExhausted => 555,
                StorageKind::MoveFailed(_) => 515,
                StorageKind::RemoteApiFault(_) => 550,
            },
            ImageError::Config(kind) => match kind {
                ConfigKind::InvalidCropMode(_) => 414,
                _ => 510,
            },
        }
    }

    /// HTTP status for plain (non-envelope) responses.
    pub fn http_status(&self) -> StatusCode {
        match self {
            ImageError::NotFound(_) => StatusCode::NOT_FOUND,
            ImageError::Validation(ValidationKind::TooLarge) => StatusCode::PAYLOAD_TOO_LARGE,
            ImageError::Validation(_) => StatusCode::BAD_REQUEST,
            ImageError::Transform(TransformKind::UnsupportedFormat(_)) => StatusCode::BAD_REQUEST,
            ImageError::Transform(_) | ImageError::Storage(_) | ImageError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
