use http::StatusCode;
use warp::reject::Reject;

/// The stable error taxonomy for the collector core. Every variant maps to
/// exactly one HTTP status so that handlers never have to decide on a status
/// code themselves -- they just propagate an `Error` and let
/// [`crate::router::handle_rejection`] translate it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not parse request: {0}")]
    Unparsable(String),
    #[error("invalid metadata: {0}")]
    InvalidMetaData(String),
    #[error("format version {0} is deprecated, current is {1}")]
    DeprecatedFormatVersion(i32, i32),
    #[error("format version {0} is unknown, current is {1}")]
    UnknownFormatVersion(i32, i32),
    #[error("declared upload size {declared} exceeds limit {limit}")]
    PayloadTooLarge { declared: u64, limit: u64 },
    #[error("measurement has only {0} locations, at least 2 are required")]
    TooFewLocations(u32),
    #[error("skipping upload: {0}")]
    SkipUpload(String),
    #[error("upload session is gone")]
    SessionExpired,
    #[error("unexpected content-range for current upload state")]
    UnexpectedContentRange,
    #[error("a measurement with this key is already stored")]
    Duplicate,
    #[error("server wrote {written} bytes but content-range declared {declared}")]
    ContentRangeNotMatchingFileSize { written: u64, declared: u64 },
    #[error("missing or invalid bearer token")]
    Unauthorized,
    #[error("principal is not allowed to perform this action")]
    Forbidden,
    #[error("storage backend failure: {0}")]
    StorageFailure(#[from] anyhow::Error),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Maps an error kind to the HTTP status the spec requires for it.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unparsable(_)
            | Error::InvalidMetaData(_)
            | Error::DeprecatedFormatVersion(_, _)
            | Error::UnknownFormatVersion(_, _)
            | Error::PayloadTooLarge { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::TooFewLocations(_) | Error::SkipUpload(_) => StatusCode::PRECONDITION_FAILED,
            Error::SessionExpired => StatusCode::NOT_FOUND,
            Error::UnexpectedContentRange => StatusCode::NOT_FOUND,
            Error::Duplicate => StatusCode::CONFLICT,
            Error::ContentRangeNotMatchingFileSize { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::StorageFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// A short machine-readable code, included in error response bodies so
    /// clients can distinguish error kinds that share an HTTP status.
    pub fn body_code(&self) -> &'static str {
        match self {
            Error::Unparsable(_) => "unparsable",
            Error::InvalidMetaData(_) => "invalid_metadata",
            Error::DeprecatedFormatVersion(_, _) => "deprecated_format_version",
            Error::UnknownFormatVersion(_, _) => "unknown_format_version",
            Error::PayloadTooLarge { .. } => "payload_too_large",
            Error::TooFewLocations(_) => "too_few_locations",
            Error::SkipUpload(_) => "skip_upload",
            Error::SessionExpired => "session_expired",
            Error::UnexpectedContentRange => "unexpected_content_range",
            Error::Duplicate => "duplicate",
            Error::ContentRangeNotMatchingFileSize { .. } => "content_range_mismatch",
            Error::Unauthorized => "unauthorized",
            Error::Forbidden => "forbidden",
            Error::StorageFailure(_) => "storage_failure",
            Error::Configuration(_) => "configuration",
        }
    }
}

/// This trait captures whether a given error reflects corruption in
/// client-provided data, in which case retrying is pointless, or a transient
/// problem such as a storage backend hiccup, in which case the client (or the
/// reaper, for on-disk cleanup) should retry.
pub trait ErrorClassification {
    fn is_retryable(&self) -> bool;
}

impl ErrorClassification for Error {
    fn is_retryable(&self) -> bool {
        matches!(self, Error::StorageFailure(_))
    }
}

/// Adapts [`Error`] to `warp`'s rejection machinery so it can flow through
/// filters without being boxed as `anyhow::Error`.
#[derive(Debug)]
pub struct Rejection(pub Error);

impl Reject for Rejection {}

impl From<Error> for warp::Rejection {
    fn from(error: Error) -> warp::Rejection {
        warp::reject::custom(Rejection(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(
            Error::Unparsable("x".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            Error::TooFewLocations(1).status_code(),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(Error::SessionExpired.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(Error::Duplicate.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            Error::ContentRangeNotMatchingFileSize {
                written: 1,
                declared: 2
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(Error::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn only_storage_failure_is_retryable() {
        assert!(Error::StorageFailure(anyhow::anyhow!("boom")).is_retryable());
        assert!(!Error::Duplicate.is_retryable());
        assert!(!Error::SessionExpired.is_retryable());
    }
}
