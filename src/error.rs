//! Error types for the braidhttp transport.
//!
//! One error enum covers the whole crate. Each variant maps onto an HTTP
//! status code via [`Error::status`], which is what the request handlers use
//! when turning a failure into a plain-text error response.

use axum::http::StatusCode;
use thiserror::Error;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the transport or the subsystems it mediates.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An outbound HTTP request returned a non-200 status. Carries both the
    /// status and whatever the remote put in the body.
    #[error("http request errored: ({status}) {body}")]
    Http { status: u16, body: String },

    /// Network or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed input from a remote: bad hex, bad header, bad range, bad
    /// patch line. Always maps to a 400.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A signed cookie was present but failed to parse or verify.
    #[error("bad cookie: {0}")]
    BadCookie(String),

    /// The named cookie was absent from the request. Distinct from
    /// [`Error::BadCookie`] so callers can treat "absent" as a non-error.
    #[error("no cookie: {0}")]
    NoCookie(String),

    /// Resource does not exist: unknown state URI, unknown tx, keypath miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// The subscription ACL denied access.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Signer recovery failed or the signature does not match.
    #[error("bad signature")]
    BadSignature,

    /// Key store failure (signing, verification, user-data persistence).
    #[error("keystore error: {0}")]
    KeyStore(String),

    /// Attempted to dial one of the node's own URLs.
    #[error("peer is self")]
    PeerIsSelf,

    /// The operation is not supported by this transport.
    #[error("unimplemented")]
    Unimplemented,

    /// Anything unexpected: resolver faults, crypto plumbing, lost channels.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The HTTP status this error maps to when it escapes a request handler.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) | Error::BadCookie(_) | Error::BadSignature => {
                StatusCode::BAD_REQUEST
            }
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) | Error::NoCookie(_) => StatusCode::NOT_FOUND,
            Error::Unimplemented => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True if this is the "absent cookie" marker rather than a real failure.
    pub fn is_no_cookie(&self) -> bool {
        matches!(self, Error::NoCookie(_))
    }

    /// True if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Internal(format!("http client: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_request_maps_400() {
        assert_eq!(
            Error::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::BadSignature.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_not_found_maps_404() {
        assert_eq!(Error::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_forbidden_maps_403() {
        assert_eq!(Error::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_internal_maps_500() {
        assert_eq!(
            Error::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_no_cookie_is_distinguishable() {
        assert!(Error::NoCookie("address".into()).is_no_cookie());
        assert!(!Error::BadCookie("address".into()).is_no_cookie());
    }
}
