//! Crate-wide error taxonomy.
//!
//! Scheme- and component-local error enums (`auth::Error`, `reghttp::Error`,
//! `scheme::reg::Error`, `scheme::ocidir::Error`) carry the detail; this type
//! is what crosses the facade boundary so callers can match on a stable kind
//! while `#[source]` still chains back to the underlying cause.

use std::fmt;

use crate::{auth, reghttp, scheme};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden")]
    Forbidden,

    #[error("rate limited, retry after {retry_after_secs:?}s")]
    RateLimit { retry_after_secs: Option<u64> },

    #[error("retry needed")]
    RetryNeeded,

    #[error("backoff limit reached for host {host}")]
    BackoffLimit { host: String },

    #[error("all candidate URLs failed, last error: {0}")]
    AllRequestsFailed(String),

    #[error("operation canceled")]
    Canceled,

    #[error("digest mismatch: expected {expected}, got {got}")]
    DigestMismatch { expected: String, got: String },

    #[error("failed to parse {what}: {detail}")]
    ParsingFailed { what: &'static str, detail: String },

    #[error("invalid reference {0:?}")]
    InvalidReference(String),

    #[error("missing digest")]
    MissingDigest,

    #[error("missing tag")]
    MissingTag,

    #[error("reference has neither tag nor digest")]
    MissingTagOrDigest,

    #[error("response missing Location header")]
    MissingLocation,

    #[error("missing repository name")]
    MissingName,

    #[error("blob mount unexpectedly returned a Location header")]
    MountReturnedLocation,

    #[error("unsupported media type {0:?}")]
    UnsupportedMediaType(String),

    #[error("registry does not support the requested API")]
    UnsupportedAPI,

    #[error("unsupported image config version")]
    UnsupportedConfigVersion,

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("unexpected HTTP status {0}")]
    HTTPStatus(u16),

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("manifest not set on this reference")]
    ManifestNotSet,

    #[error("transport error")]
    Transport(#[source] Box<reghttp::Error>),

    #[error("authentication error")]
    Auth(#[source] Box<auth::Error>),

    #[error("registry scheme error")]
    Reg(#[source] Box<scheme::reg::Error>),

    #[error("ocidir scheme error")]
    OciDir(#[source] Box<scheme::ocidir::Error>),

    #[error("io error")]
    Io(#[source] Box<std::io::Error>),
}

impl From<reghttp::Error> for Error {
    fn from(e: reghttp::Error) -> Self {
        match e {
            reghttp::Error::BackoffLimit { host } => Error::BackoffLimit { host },
            reghttp::Error::AllRequestsFailed(detail) => Error::AllRequestsFailed(detail),
            reghttp::Error::Canceled => Error::Canceled,
            reghttp::Error::RateLimit { retry_after_secs } => {
                Error::RateLimit { retry_after_secs }
            }
            reghttp::Error::Auth(e) => Error::Auth(Box::new(e)),
            reghttp::Error::NotFound => Error::NotFound,
            e => Error::Transport(Box::new(e)),
        }
    }
}

impl From<auth::Error> for Error {
    fn from(e: auth::Error) -> Self {
        Error::Auth(Box::new(e))
    }
}

impl From<scheme::reg::Error> for Error {
    fn from(e: scheme::reg::Error) -> Self {
        use scheme::reg::Error as R;
        match e {
            R::NotFound => Error::NotFound,
            R::DigestMismatch { expected, got } => Error::DigestMismatch { expected, got },
            R::MissingLocation => Error::MissingLocation,
            R::MissingDigest => Error::MissingDigest,
            R::MissingTagOrDigest => Error::MissingTagOrDigest,
            R::MountReturnedLocation => Error::MountReturnedLocation,
            R::NotImplemented(s) => Error::NotImplemented(s),
            e => Error::Reg(Box::new(e)),
        }
    }
}

impl From<scheme::ocidir::Error> for Error {
    fn from(e: scheme::ocidir::Error) -> Self {
        use scheme::ocidir::Error as O;
        match e {
            O::NotFound => Error::NotFound,
            O::Io(e) => Error::Io(Box::new(e)),
            e => Error::OciDir(Box::new(e)),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Small helper used by scheme-local error enums: formats the enum's
/// `Debug` representation as its `Display`, so matching still works on the
/// concrete variant.
pub(crate) fn debug_display(e: &impl fmt::Debug, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}", e)
}
