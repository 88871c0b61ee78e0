//! Error types for the kernel/vat protocol.

use thiserror::Error;

/// Errors from parsing reference and endpoint strings.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RefError {
    /// Empty reference string
    #[error("empty reference")]
    Empty,

    /// String is not a well-formed reference
    #[error("invalid reference {0:?}")]
    Invalid(String),

    /// Well-formed reference in the wrong namespace
    #[error("{reference} is not a {expected} reference")]
    WrongContext {
        reference: String,
        expected: &'static str,
    },

    /// String is not a well-formed endpoint id
    #[error("invalid endpoint id {0:?}")]
    InvalidEndpoint(String),
}

impl RefError {
    /// Create an invalid reference error.
    pub fn invalid(reference: impl Into<String>) -> Self {
        Self::Invalid(reference.into())
    }
}

/// Errors from encoding or decoding CapData bodies and stream frames.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MarshalError {
    /// Body does not carry the `#` prefix
    #[error("body is missing the '#' prefix")]
    MissingPrefix,

    /// Body or frame is not valid JSON
    #[error("malformed body: {0}")]
    Json(String),

    /// Body decodes to something other than `[method, args]`
    #[error("not a method call: {0}")]
    NotMethodCall(String),
}

impl From<serde_json::Error> for MarshalError {
    fn from(e: serde_json::Error) -> Self {
        MarshalError::Json(e.to_string())
    }
}

/// Errors from validating vat configuration records.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// None of `sourceSpec` / `bundleSpec` / `bundleName` was given
    #[error("vat config names no source; expected one of sourceSpec, bundleSpec, bundleName")]
    MissingSource,

    /// More than one source was given
    #[error("vat config names {0} sources; sourceSpec, bundleSpec and bundleName are mutually exclusive")]
    ConflictingSources(usize),
}
