//! Error taxonomy for the Kiln control plane.
//!
//! Every failure surfaced by the core falls into one of these kinds; the
//! HTTP front-end maps kinds to status codes and nothing is retried or
//! recovered inside the core. Variants carry owned strings so the error is
//! `Clone`, which lets coalesced build waiters share a single outcome.

use thiserror::Error;

/// Result type alias for platform operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the Kiln core.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{what} not found: {key}")]
    NotFound { what: &'static str, key: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("build failed: {message}")]
    Build {
        message: String,
        stack: Option<String>,
    },

    #[error("loader error: {0}")]
    Loader(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("operation canceled")]
    Canceled,
}

/// Classification of an [`Error`], used for status-code mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Build,
    Loader,
    Storage,
    Canceled,
}

impl Error {
    /// A `NotFound` error naming the missing entity kind and its key.
    pub fn not_found(what: &'static str, key: impl Into<String>) -> Self {
        Error::NotFound {
            what,
            key: key.into(),
        }
    }

    /// A `Build` error with no stack.
    pub fn build(message: impl Into<String>) -> Self {
        Error::Build {
            message: message.into(),
            stack: None,
        }
    }

    /// A `Storage` error from any displayable transport failure.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Error::Storage(err.to_string())
    }

    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Build { .. } => ErrorKind::Build,
            Error::Loader(_) => ErrorKind::Loader,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Canceled => ErrorKind::Canceled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_the_entity() {
        let err = Error::not_found("tenant", "acme");
        assert_eq!(err.to_string(), "tenant not found: acme");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn build_error_keeps_optional_stack() {
        let err = Error::Build {
            message: "unexpected token".to_string(),
            stack: Some("at src/index.ts:3".to_string()),
        };
        assert_eq!(err.kind(), ErrorKind::Build);
        assert!(err.to_string().contains("unexpected token"));
    }

    #[test]
    fn errors_are_cloneable() {
        let err = Error::Conflict("hostname already bound".to_string());
        let copy = err.clone();
        assert_eq!(copy.kind(), ErrorKind::Conflict);
    }
}
