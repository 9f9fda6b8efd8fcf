//! Error types for the Rollcall server.
//!
//! Business-rule outcomes (expired tokens, unassigned coaches, and so on) are
//! not errors here; they travel as [`crate::lifecycle::LifecycleResult`]
//! values. This module covers the failures that are genuinely unexpected.
//!
//! # Error Types
//!
//! - [`StoreError`] - Record store failures
//! - [`ServerError`] - Top-level server errors encompassing all failure modes

use std::error::Error;
use std::fmt;

use thiserror::Error as ThisError;

use crate::config::ConfigError;

/// Errors raised by a [`crate::store::RecordStore`] implementation.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A document with this id already exists.
    #[error("{kind} '{id}' already exists")]
    Conflict {
        /// Document kind ("appointment", "participant").
        kind: &'static str,
        /// The conflicting document id.
        id: String,
    },

    /// The store's internal lock was poisoned by a panicking writer.
    #[error("record store lock poisoned")]
    Poisoned,

    /// The backing store could not be reached or rejected the operation.
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Creates a new conflict error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use rollcall_server::error::StoreError;
    ///
    /// let err = StoreError::conflict("appointment", "a-1");
    /// assert_eq!(err.to_string(), "appointment 'a-1' already exists");
    /// ```
    pub fn conflict(kind: &'static str, id: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            id: id.into(),
        }
    }

    /// Creates a new unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// A specialized Result type for record store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Top-level error type for the Rollcall server.
///
/// # Error Categories
///
/// - **Configuration errors**: Problems loading or validating server config
/// - **Authentication errors**: Missing or invalid gateway credentials
/// - **Validation errors**: Malformed request data
/// - **Store errors**: Record store failures surfaced outside a lifecycle call
/// - **Internal errors**: Unexpected failures that don't fit other categories
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during server initialization.
    Config(ConfigError),

    /// Authentication failure at the gateway boundary.
    Auth(String),

    /// Request validation failure.
    Validation(String),

    /// Record store failure.
    Store(StoreError),

    /// Unexpected internal server error.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Auth(msg) => write!(f, "authentication failed: {msg}"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::Store(err) => write!(f, "store error: {err}"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl ServerError {
    /// Creates a new authentication error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use rollcall_server::error::ServerError;
    ///
    /// let err = ServerError::auth("missing gateway token");
    /// assert!(matches!(err, ServerError::Auth(_)));
    /// ```
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// Creates a new validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Validation(_))
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Internal(_) | Self::Config(_) | Self::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_conflict_displays_correctly() {
        let err = StoreError::conflict("participant", "p-9");
        assert_eq!(err.to_string(), "participant 'p-9' already exists");
    }

    #[test]
    fn store_error_unavailable_displays_correctly() {
        let err = StoreError::unavailable("connection refused");
        assert_eq!(
            err.to_string(),
            "record store unavailable: connection refused"
        );
    }

    #[test]
    fn server_error_store_displays_correctly() {
        let err = ServerError::from(StoreError::Poisoned);
        assert_eq!(err.to_string(), "store error: record store lock poisoned");
    }

    #[test]
    fn server_error_config_wraps_config_error() {
        let err: ServerError = ConfigError::MissingEnvVar("ROLLCALL_GATEWAY_TOKEN".into()).into();
        assert!(matches!(err, ServerError::Config(_)));
        assert!(err.is_server_error());
        assert_eq!(
            err.to_string(),
            "configuration error: missing required environment variable: ROLLCALL_GATEWAY_TOKEN"
        );
    }

    #[test]
    fn is_client_error_returns_true_for_client_errors() {
        assert!(ServerError::auth("bad token").is_client_error());
        assert!(ServerError::validation("bad input").is_client_error());
        assert!(!ServerError::internal("oops").is_client_error());
        assert!(!ServerError::Store(StoreError::Poisoned).is_client_error());
    }

    #[test]
    fn server_error_source_returns_inner_error() {
        let err = ServerError::Store(StoreError::Poisoned);
        let source = err.source().expect("store error has a source");
        assert_eq!(source.to_string(), "record store lock poisoned");

        assert!(ServerError::auth("test").source().is_none());
        assert!(ServerError::internal("test").source().is_none());
    }
}
