//! Caller identity from the trusted gateway.
//!
//! Rollcall does not authenticate end users itself. An upstream gateway does,
//! then forwards each request with the verified identity in headers and a
//! shared bearer token proving the request came through it:
//!
//! - `Authorization: Bearer <gateway token>`
//! - `X-User-ID`: the authenticated user id (required)
//! - `X-User-Email`: the user's email (optional, used for invitee linking)
//!
//! The bearer token is compared in constant time.
//!
//! # Example
//!
//! ```rust
//! use rollcall_server::identity::{validate_token, AuthError};
//!
//! assert!(validate_token("secret-token", "secret-token").is_ok());
//! assert_eq!(
//!     validate_token("wrong-token", "secret-token"),
//!     Err(AuthError::InvalidToken)
//! );
//! ```

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config::Config;

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Header carrying the authenticated user's email.
pub const USER_EMAIL_HEADER: &str = "x-user-email";

/// Errors resolving the caller's identity.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No `Authorization: Bearer` header was supplied.
    #[error("missing gateway token")]
    MissingToken,

    /// The bearer token did not match the configured gateway token.
    #[error("invalid gateway token")]
    InvalidToken,

    /// The gateway did not forward a user id.
    #[error("missing user id")]
    MissingUserId,

    /// Authentication is enabled but no gateway token is configured.
    #[error("gateway token not configured")]
    NotConfigured,
}

impl AuthError {
    /// Returns `true` if this is the server's fault rather than the caller's.
    #[must_use]
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Self::NotConfigured)
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
}

impl Identity {
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Case-insensitive email comparison; `false` when either side is absent.
    #[must_use]
    pub fn email_matches(&self, other: Option<&str>) -> bool {
        match (self.email.as_deref(), other) {
            (Some(own), Some(other)) => own.eq_ignore_ascii_case(other),
            _ => false,
        }
    }
}

/// Compares a presented token with the expected one in constant time.
///
/// Tokens of different lengths are rejected without comparing contents.
pub fn validate_token(provided: &str, expected: &str) -> Result<(), AuthError> {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();

    if provided.len() != expected.len() {
        return Err(AuthError::InvalidToken);
    }

    if provided.ct_eq(expected).into() {
        Ok(())
    } else {
        Err(AuthError::InvalidToken)
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_value(headers, "authorization")?.strip_prefix("Bearer ")
}

/// Resolves the caller from gateway headers.
///
/// With `unsafe_no_auth` the bearer token is not checked, but a user id is
/// still required.
pub fn identity_from_headers(headers: &HeaderMap, config: &Config) -> Result<Identity, AuthError> {
    if !config.unsafe_no_auth {
        let expected = config
            .gateway_token
            .as_deref()
            .ok_or(AuthError::NotConfigured)?;
        let provided = bearer_token(headers).ok_or(AuthError::MissingToken)?;
        validate_token(provided, expected)?;
    }

    let user_id = header_value(headers, USER_ID_HEADER).ok_or(AuthError::MissingUserId)?;
    let identity = Identity::new(user_id);
    Ok(match header_value(headers, USER_EMAIL_HEADER) {
        Some(email) => identity.with_email(email),
        None => identity,
    })
}
