//! Server configuration module.
//!
//! Parses configuration from environment variables for the Rollcall server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `ROLLCALL_GATEWAY_TOKEN` | Yes* | - | Bearer token presented by the trusted gateway |
//! | `ROLLCALL_TOKEN_SIGNING_KEY` | No | - | Base64 32-byte Ed25519 seed for signed check-in tokens |
//! | `ROLLCALL_SWEEP_INTERVAL_SECS` | No | 60 | Auto-finalize sweep interval |
//! | `ROLLCALL_AUTO_FINALIZE` | No | true | Enable the auto-finalize sweep |
//! | `PORT` | No | 8080 | HTTP server port |
//! | `ROLLCALL_UNSAFE_NO_AUTH` | No | false | Trust identity headers without a gateway token (dev only) |
//!
//! *Not required if `ROLLCALL_UNSAFE_NO_AUTH=true`

use std::env;
use std::time::Duration;

use base64::prelude::*;
use thiserror::Error;
use tracing::warn;
use zeroize::Zeroizing;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default interval between auto-finalize sweeps.
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Length of an Ed25519 secret seed.
const SIGNING_SEED_LENGTH: usize = 32;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// Bearer token the trusted gateway sends with every request.
    pub gateway_token: Option<String>,

    /// Ed25519 seed used to sign participant check-in tokens.
    pub token_signing_seed: Option<[u8; SIGNING_SEED_LENGTH]>,

    /// HTTP server port.
    pub port: u16,

    /// Interval between auto-finalize sweeps.
    pub sweep_interval: Duration,

    /// Whether the auto-finalize sweep runs at all.
    pub auto_finalize: bool,

    /// When true, identity headers are trusted without a gateway token.
    pub unsafe_no_auth: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("gateway_token", &self.gateway_token.as_ref().map(|_| "<redacted>"))
            .field(
                "token_signing_seed",
                &self.token_signing_seed.as_ref().map(|_| "<redacted>"),
            )
            .field("port", &self.port)
            .field("sweep_interval", &self.sweep_interval)
            .field("auto_finalize", &self.auto_finalize)
            .field("unsafe_no_auth", &self.unsafe_no_auth)
            .finish()
    }
}

impl Default for Config {
    /// Development defaults: no gateway auth, unsigned tokens.
    fn default() -> Self {
        Self {
            gateway_token: None,
            token_signing_seed: None,
            port: DEFAULT_PORT,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            auto_finalize: true,
            unsafe_no_auth: true,
        }
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `ROLLCALL_GATEWAY_TOKEN` is missing while auth is enabled
    /// - The signing key is not base64 or not 32 bytes
    /// - Port or sweep interval are not valid numbers
    ///
    /// # Example
    ///
    /// ```no_run
    /// use rollcall_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let unsafe_no_auth = parse_bool_env("ROLLCALL_UNSAFE_NO_AUTH", false);
        let auto_finalize = parse_bool_env("ROLLCALL_AUTO_FINALIZE", true);
        let port = parse_port()?;
        let sweep_interval = parse_sweep_interval()?;
        let token_signing_seed = parse_signing_seed()?;
        let gateway_token = env::var("ROLLCALL_GATEWAY_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        let config = Self {
            gateway_token,
            token_signing_seed,
            port,
            sweep_interval,
            auto_finalize,
            unsafe_no_auth,
        };

        config.validate()?;

        if config.unsafe_no_auth {
            warn!(
                "ROLLCALL_UNSAFE_NO_AUTH is enabled - identity headers are trusted as-is. \
                 Do not use in production!"
            );
        }

        Ok(config)
    }

    /// Ensures a gateway token is configured unless `unsafe_no_auth` is set.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.unsafe_no_auth {
            return Ok(());
        }

        if self.gateway_token.is_none() {
            return Err(ConfigError::MissingEnvVar(
                "ROLLCALL_GATEWAY_TOKEN".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parse a boolean environment variable.
///
/// "true" and "false" are matched case-insensitively; unset or any other
/// value yields `default`.
fn parse_bool_env(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) if v.eq_ignore_ascii_case("true") => true,
        Ok(v) if v.eq_ignore_ascii_case("false") => false,
        _ => default,
    }
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse ROLLCALL_SWEEP_INTERVAL_SECS. Zero is rejected.
fn parse_sweep_interval() -> Result<Duration, ConfigError> {
    let raw = match env::var("ROLLCALL_SWEEP_INTERVAL_SECS") {
        Ok(s) if !s.trim().is_empty() => s,
        _ => return Ok(Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS)),
    };

    let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidFormat {
        var: "ROLLCALL_SWEEP_INTERVAL_SECS".to_string(),
        message: format!("expected a number of seconds, got '{raw}'"),
    })?;

    if secs == 0 {
        return Err(ConfigError::ValidationError(
            "ROLLCALL_SWEEP_INTERVAL_SECS must be greater than zero".to_string(),
        ));
    }

    Ok(Duration::from_secs(secs))
}

/// Parse ROLLCALL_TOKEN_SIGNING_KEY as a base64 32-byte seed.
fn parse_signing_seed() -> Result<Option<[u8; SIGNING_SEED_LENGTH]>, ConfigError> {
    let encoded = match env::var("ROLLCALL_TOKEN_SIGNING_KEY") {
        Ok(s) if !s.trim().is_empty() => Zeroizing::new(s),
        _ => return Ok(None),
    };

    let bytes = Zeroizing::new(BASE64_STANDARD.decode(encoded.trim()).map_err(|_| {
        ConfigError::InvalidFormat {
            var: "ROLLCALL_TOKEN_SIGNING_KEY".to_string(),
            message: "not valid base64".to_string(),
        }
    })?);

    let seed: [u8; SIGNING_SEED_LENGTH] =
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| ConfigError::InvalidFormat {
                var: "ROLLCALL_TOKEN_SIGNING_KEY".to_string(),
                message: format!(
                    "expected {SIGNING_SEED_LENGTH} bytes, got {}",
                    bytes.len()
                ),
            })?;

    Ok(Some(seed))
}
