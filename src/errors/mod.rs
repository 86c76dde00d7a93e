//! # Error Handling
//!
//! Error types for the credential lease manager, defined with `thiserror`.
//!
//! [`Error`] is `Clone`: a secret handler keeps the last fetch error next to the
//! cached secret and hands both out to every reader, so variants carry rendered
//! context strings rather than foreign error values.

use crate::secrets::SecretKind;

/// Result type for credlease operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the credential lease manager.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The credential kind was never enabled in the manager options.
    #[error("{kind} features are disabled. Set options.{option} to true and configure the required paths")]
    Disabled { kind: SecretKind, option: &'static str },

    /// A required key is missing from the secret payload.
    #[error("Invalid {secret} data: \"{key}\" not present in response data")]
    EmptyField { secret: SecretKind, key: &'static str },

    /// A payload key is present but is not a string.
    #[error("Invalid {secret} format: \"{key}\" is not a string")]
    InvalidFormat { secret: SecretKind, key: &'static str },

    /// TLS material could not be parsed.
    #[error("Invalid TLS certificate: {reason}")]
    InvalidCertificate { reason: String },

    /// A dependent fetch ran while no auth secret was available.
    #[error("Unauthenticated")]
    Unauthenticated,

    /// The authority returned no secret for the path.
    #[error("Secret was not found at '{path}'")]
    NotFound { path: String },

    /// The authority rejected the presented credentials or token.
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// Any other authority or transport failure.
    #[error("Authority request failed (status: {status:?}): {message}")]
    Authority { status: Option<u16>, message: String },

    /// The cached secret does not support in-place renewal.
    #[error("Secret is not renewable")]
    NotRenewable,

    /// Renewal was requested with nothing cached.
    #[error("Cannot renew a secret that was never fetched")]
    NoCachedSecret,

    /// The renewed lease would still expire within the minimum remaining window.
    #[error("Secret max lease time exceeded")]
    MaxLeaseExceeded,

    /// The resource client was closed.
    #[error("Client is closed")]
    Closed,

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Failure building or closing a resource on top of a credential.
    #[error("Resource error: {message}")]
    Resource { message: String },
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a new authority error
    pub fn authority<S: Into<String>>(status: Option<u16>, message: S) -> Self {
        Self::Authority { status, message: message.into() }
    }

    /// Create a new authentication error
    pub fn authentication_failed<S: Into<String>>(message: S) -> Self {
        Self::AuthenticationFailed { message: message.into() }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(path: S) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Create a certificate error
    pub fn invalid_certificate<S: Into<String>>(reason: S) -> Self {
        Self::InvalidCertificate { reason: reason.into() }
    }

    /// Create a resource error
    pub fn resource<S: Into<String>>(message: S) -> Self {
        Self::Resource { message: message.into() }
    }

    /// Whether a later attempt may succeed without any configuration change.
    ///
    /// Used to pick log levels; the auto-renew loop retries every failure.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Unauthenticated
            | Error::Authority { .. }
            | Error::AuthenticationFailed { .. }
            | Error::NotFound { .. }
            | Error::MaxLeaseExceeded
            | Error::NotRenewable
            | Error::NoCachedSecret
            | Error::Io { .. } => true,
            Error::Disabled { .. }
            | Error::EmptyField { .. }
            | Error::InvalidFormat { .. }
            | Error::InvalidCertificate { .. }
            | Error::Closed
            | Error::Config { .. }
            | Error::Serialization { .. }
            | Error::Resource { .. } => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Self::Authority { status: error.status().map(|s| s.as_u16()), message: error.to_string() }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { message: error.to_string() }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io { message: error.to_string() }
    }
}

impl From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Self::config(error.to_string())
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::config(format!("Validation failed: {}", errors))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        Self::resource(format!("Database error: {}", error))
    }
}

#[cfg(feature = "tls")]
impl From<rustls::Error> for Error {
    fn from(error: rustls::Error) -> Self {
        Self::resource(format!("TLS error: {}", error))
    }
}
