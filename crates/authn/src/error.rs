//! Authentication error types.
//!
//! This module defines the errors produced while extracting, verifying and
//! validating bearer tokens, the errors produced while fetching a JWKS
//! document, and configuration errors.
//!
//! Every [`AuthError`] is an authentication failure (HTTP 401 at the edge).
//! Failing an authorization check is not an error: it is an
//! [`AuthzDecision`](crate::authz::AuthzDecision) with `allow == false`.

use std::{fmt, sync::Arc};

use thiserror::Error;

/// A shared error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Authentication errors.
///
/// The specific variant is always preserved internally so it can be logged;
/// the [`gate`](crate::gate) decides how much of it reaches the caller.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`: new variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// No credentials were presented.
    #[error("Missing bearer credentials")]
    MissingCredentials,

    /// The token (or the header carrying it) is not well-formed.
    #[error("Malformed token: {message}")]
    Malformed {
        /// What was wrong with the token structure.
        message: String,
    },

    /// The token names a key id that the identity provider does not publish.
    #[error("Unknown signing key: {kid}")]
    UnknownKey {
        /// Key ID from the token header.
        kid: String,
    },

    /// The JWKS document could not be fetched. Retryable by a later request.
    #[error("Key fetch failed: {source}")]
    KeyFetch {
        /// The underlying fetch error.
        #[source]
        source: Arc<JwksError>,
    },

    /// The token's `exp` claim is in the past.
    #[error("Token expired")]
    Expired,

    /// The signature does not verify, or the declared algorithm is not allowed.
    #[error("Invalid signature: {message}")]
    InvalidSignature {
        /// Which signature check failed.
        message: String,
    },

    /// A registered claim is missing or does not match the expected value.
    #[error("Invalid claims: {message}")]
    InvalidClaims {
        /// Which claim check failed.
        message: String,
    },

    /// A token with this `jti` was already presented.
    #[error("Token replayed: {jti}")]
    Replayed {
        /// The replayed JWT ID.
        jti: String,
    },
}

impl AuthError {
    /// Creates a [`AuthError::Malformed`] error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed { message: message.into() }
    }

    /// Creates a [`AuthError::UnknownKey`] error.
    pub fn unknown_key(kid: impl Into<String>) -> Self {
        Self::UnknownKey { kid: kid.into() }
    }

    /// Creates a [`AuthError::KeyFetch`] error.
    pub fn key_fetch(source: impl Into<Arc<JwksError>>) -> Self {
        Self::KeyFetch { source: source.into() }
    }

    /// Creates a [`AuthError::Expired`] error.
    #[must_use]
    pub fn expired() -> Self {
        Self::Expired
    }

    /// Creates a [`AuthError::InvalidSignature`] error.
    pub fn invalid_signature(message: impl Into<String>) -> Self {
        Self::InvalidSignature { message: message.into() }
    }

    /// Creates a [`AuthError::InvalidClaims`] error.
    pub fn invalid_claims(message: impl Into<String>) -> Self {
        Self::InvalidClaims { message: message.into() }
    }

    /// Creates an [`AuthError::InvalidClaims`] error for a missing claim.
    pub fn missing_claim(claim: &str) -> Self {
        Self::InvalidClaims { message: format!("missing claim '{claim}'") }
    }

    /// Creates a [`AuthError::Replayed`] error.
    pub fn replayed(jti: impl Into<String>) -> Self {
        Self::Replayed { jti: jti.into() }
    }

    /// Returns the kind of this error, for logging and outcome mapping.
    #[must_use]
    pub fn kind(&self) -> AuthErrorKind {
        match self {
            Self::MissingCredentials => AuthErrorKind::MissingCredentials,
            Self::Malformed { .. } => AuthErrorKind::Malformed,
            Self::UnknownKey { .. } => AuthErrorKind::UnknownKey,
            Self::KeyFetch { .. } => AuthErrorKind::KeyFetch,
            Self::Expired => AuthErrorKind::Expired,
            Self::InvalidSignature { .. } => AuthErrorKind::InvalidSignature,
            Self::InvalidClaims { .. } => AuthErrorKind::InvalidClaims,
            Self::Replayed { .. } => AuthErrorKind::Replayed,
        }
    }

    /// Whether a later attempt with the same token may succeed.
    ///
    /// Only key fetch failures are retryable; every other failure is a
    /// property of the token itself.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::KeyFetch { .. })
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidToken
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => AuthError::malformed(format!("JWT error: {err}")),
            ErrorKind::InvalidSignature => AuthError::invalid_signature("signature mismatch"),
            ErrorKind::InvalidAlgorithm => {
                AuthError::invalid_signature("algorithm does not match the signing key")
            },
            ErrorKind::InvalidKeyFormat => AuthError::invalid_signature("unusable signing key"),
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::ImmatureSignature => AuthError::invalid_claims("token not yet valid"),
            ErrorKind::InvalidAudience => AuthError::invalid_claims("audience mismatch"),
            ErrorKind::InvalidIssuer => AuthError::invalid_claims("issuer mismatch"),
            _ => AuthError::invalid_signature(format!("JWT error: {err}")),
        }
    }
}

/// Copyable discriminant of [`AuthError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AuthErrorKind {
    /// No `Authorization` header, or not a bearer credential.
    MissingCredentials,
    /// Structurally invalid token or header.
    Malformed,
    /// Key id not published by the identity provider.
    UnknownKey,
    /// JWKS fetch failed.
    KeyFetch,
    /// Token expired.
    Expired,
    /// Signature or algorithm check failed.
    InvalidSignature,
    /// Claim check failed.
    InvalidClaims,
    /// Token replayed.
    Replayed,
}

impl AuthErrorKind {
    /// Stable snake_case label, suitable for log fields and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingCredentials => "missing_credentials",
            Self::Malformed => "malformed",
            Self::UnknownKey => "unknown_key",
            Self::KeyFetch => "key_fetch",
            Self::Expired => "expired",
            Self::InvalidSignature => "invalid_signature",
            Self::InvalidClaims => "invalid_claims",
            Self::Replayed => "replayed",
        }
    }
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while fetching or parsing a JWKS document.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JwksError {
    /// Transport-level failure talking to the JWKS endpoint.
    #[error("JWKS request to {url} failed: {message}")]
    Http {
        /// JWKS endpoint URL.
        url: String,
        /// Description of the failure.
        message: String,
        /// The underlying transport error.
        #[source]
        source: Option<BoxError>,
    },

    /// The fetch exceeded the configured timeout.
    #[error("JWKS request to {url} timed out")]
    Timeout {
        /// JWKS endpoint URL.
        url: String,
    },

    /// The endpoint answered with a non-success status.
    #[error("JWKS endpoint {url} returned HTTP {status}")]
    Status {
        /// JWKS endpoint URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// The body is not a JWKS document.
    #[error("JWKS document from {url} is malformed: {message}")]
    Parse {
        /// JWKS endpoint URL.
        url: String,
        /// Parser message.
        message: String,
    },

    /// The body exceeds the size limit.
    #[error("JWKS document from {url} exceeds {limit} bytes")]
    BodyTooLarge {
        /// JWKS endpoint URL.
        url: String,
        /// Maximum accepted body size.
        limit: usize,
    },

    /// Any other source failure.
    #[error("JWKS fetch failed: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl JwksError {
    /// Creates a [`JwksError::Internal`] error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }
}

/// Invalid configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[error("Invalid configuration for '{field}': {message}")]
    Invalid {
        /// Name of the offending option.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// The HTTP client for JWKS fetches could not be built.
    #[error("Failed to build JWKS HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

impl ConfigError {
    /// Creates a [`ConfigError::Invalid`] error.
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid { field, message: message.into() }
    }
}

/// Result type alias for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;
